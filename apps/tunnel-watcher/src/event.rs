use serde::Deserialize;
use thiserror::Error;

/// A validated tunnel notification. Constructed only by [`validate`]; the
/// full `services` sequence is carried so that an empty sequence surfaces
/// as a launch-time construction failure, not a validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    pub region: String,
    pub services: Vec<String>,
    pub access_token: String,
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("malformed tunnel event payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),
    #[error("incomplete tunnel event: missing {field}")]
    IncompleteEvent { field: &'static str },
}

#[derive(Debug, Deserialize)]
struct RawNotification {
    region: Option<String>,
    services: Option<Vec<String>>,
    #[serde(rename = "clientAccessToken")]
    client_access_token: Option<String>,
}

/// Parses and validates a raw notification payload.
///
/// Extra fields in the payload are ignored. Missing required fields are
/// reported in a fixed order (`region`, `services`, `clientAccessToken`) so
/// the first omission names the rejection.
pub fn validate(payload: &[u8]) -> Result<TunnelRequest, ValidationError> {
    let raw: RawNotification = serde_json::from_slice(payload)?;

    let region = raw
        .region
        .ok_or(ValidationError::IncompleteEvent { field: "region" })?;
    let services = raw
        .services
        .ok_or(ValidationError::IncompleteEvent { field: "services" })?;
    let access_token = raw.client_access_token.ok_or(ValidationError::IncompleteEvent {
        field: "clientAccessToken",
    })?;

    Ok(TunnelRequest {
        region,
        services,
        access_token,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_payload() {
        let request = validate(
            br#"{"region":"eu-west-1","services":["SSH"],"clientAccessToken":"tok123"}"#,
        )
        .expect("payload validates");
        assert_eq!(request.region, "eu-west-1");
        assert_eq!(request.services, vec!["SSH".to_string()]);
        assert_eq!(request.access_token, "tok123");
    }

    #[test]
    fn extra_fields_ignored() {
        let request = validate(
            br#"{"region":"r","services":["a","b"],"clientAccessToken":"t","extra":42}"#,
        )
        .expect("payload validates");
        assert_eq!(request.services.len(), 2);
    }

    #[test]
    fn empty_services_sequence_passes_validation() {
        // The supervisor rejects this at command synthesis, not here.
        let request =
            validate(br#"{"region":"r","services":[],"clientAccessToken":"t"}"#).unwrap();
        assert!(request.services.is_empty());
    }

    #[test]
    fn garbage_payloads_are_malformed() {
        for payload in [&b""[..], b"foobar", b"{", b"[1,2,3"] {
            match validate(payload) {
                Err(ValidationError::MalformedPayload(_)) => {}
                other => panic!("expected malformed payload, got {other:?}"),
            }
        }
    }

    #[test]
    fn services_must_be_a_string_sequence() {
        let result = validate(br#"{"region":"r","services":"SSH","clientAccessToken":"t"}"#);
        assert!(matches!(result, Err(ValidationError::MalformedPayload(_))));
    }

    #[test]
    fn missing_fields_named_in_order() {
        let cases: [(&[u8], &str); 4] = [
            (br#"{"foo":"bar"}"#, "region"),
            (br#"{"services":["SSH"],"clientAccessToken":"t"}"#, "region"),
            (br#"{"region":"r","clientAccessToken":"t"}"#, "services"),
            (br#"{"region":"r","services":["SSH"]}"#, "clientAccessToken"),
        ];
        for (payload, expected) in cases {
            match validate(payload) {
                Err(ValidationError::IncompleteEvent { field }) => assert_eq!(field, expected),
                other => panic!("expected incomplete event, got {other:?}"),
            }
        }
    }
}
