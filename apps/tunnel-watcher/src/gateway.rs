use crate::event::{self, ValidationError};
use crate::supervisor::ProcessSupervisor;
use async_trait::async_trait;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("websocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("failed to encode subscribe frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Callback interface driven by the subscription collaborator. One object,
/// three fixed entry points; payload delivery happens synchronously per
/// message on the subscription task.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn on_stream_event(&self, payload: &[u8]);
    /// Returns true when the subscription should close.
    async fn on_stream_error(&self, error: GatewayError) -> bool;
    async fn on_stream_closed(&self);
}

/// Forwards each notification payload through validation into the
/// supervisor. Rejections are logged here and never propagate upstream.
pub struct TunnelStreamHandler {
    supervisor: Arc<ProcessSupervisor>,
}

impl TunnelStreamHandler {
    pub fn new(supervisor: Arc<ProcessSupervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl StreamHandler for TunnelStreamHandler {
    async fn on_stream_event(&self, payload: &[u8]) {
        info!("new tunnel event received");
        match event::validate(payload) {
            Ok(request) => self.supervisor.handle_request(request).await,
            Err(err @ ValidationError::MalformedPayload(_)) => {
                error!(
                    error = %err,
                    payload = %String::from_utf8_lossy(payload),
                    "invalid tunnel event payload"
                );
            }
            Err(err) => error!(error = %err, "rejected tunnel event"),
        }
    }

    async fn on_stream_error(&self, error: GatewayError) -> bool {
        error!(error = %error, "notification stream error");
        true
    }

    async fn on_stream_closed(&self) {
        info!("notification stream closed");
    }
}

#[derive(Serialize)]
struct SubscribeFrame<'a> {
    action: &'a str,
    topic: &'a str,
    qos: u8,
}

/// Published notification as delivered by the local broker. The payload is
/// carried base64-encoded so arbitrary bytes survive the JSON envelope.
#[derive(Deserialize)]
struct Envelope {
    #[allow(dead_code)]
    topic: String,
    payload: String,
}

/// Subscribes to `topic` on the broker websocket and pumps published
/// payloads into the handler until the stream closes or the handler asks to
/// stop. The subscription transport is the only external channel surface.
pub async fn subscribe(
    ws_url: &str,
    topic: &str,
    handler: Arc<dyn StreamHandler>,
) -> Result<(), GatewayError> {
    let (ws_stream, _) = connect_async(ws_url).await?;
    let (mut sender, mut receiver) = ws_stream.split();

    let subscribe = serde_json::to_string(&SubscribeFrame {
        action: "subscribe",
        topic,
        qos: 1,
    })?;
    sender.send(Message::Text(subscribe.into())).await?;
    info!(topic, "subscribed, waiting for notifications");

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => deliver(text.as_bytes(), handler.as_ref()).await,
            Ok(Message::Binary(bytes)) => deliver(&bytes, handler.as_ref()).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                if handler.on_stream_error(GatewayError::Transport(err)).await {
                    break;
                }
            }
        }
    }

    handler.on_stream_closed().await;
    Ok(())
}

async fn deliver(frame: &[u8], handler: &dyn StreamHandler) {
    let envelope: Envelope = match serde_json::from_slice(frame) {
        Ok(envelope) => envelope,
        Err(err) => {
            // Acks and other broker chatter land here.
            debug!(error = %err, "ignoring non-publish frame");
            return;
        }
    };
    match base64::engine::general_purpose::STANDARD.decode(&envelope.payload) {
        Ok(payload) => handler.on_stream_event(&payload).await,
        Err(err) => warn!(error = %err, "dropping notification with undecodable payload"),
    }
}
