use crate::logging::{LogConfig, LogLevel};
use clap::{Args, Parser};
use std::env;
use std::path::PathBuf;
use thiserror::Error;

pub const THING_NAME_ENV: &str = "AWS_IOT_THING_NAME";

#[derive(Parser, Debug)]
#[command(
    name = "tunnel-watcher",
    about = "Greengrass secure-tunneling notification watcher",
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "GG_NOTIFY_WS_URL",
        default_value = "ws://127.0.0.1:8033/subscribe",
        help = "WebSocket endpoint of the local notification broker"
    )]
    pub notify_ws_url: String,

    #[arg(
        long,
        env = "TUNNEL_AGENT_BINARY",
        default_value = "/app/aws-iot-device-client",
        help = "Path to the tunnel agent executable"
    )]
    pub agent_binary: PathBuf,

    #[arg(
        long,
        env = "TUNNEL_WORK_DIR",
        default_value = ".",
        help = "Directory the agent config artifacts are written to"
    )]
    pub work_dir: PathBuf,

    #[arg(
        long,
        env = "TUNNEL_LOCK_DIR",
        default_value = "/app/lock/",
        help = "Agent lock/state directory, reset before every launch"
    )]
    pub lock_dir: PathBuf,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "TUNNEL_WATCHER_LOG_LEVEL",
        default_value_t = LogLevel::Info,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "TUNNEL_WATCHER_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing {THING_NAME_ENV}; are you running as a Greengrass component?")]
    MissingThingName,
}

/// Resolved watcher configuration. The thing name comes from the Greengrass
/// component environment and is required; everything else has defaults.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub thing_name: String,
    pub notify_ws_url: String,
    pub agent_binary: PathBuf,
    pub work_dir: PathBuf,
    pub lock_dir: PathBuf,
}

impl WatcherConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let thing_name = env::var(THING_NAME_ENV)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or(ConfigError::MissingThingName)?;

        Ok(Self {
            thing_name,
            notify_ws_url: cli.notify_ws_url.clone(),
            agent_binary: cli.agent_binary.clone(),
            work_dir: cli.work_dir.clone(),
            lock_dir: cli.lock_dir.clone(),
        })
    }

    /// Topic the tunnel notifications for this thing arrive on.
    pub fn notify_topic(&self) -> String {
        format!("$aws/things/{}/tunnels/notify", self.thing_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use serial_test::serial;

    fn cli() -> Cli {
        Cli::parse_from(["tunnel-watcher"])
    }

    #[test]
    #[serial]
    fn missing_thing_name_is_rejected() {
        std::env::remove_var(THING_NAME_ENV);
        assert!(matches!(
            WatcherConfig::from_cli(&cli()),
            Err(ConfigError::MissingThingName)
        ));
    }

    #[test]
    #[serial]
    fn topic_derived_from_thing_name() {
        std::env::set_var(THING_NAME_ENV, "TestDevice");
        let config = WatcherConfig::from_cli(&cli()).expect("thing name set");
        assert_eq!(
            config.notify_topic(),
            "$aws/things/TestDevice/tunnels/notify"
        );
        std::env::remove_var(THING_NAME_ENV);
    }
}
