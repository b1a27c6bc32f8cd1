use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tunnel_watcher::config::{Cli, WatcherConfig};
use tunnel_watcher::gateway::{self, StreamHandler, TunnelStreamHandler};
use tunnel_watcher::logging;
use tunnel_watcher::supervisor::{ProcessSupervisor, SupervisorConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config()).context("failed to initialize logging")?;

    let config = match WatcherConfig::from_cli(&cli) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "cannot start tunnel watcher");
            std::process::exit(1);
        }
    };

    info!("starting Greengrass secure tunneling notification watcher");

    let supervisor = Arc::new(ProcessSupervisor::new(SupervisorConfig::from(&config)));
    let handler: Arc<dyn StreamHandler> = Arc::new(TunnelStreamHandler::new(supervisor));
    let topic = config.notify_topic();

    tokio::select! {
        result = gateway::subscribe(&config.notify_ws_url, &topic, handler) => {
            result.with_context(|| format!("subscription to {topic} failed"))?;
            info!("notification stream ended");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
    }

    Ok(())
}
