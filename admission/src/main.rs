mod errors;
mod metrics;
mod routes;
mod secret;
mod server;

use anyhow::Result;
use clap::Parser;
use tokio::{
    select,
    signal::unix::{signal, SignalKind},
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
struct Config {
    /// Turn debug logs on
    #[arg(long)]
    debug: bool,

    #[clap(flatten)]
    server: server::Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    let default_level = if config.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(format!("greenhouse_admission={default_level},info")))?,
        )
        .init();

    info!("Starting admission webhook");
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    select! {
        _ = sigterm.recv() => {
            warn!("SIGTERM received, exiting");
            Ok(())
        }

        _ = sigint.recv() => {
            warn!("SIGINT received, exiting");
            Ok(())
        }

        result = server::serve(config.server) => {
            warn!("Webhook server finished");
            result
        }
    }
}
