use anyhow::Result;
use clap::Parser;
use greenhouse_controller::config::Config;
use greenhouse_controller::context::Context;
use greenhouse_controller::{registry, server};
use tokio::{
    select,
    signal::unix::{signal, SignalKind},
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    let default_level = if config.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env().or_else(|_| {
                EnvFilter::try_new(format!("greenhouse_controller={default_level},info"))
            })?,
        )
        .init();

    let controllers = registry::select(&config.controllers)?;
    info!(?controllers, "Starting greenhouse controller");
    let metrics_port = config.metrics_port;
    let ctx = Context::new(kube::Client::try_default().await?, config);

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

        result = server::serve(metrics_port) => {
            warn!("Metrics server finished");
            result
        }

        result = futures::future::try_join_all(
            controllers.into_iter().map(|kind| kind.run(ctx.clone()))
        ) => {
            warn!("Controllers finished");
            result.map(|_| ())
        }
    }
}
