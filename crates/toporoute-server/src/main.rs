//! Entry point for a Toporoute coordinator node.

use clap::Parser;
use tracing::info;

use toporoute_server::{
    cli::{Cli, load_configuration},
    metrics,
    runtime::NodeRuntime,
    startup::{self, LoggingConfig, ShutdownSignal},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let configuration = load_configuration(&cli)?;

    let _logging_guard = startup::init_logging(&LoggingConfig::from_configuration(&configuration))?;

    if let Ok(listen) = configuration.config.get_string("toporoute.metrics.listen") {
        metrics::install_prometheus(&listen)?;
    }
    metrics::init_metrics();

    let config = configuration.coordinator_config()?;
    info!(
        service = %config.service,
        registry = %config.registry_prefix(),
        topics = config.topics.len(),
        nodes = cli.nodes,
        "Starting toporoute"
    );

    let shutdown = ShutdownSignal::new();
    let mut shutdown_rx = shutdown.subscribe();
    startup::spawn_signal_listener(shutdown.clone());

    let runtime = NodeRuntime::start(config, cli.nodes).await?;
    let _ = shutdown_rx.recv().await;

    runtime.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}
