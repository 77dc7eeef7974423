//! Kiln worker entrypoint.

use clap::Parser;
use kiln_worker::config::WorkerConfig;
use kiln_worker::connection::WorkerConnection;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "kiln-worker")]
#[command(author, version, about = "Kiln CI build worker", long_about = None)]
struct Cli {
    /// Path to the worker configuration file.
    #[arg(short, long, default_value = "worker.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let cli = Cli::parse();
    let config = WorkerConfig::from_file(&cli.config)?;
    info!(name = %config.name, master = %config.master_url, "starting worker");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let connection = WorkerConnection::new(config);
    connection.run(shutdown_rx).await;

    info!("worker stopped");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
