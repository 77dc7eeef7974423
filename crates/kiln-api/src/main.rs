//! Kiln master entrypoint.
//!
//! Wires the configuration, result store, worker registry, scheduler, and
//! dispatcher together, then serves the HTTP and WebSocket surface until a
//! shutdown signal arrives.

use clap::Parser;
use kiln_api::config::MasterConfig;
use kiln_api::state::AppState;
use kiln_core::builder::BuilderSet;
use kiln_core::ports::{EventBus, ResultStore};
use kiln_db::{Database, SqliteResultStore};
use kiln_scheduler::bus::LocalEventBus;
use kiln_scheduler::{ChangeIngest, Dispatcher, Scheduler, WorkerRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kiln-master")]
#[command(author, version, about = "Kiln CI build master", long_about = None)]
struct Cli {
    /// Path to the master configuration file.
    #[arg(short, long, default_value = "kiln.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let cli = Cli::parse();
    let config = Arc::new(MasterConfig::from_file(&cli.config)?);
    info!(config = %cli.config.display(), title = %config.title, "starting master");

    let builders = Arc::new(BuilderSet::from_configs(config.builders.clone())?);
    let database = Database::connect(&config.db_url).await?;
    database.migrate().await?;

    let store: Arc<dyn ResultStore> = Arc::new(SqliteResultStore::new(database.pool().clone()));
    let event_bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::default());
    let registry = Arc::new(WorkerRegistry::new(&config.worker_credential));
    let dispatcher = Arc::new(Dispatcher::new(
        builders.clone(),
        registry.clone(),
        store.clone(),
        event_bus.clone(),
        config.dispatch.to_dispatch_config(),
    ));
    let scheduler = Arc::new(Scheduler::new(builders.clone(), dispatcher.clone()));
    let ingest = Arc::new(ChangeIngest::new(scheduler.clone(), event_bus.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatch_loop = tokio::spawn(dispatcher.clone().run(shutdown_rx));

    let state = Arc::new(AppState {
        config: config.clone(),
        builders,
        registry,
        dispatcher,
        scheduler,
        ingest,
        store,
        event_bus,
    });

    let app = kiln_api::build_app(state);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, builders = config.builders.len(), "master listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    let _ = dispatch_loop.await;
    info!("master stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
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
