//! Application state shared across handlers.

use crate::config::MasterConfig;
use kiln_core::builder::BuilderSet;
use kiln_core::ports::{EventBus, ResultStore};
use kiln_scheduler::{ChangeIngest, Dispatcher, Scheduler, WorkerRegistry};
use std::sync::Arc;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<MasterConfig>,
    pub builders: Arc<BuilderSet>,
    pub registry: Arc<WorkerRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub scheduler: Arc<Scheduler>,
    pub ingest: Arc<ChangeIngest>,
    pub store: Arc<dyn ResultStore>,
    pub event_bus: Arc<dyn EventBus>,
}
