//! Kiln Scheduler
//!
//! Change ingest, any-branch fan-out, the worker registry, and the dispatch
//! state machine that moves build requests from queued to a terminal result.

pub mod backoff;
pub mod bus;
pub mod dispatch;
pub mod ingest;
pub mod registry;
pub mod scheduler;

pub use dispatch::{DispatchConfig, Dispatcher};
pub use ingest::ChangeIngest;
pub use registry::WorkerRegistry;
pub use scheduler::Scheduler;
