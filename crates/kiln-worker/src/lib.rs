//! Build worker for Kiln.

pub mod config;
pub mod connection;
pub mod executor;
pub mod heartbeat;

pub use config::WorkerConfig;
pub use connection::WorkerConnection;
pub use executor::BuildExecutor;
