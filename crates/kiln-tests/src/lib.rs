//! Integration test infrastructure for Kiln.
//!
//! This crate spins up a complete in-process master (HTTP API, worker
//! socket, dispatch loop, throwaway SQLite store) and provides a scripted
//! worker client for driving the wire protocol from tests.
//!
//! # Usage
//!
//! ```ignore
//! use kiln_tests::{start_test_master, ApiTestClient};
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let master = start_test_master(vec![]).await.expect("master");
//!     let client = ApiTestClient::new(master.addr);
//!     // Use client, TestWorker::connect(master.addr, ..), etc.
//! }
//! ```

pub mod fixtures;
pub mod helpers;

pub use fixtures::*;
pub use helpers::*;

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,kiln_tests=debug")),
        )
        .with_test_writer()
        .try_init();
}
