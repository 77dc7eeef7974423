//! Error types for Kiln.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Change errors
    #[error("Malformed change: missing or empty field: {field}")]
    MalformedChange { field: String },

    // Builder errors
    #[error("Unknown builder: {0}")]
    UnknownBuilder(String),

    #[error("Unknown build: {builder} #{number}")]
    UnknownBuild { builder: String, number: u32 },

    // Worker errors
    #[error("Duplicate worker: {0}")]
    DuplicateWorker(String),

    #[error("Authentication failed for worker: {0}")]
    AuthFailure(String),

    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("Worker disconnected: {0}")]
    WorkerDisconnected(String),

    // Dispatch errors
    #[error("Request not found: {0}")]
    RequestNotFound(String),

    #[error("Request already finished: {0}")]
    RequestAlreadyFinished(String),

    #[error("Dispatch timed out for request {request_id} after {attempts} attempts")]
    DispatchTimeout { request_id: String, attempts: u32 },

    #[error("Build exception: {0}")]
    BuildException(String),

    // Result store errors
    #[error("Duplicate append for request {0}")]
    DuplicateAppend(String),

    // Infrastructure errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Event bus error: {0}")]
    EventBus(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
