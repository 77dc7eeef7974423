//! Wire frames for the persistent worker connection.
//!
//! Frames travel as JSON text messages over a WebSocket. The first frame a
//! worker sends must be `Hello`; the master answers `Welcome` or `Denied`
//! and closes on denial. Everything after that is assignment traffic.

use crate::build::{BuildOutcome, BuildReason, StepReport};
use crate::builder::StepSpec;
use crate::ids::{BuilderName, RequestId, WorkerId};
use crate::worker::{SystemMetrics, WorkerRegistration, WorkerStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Frames sent by the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerFrame {
    /// First frame on every connection.
    Hello(WorkerRegistration),
    /// Acknowledges an assignment: the build is now running.
    Started { request_id: RequestId },
    /// One line of live step output.
    StepOutput {
        request_id: RequestId,
        step: String,
        line: String,
    },
    /// Terminal report for an assignment.
    Completed(CompletedFrame),
    /// Periodic liveness signal.
    Heartbeat(HeartbeatFrame),
}

/// Frames sent by the master.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MasterFrame {
    Welcome {
        worker_id: WorkerId,
        master: String,
    },
    Denied {
        reason: String,
    },
    Assign(AssignFrame),
    Cancel {
        request_id: RequestId,
    },
}

/// Everything a worker needs to run one build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignFrame {
    pub request_id: RequestId,
    pub builder: BuilderName,
    pub reason: BuildReason,
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub max_duration_secs: u64,
    pub attempt: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedFrame {
    pub request_id: RequestId,
    pub outcome: BuildOutcome,
    pub steps: Vec<StepReport>,
    pub logs_ref: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatFrame {
    pub status: WorkerStatus,
    pub current_request_id: Option<RequestId>,
    pub system_metrics: Option<SystemMetrics>,
    pub timestamp: DateTime<Utc>,
}
