//! Event types published on the master's event bus.

use crate::build::{BuildOutcome, BuildReason};
use crate::ids::{BuilderName, ChangeId, RequestId, WorkerId};
use crate::worker::{DisconnectReason, SystemMetrics, WorkerStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// All events in the Kiln system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Change lifecycle
    ChangeAccepted(ChangeAcceptedPayload),

    // Build lifecycle
    BuildQueued(BuildQueuedPayload),
    BuildAssigned(BuildAssignedPayload),
    BuildStarted(BuildStartedPayload),
    BuildRequeued(BuildRequeuedPayload),
    BuildCancelRequested(BuildCancelRequestedPayload),
    BuildCompleted(BuildCompletedPayload),

    // Worker lifecycle
    WorkerRegistered(WorkerRegisteredPayload),
    WorkerHeartbeat(WorkerHeartbeatPayload),
    WorkerDisconnected(WorkerDisconnectedPayload),
}

impl Event {
    /// Returns the bus subject for this event.
    pub fn subject(&self) -> String {
        match self {
            Event::ChangeAccepted(p) => format!("change.accepted.{}", p.change_id),
            Event::BuildQueued(p) => format!("build.queued.{}", p.builder),
            Event::BuildAssigned(p) => format!("build.assigned.{}.{}", p.builder, p.request_id),
            Event::BuildStarted(p) => format!("build.started.{}.{}", p.builder, p.request_id),
            Event::BuildRequeued(p) => format!("build.requeued.{}.{}", p.builder, p.request_id),
            Event::BuildCancelRequested(p) => {
                format!("build.cancel_requested.{}.{}", p.builder, p.request_id)
            }
            Event::BuildCompleted(p) => format!("build.completed.{}.{}", p.builder, p.request_id),
            Event::WorkerRegistered(_) => "worker.registered".to_string(),
            Event::WorkerHeartbeat(p) => format!("worker.{}.heartbeat", p.worker_name),
            Event::WorkerDisconnected(p) => format!("worker.{}.disconnected", p.worker_name),
        }
    }
}

// === Change Payloads ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeAcceptedPayload {
    pub change_id: ChangeId,
    pub branch: String,
    pub revision: String,
    pub author: Option<String>,
    pub requests_created: u32,
    pub received_at: DateTime<Utc>,
}

// === Build Payloads ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildQueuedPayload {
    pub request_id: RequestId,
    pub builder: BuilderName,
    pub reason: BuildReason,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildAssignedPayload {
    pub request_id: RequestId,
    pub builder: BuilderName,
    pub worker_name: String,
    pub attempt: u32,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildStartedPayload {
    pub request_id: RequestId,
    pub builder: BuilderName,
    pub worker_name: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequeuedPayload {
    pub request_id: RequestId,
    pub builder: BuilderName,
    pub worker_name: Option<String>,
    pub attempt: u32,
    pub retry_delay_ms: u64,
    pub requeued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildCancelRequestedPayload {
    pub request_id: RequestId,
    pub builder: BuilderName,
    pub cancelled_by: Option<String>,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildCompletedPayload {
    pub request_id: RequestId,
    pub builder: BuilderName,
    pub number: u32,
    pub outcome: BuildOutcome,
    pub worker_name: Option<String>,
    pub duration_ms: Option<u64>,
    pub completed_at: DateTime<Utc>,
}

// === Worker Payloads ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegisteredPayload {
    pub worker_id: WorkerId,
    pub worker_name: String,
    pub platform: String,
    pub arch: String,
    pub tags: Vec<String>,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeatPayload {
    pub worker_name: String,
    pub status: WorkerStatus,
    pub current_request_id: Option<RequestId>,
    pub system_metrics: Option<SystemMetrics>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerDisconnectedPayload {
    pub worker_name: String,
    pub reason: DisconnectReason,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub disconnected_at: DateTime<Utc>,
}
