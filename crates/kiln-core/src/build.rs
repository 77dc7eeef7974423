//! Build request and result types.

use crate::change::Change;
use crate::ids::{BuilderName, ChangeId, RequestId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One instance of running a builder. Owned by the dispatcher until it
/// reaches a terminal outcome, then recorded as a [`BuildResult`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub id: RequestId,
    pub builder: BuilderName,
    pub reason: BuildReason,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
}

impl BuildRequest {
    pub fn for_change(builder: BuilderName, change: &Change) -> Self {
        Self {
            id: RequestId::new(),
            builder,
            reason: BuildReason::Change {
                change_id: change.id,
                branch: change.branch.clone(),
                revision: change.revision.clone(),
            },
            created_at: Utc::now(),
            attempts: 0,
        }
    }

    pub fn forced(builder: BuilderName, requested_by: impl Into<String>) -> Self {
        Self {
            id: RequestId::new(),
            builder,
            reason: BuildReason::Forced {
                requested_by: requested_by.into(),
            },
            created_at: Utc::now(),
            attempts: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BuildReason {
    Change {
        change_id: ChangeId,
        branch: String,
        revision: String,
    },
    Forced {
        requested_by: String,
    },
}

/// Non-terminal phases of a request's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPhase {
    Queued,
    Assigned,
    Running,
    Cancelling,
}

/// Terminal outcome of a build. `Failed` is a normal result (the build's own
/// steps failed); `Exception` is an orchestration-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildOutcome {
    Succeeded,
    Failed,
    Exception,
    Cancelled,
}

impl BuildOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, BuildOutcome::Succeeded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildOutcome::Succeeded => "succeeded",
            BuildOutcome::Failed => "failed",
            BuildOutcome::Exception => "exception",
            BuildOutcome::Cancelled => "cancelled",
        }
    }
}

/// Per-step summary reported by the worker in its terminal report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub name: String,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    /// Last few lines of combined output, for quick triage.
    #[serde(default)]
    pub log_tail: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failure,
    Cancelled,
    Skipped,
}

/// A finished build before the store has assigned its sequence number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedBuild {
    pub request_id: RequestId,
    pub builder: BuilderName,
    pub reason: BuildReason,
    pub outcome: BuildOutcome,
    pub worker: Option<String>,
    pub steps: Vec<StepReport>,
    pub logs_ref: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
}

/// The immutable record of a finished build. Sequence numbers are strictly
/// increasing per builder and never reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResult {
    pub builder: BuilderName,
    pub number: u32,
    pub request_id: RequestId,
    pub reason: BuildReason,
    pub outcome: BuildOutcome,
    pub worker: Option<String>,
    pub steps: Vec<StepReport>,
    pub logs_ref: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
}
