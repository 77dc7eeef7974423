//! Test fixtures for creating sample data.

use chrono::Utc;
use kiln_core::build::{BuildOutcome, StepReport, StepStatus};
use kiln_core::builder::{BuilderConfig, StepSpec};
use kiln_core::capability::{Arch, CapabilityRequirement, CapabilitySet, Platform};
use kiln_core::change::RawChange;
use kiln_core::protocol::{AssignFrame, CompletedFrame};
use kiln_core::worker::WorkerRegistration;
use std::collections::HashMap;

/// Factory for creating test builders.
pub struct BuilderFixture;

impl BuilderFixture {
    /// A builder whose single step succeeds instantly on any POSIX host.
    pub fn echo(name: &str) -> BuilderConfig {
        BuilderConfig {
            name: name.into(),
            requires: Self::linux_x64(),
            steps: vec![StepSpec {
                name: "greet".to_string(),
                command: "echo hello from kiln".to_string(),
                env: HashMap::new(),
                timeout_secs: 60,
                continue_on_failure: false,
            }],
            env: HashMap::new(),
            max_duration_secs: 300,
        }
    }

    /// A builder whose single step exits nonzero.
    pub fn failing(name: &str) -> BuilderConfig {
        BuilderConfig {
            name: name.into(),
            requires: Self::linux_x64(),
            steps: vec![StepSpec {
                name: "explode".to_string(),
                command: "exit 3".to_string(),
                env: HashMap::new(),
                timeout_secs: 60,
                continue_on_failure: false,
            }],
            env: HashMap::new(),
            max_duration_secs: 300,
        }
    }

    /// A builder that lingers long enough for a test to cancel it.
    pub fn slow(name: &str) -> BuilderConfig {
        BuilderConfig {
            name: name.into(),
            requires: Self::linux_x64(),
            steps: vec![StepSpec {
                name: "linger".to_string(),
                command: "sleep 30".to_string(),
                env: HashMap::new(),
                timeout_secs: 60,
                continue_on_failure: false,
            }],
            env: HashMap::new(),
            max_duration_secs: 300,
        }
    }

    /// A builder no Linux test worker can satisfy.
    pub fn windows_only(name: &str) -> BuilderConfig {
        BuilderConfig {
            name: name.into(),
            requires: CapabilityRequirement {
                platform: Platform::Windows,
                arch: Arch::X64,
                tags: vec![],
            },
            steps: vec![StepSpec {
                name: "noop".to_string(),
                command: "echo unreachable".to_string(),
                env: HashMap::new(),
                timeout_secs: 60,
                continue_on_failure: false,
            }],
            env: HashMap::new(),
            max_duration_secs: 300,
        }
    }

    fn linux_x64() -> CapabilityRequirement {
        CapabilityRequirement {
            platform: Platform::Linux,
            arch: Arch::X64,
            tags: vec![],
        }
    }
}

/// Factory for change notifications as a hook sender would post them.
pub struct ChangeFixture;

impl ChangeFixture {
    /// A well-formed push notification.
    pub fn push() -> RawChange {
        RawChange {
            branch: Some("devel".to_string()),
            revision: Some("9d3c58f72a41b6c90e8f12aa7b34c5d6e7f80912".to_string()),
            timestamp: Some(Utc::now()),
            author: Some("tester <tester@example.org>".to_string()),
            comments: Some("Fix bootstrap on 32 bit".to_string()),
        }
    }

    /// Missing the revision field.
    pub fn missing_revision() -> RawChange {
        RawChange {
            branch: Some("devel".to_string()),
            revision: None,
            timestamp: Some(Utc::now()),
            author: None,
            comments: None,
        }
    }
}

/// Registration frame payload for a Linux x64 test worker.
pub fn test_registration(name: &str, credential: &str) -> WorkerRegistration {
    WorkerRegistration {
        name: name.to_string(),
        credential: credential.to_string(),
        capabilities: CapabilitySet {
            platform: Platform::Linux,
            arch: Arch::X64,
            tags: vec![],
        },
        version: Some("test".to_string()),
    }
}

/// A successful terminal report answering `order`.
pub fn completed_ok(order: &AssignFrame) -> CompletedFrame {
    let now = Utc::now();
    CompletedFrame {
        request_id: order.request_id,
        outcome: BuildOutcome::Succeeded,
        steps: order
            .steps
            .iter()
            .map(|step| StepReport {
                name: step.name.clone(),
                status: StepStatus::Success,
                exit_code: Some(0),
                duration_ms: 12,
                log_tail: vec!["hello from kiln".to_string()],
            })
            .collect(),
        logs_ref: None,
        started_at: now,
        completed_at: now,
    }
}

/// A failed terminal report answering `order`.
pub fn completed_failed(order: &AssignFrame) -> CompletedFrame {
    let now = Utc::now();
    CompletedFrame {
        request_id: order.request_id,
        outcome: BuildOutcome::Failed,
        steps: order
            .steps
            .iter()
            .map(|step| StepReport {
                name: step.name.clone(),
                status: StepStatus::Failure,
                exit_code: Some(3),
                duration_ms: 12,
                log_tail: vec![],
            })
            .collect(),
        logs_ref: None,
        started_at: now,
        completed_at: now,
    }
}

/// A cancelled terminal report answering `order`.
pub fn completed_cancelled(order: &AssignFrame) -> CompletedFrame {
    let now = Utc::now();
    CompletedFrame {
        request_id: order.request_id,
        outcome: BuildOutcome::Cancelled,
        steps: order
            .steps
            .iter()
            .map(|step| StepReport {
                name: step.name.clone(),
                status: StepStatus::Cancelled,
                exit_code: None,
                duration_ms: 12,
                log_tail: vec!["cancelled by the master".to_string()],
            })
            .collect(),
        logs_ref: None,
        started_at: now,
        completed_at: now,
    }
}
