//! Change ingestion.
//!
//! Validates raw change notifications from hook senders and hands accepted
//! changes to the scheduler. Validation is strict: a notification without a
//! usable branch or revision is rejected outright rather than guessed at.

use crate::scheduler::Scheduler;
use chrono::Utc;
use kiln_core::change::{Change, RawChange};
use kiln_core::events::{ChangeAcceptedPayload, Event};
use kiln_core::ids::{ChangeId, RequestId};
use kiln_core::ports::EventBus;
use kiln_core::{Error, Result};
use std::sync::Arc;
use tracing::{info, warn};

pub struct ChangeIngest {
    scheduler: Arc<Scheduler>,
    event_bus: Arc<dyn EventBus>,
}

impl ChangeIngest {
    pub fn new(scheduler: Arc<Scheduler>, event_bus: Arc<dyn EventBus>) -> Self {
        Self {
            scheduler,
            event_bus,
        }
    }

    /// Validate and accept one change notification. On success the change
    /// has already been fanned out; the created request ids come back with
    /// it. A malformed notification schedules nothing.
    pub async fn submit(&self, raw: RawChange) -> Result<(Change, Vec<RequestId>)> {
        let change = validate(raw)?;
        let requests = self.scheduler.on_change(&change).await;
        info!(
            change_id = %change.id,
            branch = %change.branch,
            revision = %change.revision,
            requests = requests.len(),
            "change accepted"
        );
        let payload = ChangeAcceptedPayload {
            change_id: change.id,
            branch: change.branch.clone(),
            revision: change.revision.clone(),
            author: change.author.clone(),
            requests_created: requests.len() as u32,
            received_at: change.received_at,
        };
        if let Err(err) = self.event_bus.publish(Event::ChangeAccepted(payload)).await {
            warn!(error = %err, "failed to publish event");
        }
        Ok((change, requests))
    }
}

fn validate(raw: RawChange) -> Result<Change> {
    let branch = required(raw.branch, "branch")?;
    let revision = required(raw.revision, "revision")?;
    let timestamp = match raw.timestamp {
        Some(ts) if ts.timestamp() <= 0 => {
            return Err(Error::MalformedChange {
                field: "timestamp".to_string(),
            });
        }
        Some(ts) => ts,
        None => Utc::now(),
    };
    Ok(Change {
        id: ChangeId::new(),
        branch,
        revision,
        timestamp,
        author: raw.author.filter(|a| !a.trim().is_empty()),
        comments: raw.comments,
        received_at: Utc::now(),
    })
}

fn required(value: Option<String>, field: &str) -> Result<String> {
    let trimmed = value.as_deref().unwrap_or("").trim();
    if trimmed.is_empty() {
        return Err(Error::MalformedChange {
            field: field.to_string(),
        });
    }
    Ok(trimmed.to_string())
}
