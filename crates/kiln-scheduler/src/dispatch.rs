//! Dispatch state machine.
//!
//! Owns every build request from the moment it is queued until it reaches a
//! terminal outcome in the result store. Requests move through
//! queued -> assigned -> running and end as succeeded, failed, exception or
//! cancelled. Assignment failures and worker losses requeue the request with
//! exponential backoff until the attempt budget is spent; a build's own
//! failure is a result, never a reason to retry.
//!
//! Locking: `state` is only ever held to inspect or mutate the queue and the
//! in-flight table. Registry calls, store appends and link sends all happen
//! with the lock released.

use crate::backoff::RetryPolicy;
use crate::registry::WorkerRegistry;
use chrono::{DateTime, Utc};
use kiln_core::build::{
    BuildOutcome, BuildReason, BuildRequest, BuildResult, CompletedBuild, RequestPhase,
};
use kiln_core::builder::BuilderSet;
use kiln_core::events::{
    BuildAssignedPayload, BuildCancelRequestedPayload, BuildCompletedPayload, BuildQueuedPayload,
    BuildRequeuedPayload, BuildStartedPayload, Event, WorkerDisconnectedPayload,
};
use kiln_core::ports::{EventBus, ResultStore};
use kiln_core::protocol::{AssignFrame, CompletedFrame};
use kiln_core::worker::DisconnectReason;
use kiln_core::{Error, RequestId, Result};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// How many finished request ids to remember, so a late cancel gets a
/// distinct error instead of "not found".
const FINISHED_MEMORY: usize = 256;

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Seconds a worker has to acknowledge an assignment with `Started`.
    pub ack_timeout_secs: u64,
    /// Seconds a worker has to confirm a cancellation before the master
    /// finalizes the build on its own.
    pub cancel_grace_secs: u64,
    /// Dispatch loop period.
    pub tick_interval_ms: u64,
    /// Seconds without a heartbeat before a connected worker is treated
    /// as lost.
    pub heartbeat_timeout_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            ack_timeout_secs: 30,
            cancel_grace_secs: 20,
            tick_interval_ms: 500,
            heartbeat_timeout_secs: 120,
            retry: RetryPolicy::default(),
        }
    }
}

struct QueuedRequest {
    request: BuildRequest,
    /// Backoff gate; the request is not eligible for assignment before this.
    not_before: DateTime<Utc>,
}

struct InFlight {
    request: BuildRequest,
    worker: String,
    phase: RequestPhase,
    /// Meaning depends on phase: ack deadline while assigned, the build's
    /// duration ceiling while running, the grace deadline while cancelling.
    deadline: DateTime<Utc>,
    max_duration_secs: u64,
    started_at: Option<DateTime<Utc>>,
    cancelled_by: Option<String>,
    timed_out: bool,
}

#[derive(Default)]
struct DispatchState {
    queue: VecDeque<QueuedRequest>,
    in_flight: HashMap<RequestId, InFlight>,
    recently_finished: VecDeque<RequestId>,
}

/// Point-in-time view of one live request.
#[derive(Debug, Clone, Serialize)]
pub struct RequestSnapshot {
    pub request: BuildRequest,
    pub phase: RequestPhase,
    pub worker: Option<String>,
}

pub struct Dispatcher {
    builders: Arc<BuilderSet>,
    registry: Arc<WorkerRegistry>,
    store: Arc<dyn ResultStore>,
    event_bus: Arc<dyn EventBus>,
    config: DispatchConfig,
    state: Mutex<DispatchState>,
}

impl Dispatcher {
    pub fn new(
        builders: Arc<BuilderSet>,
        registry: Arc<WorkerRegistry>,
        store: Arc<dyn ResultStore>,
        event_bus: Arc<dyn EventBus>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            builders,
            registry,
            store,
            event_bus,
            config,
            state: Mutex::new(DispatchState::default()),
        }
    }

    /// Accept a new request into the queue and try to place it immediately.
    pub async fn enqueue(&self, request: BuildRequest) -> RequestId {
        let request_id = request.id;
        let payload = BuildQueuedPayload {
            request_id,
            builder: request.builder.clone(),
            reason: request.reason.clone(),
            queued_at: Utc::now(),
        };
        {
            let mut state = self.state.lock().await;
            state.queue.push_back(QueuedRequest {
                request,
                not_before: Utc::now(),
            });
        }
        self.publish(Event::BuildQueued(payload)).await;
        self.pump().await;
        request_id
    }

    /// Worker acknowledged an assignment; the build is now running and the
    /// clock switches from the ack timeout to the duration ceiling.
    pub async fn handle_started(&self, worker: &str, request_id: RequestId) -> Result<()> {
        let builder = {
            let mut state = self.state.lock().await;
            let Some(entry) = state.in_flight.get_mut(&request_id) else {
                return Err(Error::RequestNotFound(request_id.to_string()));
            };
            if entry.worker != worker {
                warn!(
                    request_id = %request_id,
                    worker,
                    owner = %entry.worker,
                    "stale start report discarded"
                );
                return Ok(());
            }
            entry.started_at = Some(Utc::now());
            if entry.phase == RequestPhase::Assigned {
                entry.phase = RequestPhase::Running;
                entry.deadline =
                    Utc::now() + chrono::Duration::seconds(entry.max_duration_secs as i64);
            }
            entry.request.builder.clone()
        };
        self.publish(Event::BuildStarted(BuildStartedPayload {
            request_id,
            builder,
            worker_name: worker.to_string(),
            started_at: Utc::now(),
        }))
        .await;
        Ok(())
    }

    /// Worker delivered its terminal report. Records the result, frees the
    /// worker and pumps the queue. Reports for requests this dispatcher no
    /// longer owns are discarded.
    pub async fn handle_completed(&self, worker: &str, frame: CompletedFrame) -> Result<()> {
        let entry = {
            let mut state = self.state.lock().await;
            let Some(entry) = state.in_flight.remove(&frame.request_id) else {
                drop(state);
                warn!(
                    request_id = %frame.request_id,
                    worker,
                    "completion for unknown request discarded"
                );
                return Ok(());
            };
            if entry.worker != worker {
                warn!(
                    request_id = %frame.request_id,
                    worker,
                    owner = %entry.worker,
                    "stale completion discarded"
                );
                state.in_flight.insert(frame.request_id, entry);
                return Ok(());
            }
            entry
        };

        if let Err(err) = self.registry.mark_idle(worker).await {
            warn!(worker, error = %err, "could not return worker to pool");
        }

        // A build that blew its duration ceiling is an exception no matter
        // what the worker reports.
        let (outcome, logs_ref) = if entry.timed_out {
            (
                BuildOutcome::Exception,
                Some("maximum duration exceeded".to_string()),
            )
        } else {
            (frame.outcome, frame.logs_ref)
        };

        let result = self
            .record(CompletedBuild {
                request_id: frame.request_id,
                builder: entry.request.builder.clone(),
                reason: entry.request.reason.clone(),
                outcome,
                worker: Some(worker.to_string()),
                steps: frame.steps,
                logs_ref,
                started_at: Some(frame.started_at),
                completed_at: frame.completed_at,
            })
            .await?;
        debug!(
            request_id = %frame.request_id,
            builder = %result.builder,
            number = result.number,
            outcome = outcome.as_str(),
            "build finished"
        );
        self.pump().await;
        Ok(())
    }

    /// Cancel a request. Queued requests are finalized on the spot; running
    /// ones get a cancel order and the grace window to confirm.
    pub async fn cancel(&self, request_id: RequestId, cancelled_by: &str) -> Result<()> {
        let queued = {
            let mut state = self.state.lock().await;
            match state
                .queue
                .iter()
                .position(|item| item.request.id == request_id)
            {
                Some(pos) => state.queue.remove(pos).map(|item| item.request),
                None => None,
            }
        };
        if let Some(request) = queued {
            self.publish(Event::BuildCancelRequested(BuildCancelRequestedPayload {
                request_id,
                builder: request.builder.clone(),
                cancelled_by: Some(cancelled_by.to_string()),
                requested_at: Utc::now(),
            }))
            .await;
            self.finalize(
                request,
                BuildOutcome::Cancelled,
                None,
                Some(format!("cancelled by {cancelled_by} while queued")),
                None,
            )
            .await?;
            return Ok(());
        }

        let target = {
            let mut state = self.state.lock().await;
            match state.in_flight.get_mut(&request_id) {
                Some(entry) => {
                    if entry.phase != RequestPhase::Cancelling {
                        entry.phase = RequestPhase::Cancelling;
                        entry.deadline = Utc::now()
                            + chrono::Duration::seconds(self.config.cancel_grace_secs as i64);
                    }
                    entry.cancelled_by = Some(cancelled_by.to_string());
                    Some((entry.request.builder.clone(), entry.worker.clone()))
                }
                None => None,
            }
        };
        let Some((builder, worker)) = target else {
            let state = self.state.lock().await;
            if state.recently_finished.contains(&request_id) {
                return Err(Error::RequestAlreadyFinished(request_id.to_string()));
            }
            return Err(Error::RequestNotFound(request_id.to_string()));
        };

        self.publish(Event::BuildCancelRequested(BuildCancelRequestedPayload {
            request_id,
            builder,
            cancelled_by: Some(cancelled_by.to_string()),
            requested_at: Utc::now(),
        }))
        .await;
        if let Some(link) = self.registry.link_of(&worker).await {
            if link.cancel(request_id).await.is_err() {
                self.worker_lost(&worker, DisconnectReason::Error).await;
            }
        }
        Ok(())
    }

    /// A worker's connection is gone. Surrenders its in-flight request:
    /// requeued if it was simply running, finalized if it was already being
    /// cancelled. Safe to call more than once per outage.
    pub async fn worker_lost(&self, name: &str, reason: DisconnectReason) {
        let Some(disconnected) = self.registry.mark_disconnected(name, reason).await else {
            return;
        };
        self.publish(Event::WorkerDisconnected(WorkerDisconnectedPayload {
            worker_name: name.to_string(),
            reason,
            last_heartbeat_at: disconnected.last_heartbeat_at,
            disconnected_at: Utc::now(),
        }))
        .await;

        let Some(request_id) = disconnected.in_flight else {
            return;
        };
        let entry = {
            let mut state = self.state.lock().await;
            let owned = state
                .in_flight
                .get(&request_id)
                .map(|entry| entry.worker == name);
            if owned == Some(true) {
                state.in_flight.remove(&request_id)
            } else {
                None
            }
        };
        let Some(entry) = entry else { return };

        if entry.phase == RequestPhase::Cancelling {
            let (outcome, annotation) = if entry.timed_out {
                (BuildOutcome::Exception, "maximum duration exceeded")
            } else {
                (
                    BuildOutcome::Cancelled,
                    "worker disconnected during cancellation",
                )
            };
            if let Err(err) = self
                .finalize(
                    entry.request,
                    outcome,
                    Some(entry.worker),
                    Some(annotation.to_string()),
                    entry.started_at,
                )
                .await
            {
                error!(error = %err, "failed to record build after worker loss");
            }
        } else {
            self.requeue(entry.request, Some(entry.worker)).await;
        }
    }

    /// One pass of the periodic maintenance the run loop drives: expired
    /// deadlines, stale workers, then a queue pump.
    pub async fn tick(&self) {
        let now = Utc::now();
        let grace = chrono::Duration::seconds(self.config.cancel_grace_secs as i64);

        let mut to_requeue: Vec<(BuildRequest, String)> = Vec::new();
        let mut to_cancel: Vec<(RequestId, String)> = Vec::new();
        let mut to_finalize: Vec<InFlight> = Vec::new();
        {
            let mut state = self.state.lock().await;
            let expired: Vec<(RequestId, RequestPhase)> = state
                .in_flight
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(id, entry)| (*id, entry.phase))
                .collect();
            for (id, phase) in expired {
                match phase {
                    RequestPhase::Assigned => {
                        if let Some(entry) = state.in_flight.remove(&id) {
                            to_requeue.push((entry.request, entry.worker));
                        }
                    }
                    RequestPhase::Running => {
                        if let Some(entry) = state.in_flight.get_mut(&id) {
                            entry.timed_out = true;
                            entry.phase = RequestPhase::Cancelling;
                            entry.deadline = now + grace;
                            to_cancel.push((id, entry.worker.clone()));
                        }
                    }
                    RequestPhase::Cancelling => {
                        if let Some(entry) = state.in_flight.remove(&id) {
                            to_finalize.push(entry);
                        }
                    }
                    RequestPhase::Queued => {}
                }
            }
        }

        for (request, worker) in to_requeue {
            debug!(
                request_id = %request.id,
                worker,
                "assignment not acknowledged in time"
            );
            if let Err(err) = self.registry.mark_idle(&worker).await {
                warn!(worker, error = %err, "could not return worker to pool");
            }
            self.requeue(request, Some(worker)).await;
        }

        for (request_id, worker) in to_cancel {
            warn!(request_id = %request_id, worker, "build exceeded maximum duration, cancelling");
            let builder = {
                let state = self.state.lock().await;
                state
                    .in_flight
                    .get(&request_id)
                    .map(|entry| entry.request.builder.clone())
            };
            if let Some(builder) = builder {
                self.publish(Event::BuildCancelRequested(BuildCancelRequestedPayload {
                    request_id,
                    builder,
                    cancelled_by: None,
                    requested_at: Utc::now(),
                }))
                .await;
            }
            match self.registry.link_of(&worker).await {
                Some(link) => {
                    if link.cancel(request_id).await.is_err() {
                        self.worker_lost(&worker, DisconnectReason::Error).await;
                    }
                }
                // No link means the worker is already gone; the grace
                // deadline will finalize the entry on a later tick.
                None => warn!(worker, "no link to deliver cancellation"),
            }
        }

        for entry in to_finalize {
            let (outcome, annotation) = if entry.timed_out {
                (
                    BuildOutcome::Exception,
                    "maximum duration exceeded".to_string(),
                )
            } else {
                match &entry.cancelled_by {
                    Some(who) => (
                        BuildOutcome::Cancelled,
                        format!("cancelled by {who}; worker did not confirm in time"),
                    ),
                    None => (
                        BuildOutcome::Cancelled,
                        "cancelled; worker did not confirm in time".to_string(),
                    ),
                }
            };
            if let Err(err) = self.registry.mark_idle(&entry.worker).await {
                warn!(worker = %entry.worker, error = %err, "could not return worker to pool");
            }
            if let Err(err) = self
                .finalize(
                    entry.request,
                    outcome,
                    Some(entry.worker),
                    Some(annotation),
                    entry.started_at,
                )
                .await
            {
                error!(error = %err, "failed to record build after grace expiry");
            }
        }

        for name in self
            .registry
            .stale_workers(self.config.heartbeat_timeout_secs)
            .await
        {
            warn!(worker = %name, "no heartbeat, treating worker as lost");
            self.worker_lost(&name, DisconnectReason::Timeout).await;
        }

        self.pump().await;
    }

    /// Drive the dispatch loop until shutdown is signalled.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            tick_interval_ms = self.config.tick_interval_ms,
            "dispatcher started"
        );
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.tick_interval_ms));
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("dispatcher stopped");
    }

    pub async fn queue_len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// Phase of a live request, `None` once it has finished.
    pub async fn request_phase(&self, request_id: RequestId) -> Option<RequestPhase> {
        let state = self.state.lock().await;
        if state
            .queue
            .iter()
            .any(|item| item.request.id == request_id)
        {
            return Some(RequestPhase::Queued);
        }
        state.in_flight.get(&request_id).map(|entry| entry.phase)
    }

    /// All live requests, queued first.
    pub async fn snapshot(&self) -> Vec<RequestSnapshot> {
        let state = self.state.lock().await;
        let mut all: Vec<RequestSnapshot> = state
            .queue
            .iter()
            .map(|item| RequestSnapshot {
                request: item.request.clone(),
                phase: RequestPhase::Queued,
                worker: None,
            })
            .collect();
        all.extend(state.in_flight.values().map(|entry| RequestSnapshot {
            request: entry.request.clone(),
            phase: entry.phase,
            worker: Some(entry.worker.clone()),
        }));
        all
    }

    /// Assign every eligible queued request to a capable idle worker.
    async fn pump(&self) {
        let now = Utc::now();
        let eligible: Vec<QueuedRequest> = {
            let mut state = self.state.lock().await;
            let mut ready = Vec::new();
            let mut waiting = VecDeque::with_capacity(state.queue.len());
            while let Some(item) = state.queue.pop_front() {
                if item.not_before <= now {
                    ready.push(item);
                } else {
                    waiting.push_back(item);
                }
            }
            state.queue = waiting;
            ready
        };
        if eligible.is_empty() {
            return;
        }

        let mut unassigned = Vec::new();
        for item in eligible {
            let not_before = item.not_before;
            if let Some(request) = self.try_assign(item.request).await {
                unassigned.push(QueuedRequest {
                    request,
                    not_before,
                });
            }
        }
        if !unassigned.is_empty() {
            // Put them back at the front, oldest first, so queue order holds.
            let mut state = self.state.lock().await;
            for item in unassigned.into_iter().rev() {
                state.queue.push_front(item);
            }
        }
    }

    /// Claim a worker and deliver the assignment. Returns the request back
    /// if no capable worker is idle.
    async fn try_assign(&self, mut request: BuildRequest) -> Option<BuildRequest> {
        let Some(config) = self.builders.get(&request.builder).cloned() else {
            // Requests are validated against the builder set on entry, so
            // this only fires if state and configuration disagree.
            error!(builder = %request.builder, "no configuration for queued request");
            if let Err(err) = self
                .finalize(
                    request,
                    BuildOutcome::Exception,
                    None,
                    Some("builder configuration missing".to_string()),
                    None,
                )
                .await
            {
                error!(error = %err, "failed to record orphaned request");
            }
            return None;
        };

        let Some(claim) = self
            .registry
            .claim_capable(&config.requires, request.id)
            .await
        else {
            return Some(request);
        };

        request.attempts += 1;
        // Steps reference the triggering change through BRANCH/REVISION.
        let mut env = config.env.clone();
        if let BuildReason::Change { branch, revision, .. } = &request.reason {
            env.insert("BRANCH".to_string(), branch.clone());
            env.insert("REVISION".to_string(), revision.clone());
        }
        let frame = AssignFrame {
            request_id: request.id,
            builder: request.builder.clone(),
            reason: request.reason.clone(),
            steps: config.steps.clone(),
            env,
            max_duration_secs: config.max_duration_secs,
            attempt: request.attempts,
        };
        let deadline = Utc::now() + chrono::Duration::seconds(self.config.ack_timeout_secs as i64);
        {
            let mut state = self.state.lock().await;
            state.in_flight.insert(
                request.id,
                InFlight {
                    request: request.clone(),
                    worker: claim.name.clone(),
                    phase: RequestPhase::Assigned,
                    deadline,
                    max_duration_secs: config.max_duration_secs,
                    started_at: None,
                    cancelled_by: None,
                    timed_out: false,
                },
            );
        }
        self.publish(Event::BuildAssigned(BuildAssignedPayload {
            request_id: request.id,
            builder: request.builder.clone(),
            worker_name: claim.name.clone(),
            attempt: request.attempts,
            assigned_at: Utc::now(),
        }))
        .await;
        debug!(
            request_id = %request.id,
            worker = %claim.name,
            attempt = request.attempts,
            "assigned"
        );

        if let Err(err) = claim.link.assign(frame).await {
            warn!(
                request_id = %request.id,
                worker = %claim.name,
                error = %err,
                "failed to deliver assignment"
            );
            // The disconnect path removes the entry and requeues.
            self.worker_lost(&claim.name, DisconnectReason::Error).await;
        }
        None
    }

    /// Put a request back in the queue with backoff, or finalize it as an
    /// exception once its attempt budget is spent.
    async fn requeue(&self, request: BuildRequest, from_worker: Option<String>) {
        if self.config.retry.exhausted(request.attempts) {
            let reason = Error::DispatchTimeout {
                request_id: request.id.to_string(),
                attempts: request.attempts,
            };
            warn!(
                request_id = %request.id,
                attempts = request.attempts,
                "retries exhausted"
            );
            if let Err(err) = self
                .finalize(
                    request,
                    BuildOutcome::Exception,
                    from_worker,
                    Some(reason.to_string()),
                    None,
                )
                .await
            {
                error!(error = %err, "failed to record exhausted request");
            }
            return;
        }

        let delay = self.config.retry.delay_for(request.attempts);
        let payload = BuildRequeuedPayload {
            request_id: request.id,
            builder: request.builder.clone(),
            worker_name: from_worker,
            attempt: request.attempts,
            retry_delay_ms: delay.as_millis() as u64,
            requeued_at: Utc::now(),
        };
        {
            let mut state = self.state.lock().await;
            state.queue.push_back(QueuedRequest {
                request,
                not_before: Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64),
            });
        }
        self.publish(Event::BuildRequeued(payload)).await;
    }

    /// Record a terminal outcome reached without a worker report.
    async fn finalize(
        &self,
        request: BuildRequest,
        outcome: BuildOutcome,
        worker: Option<String>,
        annotation: Option<String>,
        started_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.record(CompletedBuild {
            request_id: request.id,
            builder: request.builder,
            reason: request.reason,
            outcome,
            worker,
            steps: vec![],
            logs_ref: annotation,
            started_at,
            completed_at: Utc::now(),
        })
        .await?;
        Ok(())
    }

    /// Append to the store and announce the completed build.
    async fn record(&self, build: CompletedBuild) -> Result<BuildResult> {
        let result = self.store.append(&build).await?;
        {
            let mut state = self.state.lock().await;
            state.recently_finished.push_back(build.request_id);
            if state.recently_finished.len() > FINISHED_MEMORY {
                state.recently_finished.pop_front();
            }
        }
        let duration_ms = build
            .started_at
            .map(|started| (build.completed_at - started).num_milliseconds().max(0) as u64);
        self.publish(Event::BuildCompleted(BuildCompletedPayload {
            request_id: build.request_id,
            builder: result.builder.clone(),
            number: result.number,
            outcome: build.outcome,
            worker_name: build.worker.clone(),
            duration_ms,
            completed_at: build.completed_at,
        }))
        .await;
        Ok(result)
    }

    async fn publish(&self, event: Event) {
        if let Err(err) = self.event_bus.publish(event).await {
            warn!(error = %err, "failed to publish event");
        }
    }
}
