//! WebSocket endpoints: the worker protocol and operator event streaming.
//!
//! A worker connection starts with a `Hello` frame carrying its registration;
//! the master answers `Welcome` or `Denied` and closes on denial. After the
//! handshake the socket carries assignment traffic both ways until it drops,
//! at which point the dispatcher reclaims whatever the worker was running.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use kiln_core::events::{Event, WorkerHeartbeatPayload, WorkerRegisteredPayload};
use kiln_core::ports::WorkerLink;
use kiln_core::protocol::{AssignFrame, MasterFrame, WorkerFrame};
use kiln_core::worker::{DisconnectReason, WorkerRegistration};
use kiln_core::{Error, RequestId, Result};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::state::AppState;

const HELLO_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOUND_BUFFER: usize = 64;

/// Sends master frames to one connected worker over its socket's outbound
/// channel. Sending never waits on the worker; a full buffer counts as a
/// dead link.
struct WsWorkerLink {
    tx: mpsc::Sender<MasterFrame>,
}

#[async_trait]
impl WorkerLink for WsWorkerLink {
    async fn assign(&self, order: AssignFrame) -> Result<()> {
        self.tx
            .try_send(MasterFrame::Assign(order))
            .map_err(|_| Error::Connection("worker link closed or backed up".to_string()))
    }

    async fn cancel(&self, request_id: RequestId) -> Result<()> {
        self.tx
            .try_send(MasterFrame::Cancel { request_id })
            .map_err(|_| Error::Connection("worker link closed or backed up".to_string()))
    }
}

pub async fn worker_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_worker(socket, state))
}

async fn handle_worker(mut socket: WebSocket, state: Arc<AppState>) {
    let registration = match wait_for_hello(&mut socket).await {
        Ok(registration) => registration,
        Err(reason) => {
            warn!(reason = %reason, "worker handshake failed");
            send_frame(&mut socket, &MasterFrame::Denied { reason }).await;
            return;
        }
    };

    let (tx, mut rx) = mpsc::channel::<MasterFrame>(OUTBOUND_BUFFER);
    let link = Arc::new(WsWorkerLink { tx });
    let worker = match state.registry.register(registration, link).await {
        Ok(worker) => worker,
        Err(err) => {
            warn!(error = %err, "worker registration rejected");
            send_frame(
                &mut socket,
                &MasterFrame::Denied {
                    reason: err.to_string(),
                },
            )
            .await;
            return;
        }
    };

    info!(worker = %worker.name, platform = worker.capabilities.platform.as_str(), "worker connected");
    send_frame(
        &mut socket,
        &MasterFrame::Welcome {
            worker_id: worker.id,
            master: state.config.title.clone(),
        },
    )
    .await;
    publish(
        &state,
        Event::WorkerRegistered(WorkerRegisteredPayload {
            worker_id: worker.id,
            worker_name: worker.name.clone(),
            platform: worker.capabilities.platform.as_str().to_string(),
            arch: worker.capabilities.arch.as_str().to_string(),
            tags: worker.capabilities.tags.clone(),
            registered_at: worker.registered_at,
        }),
    )
    .await;

    let (mut sender, mut receiver) = socket.split();
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let Ok(json) = serde_json::to_string(&frame) else {
                continue;
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let name = worker.name.clone();
    let mut reason = DisconnectReason::Error;
    while let Some(received) = receiver.next().await {
        let message = match received {
            Ok(message) => message,
            Err(_) => break,
        };
        match message {
            Message::Text(text) => match serde_json::from_str::<WorkerFrame>(&text) {
                Ok(frame) => handle_worker_frame(&state, &name, frame).await,
                Err(err) => warn!(worker = %name, error = %err, "undecodable worker frame"),
            },
            Message::Close(_) => {
                reason = DisconnectReason::Graceful;
                break;
            }
            _ => {}
        }
    }

    send_task.abort();
    info!(worker = %name, reason = ?reason, "worker connection closed");
    state.dispatcher.worker_lost(&name, reason).await;
}

async fn handle_worker_frame(state: &Arc<AppState>, worker: &str, frame: WorkerFrame) {
    match frame {
        WorkerFrame::Started { request_id } => {
            if let Err(err) = state.dispatcher.handle_started(worker, request_id).await {
                warn!(worker, request_id = %request_id, error = %err, "start report rejected");
            }
        }
        WorkerFrame::Completed(completed) => {
            let request_id = completed.request_id;
            if let Err(err) = state.dispatcher.handle_completed(worker, completed).await {
                warn!(worker, request_id = %request_id, error = %err, "completion rejected");
            }
        }
        WorkerFrame::Heartbeat(heartbeat) => {
            if let Err(err) = state.registry.record_heartbeat(worker).await {
                warn!(worker, error = %err, "heartbeat for unknown worker");
                return;
            }
            publish(
                state,
                Event::WorkerHeartbeat(WorkerHeartbeatPayload {
                    worker_name: worker.to_string(),
                    status: heartbeat.status,
                    current_request_id: heartbeat.current_request_id,
                    system_metrics: heartbeat.system_metrics,
                    timestamp: heartbeat.timestamp,
                }),
            )
            .await;
        }
        WorkerFrame::StepOutput {
            request_id,
            step,
            line,
        } => {
            debug!(worker, request_id = %request_id, step = %step, line = %line, "step output");
        }
        WorkerFrame::Hello(_) => {
            warn!(worker, "unexpected hello after handshake");
        }
    }
}

async fn wait_for_hello(socket: &mut WebSocket) -> std::result::Result<WorkerRegistration, String> {
    let received = timeout(HELLO_TIMEOUT, socket.recv()).await;
    let Ok(Some(Ok(Message::Text(text)))) = received else {
        return Err("expected a hello frame".to_string());
    };
    match serde_json::from_str::<WorkerFrame>(&text) {
        Ok(WorkerFrame::Hello(registration)) => Ok(registration),
        Ok(_) => Err("expected a hello frame".to_string()),
        Err(err) => Err(format!("invalid hello frame: {err}")),
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &MasterFrame) {
    if let Ok(json) = serde_json::to_string(frame) {
        let _ = socket.send(Message::Text(json.into())).await;
    }
}

async fn publish(state: &Arc<AppState>, event: Event) {
    if let Err(err) = state.event_bus.publish(event).await {
        warn!(error = %err, "failed to publish event");
    }
}

#[derive(Deserialize)]
pub struct EventStreamParams {
    /// Subject pattern to stream, `*` and `>` wildcards supported.
    #[serde(default = "default_pattern")]
    pub pattern: String,
}

fn default_pattern() -> String {
    ">".to_string()
}

pub async fn events_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<EventStreamParams>,
) -> Response {
    ws.on_upgrade(move |socket| handle_events(socket, state, params.pattern))
}

async fn handle_events(socket: WebSocket, state: Arc<AppState>, pattern: String) {
    let mut events = match state.event_bus.subscribe(&pattern).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(error = %err, pattern, "event subscription failed");
            return;
        }
    };

    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            event = events.next() => {
                match event {
                    Some(Ok(event)) => {
                        let Ok(json) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(_)) | None => break,
                }
            }
            message = receiver.next() => {
                match message {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }
}
