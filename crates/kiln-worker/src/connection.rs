//! The persistent master connection.
//!
//! One session per socket: hello, welcome, then a select loop that routes
//! inbound assignments to the executor and pumps outbound frames from the
//! executor and the heartbeat service. On any disconnect the worker backs
//! off and dials again; an in-progress build is abandoned and the master
//! reassigns it.

use crate::config::WorkerConfig;
use crate::executor::BuildExecutor;
use crate::heartbeat::HeartbeatService;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use kiln_core::ids::RequestId;
use kiln_core::protocol::{MasterFrame, WorkerFrame};
use kiln_core::worker::WorkerStatus;
use kiln_core::{Error, Result};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{error, info, warn};

const WELCOME_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_MIN: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(60);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

enum SessionEnd {
    Shutdown,
    Dropped,
    Denied(String),
}

struct ActiveBuild {
    request_id: RequestId,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Maintains the connection to the master, reconnecting until shutdown.
pub struct WorkerConnection {
    config: WorkerConfig,
    executor: Arc<BuildExecutor>,
}

impl WorkerConnection {
    pub fn new(config: WorkerConfig) -> Self {
        let executor = Arc::new(BuildExecutor::new(config.workspace_dir.clone()));
        Self { config, executor }
    }

    /// Dial, serve, and redial until shutdown is signalled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = RECONNECT_MIN;
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.serve_session(&mut shutdown).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Denied(reason)) => {
                    error!(reason = %reason, "master denied registration");
                }
                Ok(SessionEnd::Dropped) => {
                    warn!("connection to master lost");
                    backoff = RECONNECT_MIN;
                }
                Err(err) => {
                    warn!(error = %err, "could not reach master");
                }
            }
            info!(delay_secs = backoff.as_secs(), "reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
            backoff = (backoff * 2).min(RECONNECT_MAX);
        }
    }

    async fn serve_session(&self, shutdown: &mut watch::Receiver<bool>) -> Result<SessionEnd> {
        info!(master = %self.config.master_url, "connecting to master");
        let (ws, _) = connect_async(&self.config.master_url)
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        send_frame(&mut sink, &WorkerFrame::Hello(self.config.registration())).await?;
        match wait_for_welcome(&mut stream).await? {
            MasterFrame::Welcome { worker_id, master } => {
                info!(worker_id = %worker_id, master = %master, "registered with master");
            }
            MasterFrame::Denied { reason } => return Ok(SessionEnd::Denied(reason)),
            _ => {
                return Err(Error::Connection(
                    "unexpected first frame from master".to_string(),
                ));
            }
        }

        let (out_tx, mut out_rx) = mpsc::channel::<WorkerFrame>(256);
        let (status_tx, status_rx) = watch::channel(WorkerStatus::Idle);
        let (current_tx, current_rx) = watch::channel(None::<RequestId>);

        let heartbeat = HeartbeatService::new(
            out_tx.clone(),
            self.config.heartbeat_interval_secs,
            status_rx,
            current_rx,
        );
        let heartbeat_task = tokio::spawn(heartbeat.run(shutdown.clone()));

        let mut active: Option<ActiveBuild> = None;
        let end = loop {
            tokio::select! {
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<MasterFrame>(&text) {
                            Ok(frame) => self.handle_master_frame(
                                frame,
                                &mut active,
                                &out_tx,
                                &status_tx,
                                &current_tx,
                            ),
                            Err(err) => warn!(error = %err, "undecodable master frame"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break SessionEnd::Dropped,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "transport error");
                        break SessionEnd::Dropped;
                    }
                },
                frame = out_rx.recv() => {
                    if let Some(frame) = frame {
                        if let WorkerFrame::Completed(ref completed) = frame {
                            if active.as_ref().map(|a| a.request_id) == Some(completed.request_id) {
                                active = None;
                                let _ = status_tx.send(WorkerStatus::Idle);
                                let _ = current_tx.send(None);
                            }
                        }
                        if send_frame(&mut sink, &frame).await.is_err() {
                            break SessionEnd::Dropped;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = sink.send(Message::Close(None)).await;
                        break SessionEnd::Shutdown;
                    }
                }
            }
        };

        heartbeat_task.abort();
        if let Some(active) = active.take() {
            warn!(request_id = %active.request_id, "abandoning build, connection ended");
            active.task.abort();
        }
        Ok(end)
    }

    fn handle_master_frame(
        &self,
        frame: MasterFrame,
        active: &mut Option<ActiveBuild>,
        out_tx: &mpsc::Sender<WorkerFrame>,
        status_tx: &watch::Sender<WorkerStatus>,
        current_tx: &watch::Sender<Option<RequestId>>,
    ) {
        match frame {
            MasterFrame::Assign(order) => {
                if let Some(running) = active.as_ref() {
                    warn!(
                        request_id = %order.request_id,
                        running = %running.request_id,
                        "assignment while busy, ignoring"
                    );
                    return;
                }
                let request_id = order.request_id;
                let _ = status_tx.send(WorkerStatus::Busy);
                let _ = current_tx.send(Some(request_id));
                let (cancel_tx, cancel_rx) = watch::channel(false);
                let executor = Arc::clone(&self.executor);
                let out = out_tx.clone();
                let task = tokio::spawn(async move {
                    let _ = out.send(WorkerFrame::Started { request_id }).await;
                    let completed = executor.execute(order, out.clone(), cancel_rx).await;
                    let _ = out.send(WorkerFrame::Completed(completed)).await;
                });
                *active = Some(ActiveBuild {
                    request_id,
                    cancel: cancel_tx,
                    task,
                });
            }
            MasterFrame::Cancel { request_id } => match active.as_ref() {
                Some(build) if build.request_id == request_id => {
                    info!(request_id = %request_id, "cancel received");
                    let _ = build.cancel.send(true);
                }
                _ => warn!(request_id = %request_id, "cancel for a build not running here"),
            },
            MasterFrame::Welcome { .. } | MasterFrame::Denied { .. } => {
                warn!("unexpected control frame after handshake");
            }
        }
    }
}

async fn wait_for_welcome(stream: &mut WsStream) -> Result<MasterFrame> {
    let first = timeout(WELCOME_TIMEOUT, stream.next()).await;
    let Ok(Some(Ok(Message::Text(text)))) = first else {
        return Err(Error::Connection("no welcome from master".to_string()));
    };
    Ok(serde_json::from_str(&text)?)
}

async fn send_frame(sink: &mut WsSink, frame: &WorkerFrame) -> Result<()> {
    let json = serde_json::to_string(frame)?;
    sink.send(Message::Text(json.into()))
        .await
        .map_err(|e| Error::Connection(e.to_string()))
}
