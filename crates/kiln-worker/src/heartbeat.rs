//! Heartbeat loop for periodic health reporting.

use kiln_core::ids::RequestId;
use kiln_core::protocol::{HeartbeatFrame, WorkerFrame};
use kiln_core::worker::{SystemMetrics, WorkerStatus};
use sysinfo::System;
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, interval};
use tracing::{debug, info};

/// Periodically reports worker health over the connection's outbound channel.
pub struct HeartbeatService {
    out: mpsc::Sender<WorkerFrame>,
    interval_secs: u64,
    status_rx: watch::Receiver<WorkerStatus>,
    current_rx: watch::Receiver<Option<RequestId>>,
}

impl HeartbeatService {
    pub fn new(
        out: mpsc::Sender<WorkerFrame>,
        interval_secs: u64,
        status_rx: watch::Receiver<WorkerStatus>,
        current_rx: watch::Receiver<Option<RequestId>>,
    ) -> Self {
        Self {
            out,
            interval_secs,
            status_rx,
            current_rx,
        }
    }

    /// Run the heartbeat loop until shutdown or until the connection closes.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs));
        let mut sys = System::new_all();

        info!(interval_secs = self.interval_secs, "starting heartbeat loop");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.send_heartbeat(&mut sys).await {
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("heartbeat loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn send_heartbeat(&self, sys: &mut System) -> bool {
        sys.refresh_all();

        let load = System::load_average();
        let metrics = SystemMetrics {
            cpu_percent: sys.global_cpu_usage() as f64,
            memory_used_bytes: sys.used_memory(),
            memory_total_bytes: sys.total_memory(),
            load_average: [load.one, load.five, load.fifteen],
        };

        let frame = WorkerFrame::Heartbeat(HeartbeatFrame {
            status: *self.status_rx.borrow(),
            current_request_id: *self.current_rx.borrow(),
            system_metrics: Some(metrics),
            timestamp: chrono::Utc::now(),
        });

        if self.out.send(frame).await.is_err() {
            debug!("heartbeat channel closed");
            return false;
        }
        debug!("heartbeat sent");
        true
    }
}
