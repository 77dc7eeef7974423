//! Build execution.
//!
//! Runs the steps of one assignment in sequence inside a per-builder
//! workspace, streaming output lines back to the connection as they appear.
//! The workspace persists between builds so checkouts stay incremental.

use kiln_core::build::{BuildOutcome, StepReport, StepStatus};
use kiln_core::builder::StepSpec;
use kiln_core::ids::{BuilderName, RequestId};
use kiln_core::protocol::{AssignFrame, CompletedFrame, WorkerFrame};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, sleep};
use tracing::{error, info, warn};

const LOG_TAIL_LINES: usize = 50;

/// Executes build assignments on this worker.
pub struct BuildExecutor {
    workspace_dir: PathBuf,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    None,
    TimedOut,
    Cancelled,
}

impl BuildExecutor {
    pub fn new(workspace_dir: PathBuf) -> Self {
        Self { workspace_dir }
    }

    /// Run one assignment to completion. Always produces a terminal report,
    /// even when the workspace cannot be prepared.
    pub async fn execute(
        &self,
        order: AssignFrame,
        output: mpsc::Sender<WorkerFrame>,
        mut cancel: watch::Receiver<bool>,
    ) -> CompletedFrame {
        let started_at = Utc::now();
        info!(
            request_id = %order.request_id,
            builder = %order.builder,
            attempt = order.attempt,
            "starting build"
        );

        let workspace = match self.setup_workspace(&order.builder).await {
            Ok(workspace) => workspace,
            Err(err) => {
                error!(builder = %order.builder, error = %err, "workspace setup failed");
                return CompletedFrame {
                    request_id: order.request_id,
                    outcome: BuildOutcome::Exception,
                    steps: vec![],
                    logs_ref: Some(format!("workspace setup failed: {err}")),
                    started_at,
                    completed_at: Utc::now(),
                };
            }
        };

        let mut reports = Vec::with_capacity(order.steps.len());
        let mut cancelled = false;
        let mut halted = false;
        let mut failed = false;
        for step in &order.steps {
            if *cancel.borrow() {
                cancelled = true;
            }
            if cancelled || halted {
                reports.push(skipped(step));
                continue;
            }
            let report = self
                .run_step(
                    order.request_id,
                    step,
                    &order.env,
                    &workspace,
                    &output,
                    &mut cancel,
                )
                .await;
            match report.status {
                StepStatus::Success => {}
                StepStatus::Cancelled => cancelled = true,
                StepStatus::Failure => {
                    failed = true;
                    if !step.continue_on_failure {
                        halted = true;
                    }
                }
                StepStatus::Skipped => {}
            }
            reports.push(report);
        }

        let outcome = if cancelled {
            BuildOutcome::Cancelled
        } else if failed {
            BuildOutcome::Failed
        } else {
            BuildOutcome::Succeeded
        };

        info!(
            request_id = %order.request_id,
            outcome = outcome.as_str(),
            "build finished"
        );

        CompletedFrame {
            request_id: order.request_id,
            outcome,
            steps: reports,
            logs_ref: None,
            started_at,
            completed_at: Utc::now(),
        }
    }

    async fn setup_workspace(&self, builder: &BuilderName) -> std::io::Result<PathBuf> {
        let workspace = self.workspace_dir.join(builder.as_str());
        fs::create_dir_all(&workspace).await?;
        Ok(workspace)
    }

    async fn run_step(
        &self,
        request_id: RequestId,
        step: &StepSpec,
        build_env: &HashMap<String, String>,
        workspace: &Path,
        output: &mpsc::Sender<WorkerFrame>,
        cancel: &mut watch::Receiver<bool>,
    ) -> StepReport {
        let start = Instant::now();
        info!(request_id = %request_id, step = %step.name, "running step");

        let mut command = shell_command(&step.command);
        command
            .current_dir(workspace)
            .envs(build_env)
            .envs(&step.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                error!(step = %step.name, error = %err, "failed to spawn step");
                return StepReport {
                    name: step.name.clone(),
                    status: StepStatus::Failure,
                    exit_code: None,
                    duration_ms: start.elapsed().as_millis() as u64,
                    log_tail: vec![format!("failed to spawn: {err}")],
                };
            }
        };

        let (line_tx, mut line_rx) = mpsc::channel::<String>(256);
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, line_tx.clone());
        }
        drop(line_tx);

        let deadline = sleep(Duration::from_secs(step.timeout_secs));
        tokio::pin!(deadline);

        let mut tail: VecDeque<String> = VecDeque::new();
        let mut interrupt = Interrupt::None;
        let mut cancel_open = true;
        // Once both pipes close the process is done; killing only hastens
        // that moment, so the loop always ends at a real exit status.
        let exit = loop {
            tokio::select! {
                line = line_rx.recv() => match line {
                    Some(line) => {
                        push_tail(&mut tail, line.clone());
                        let frame = WorkerFrame::StepOutput {
                            request_id,
                            step: step.name.clone(),
                            line,
                        };
                        let _ = output.send(frame).await;
                    }
                    None => break child.wait().await,
                },
                _ = &mut deadline, if interrupt == Interrupt::None => {
                    warn!(step = %step.name, timeout_secs = step.timeout_secs, "step timed out, killing");
                    interrupt = Interrupt::TimedOut;
                    let _ = child.start_kill();
                }
                changed = cancel.changed(), if cancel_open && interrupt == Interrupt::None => {
                    match changed {
                        Ok(()) if *cancel.borrow() => {
                            info!(step = %step.name, "cancelling step");
                            interrupt = Interrupt::Cancelled;
                            let _ = child.start_kill();
                        }
                        Ok(()) => {}
                        Err(_) => cancel_open = false,
                    }
                }
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let (status, exit_code) = match (interrupt, exit) {
            (Interrupt::Cancelled, _) => {
                push_tail(&mut tail, "cancelled by the master".to_string());
                (StepStatus::Cancelled, None)
            }
            (Interrupt::TimedOut, _) => {
                push_tail(
                    &mut tail,
                    format!("step timed out after {}s", step.timeout_secs),
                );
                (StepStatus::Failure, None)
            }
            (Interrupt::None, Ok(exit)) if exit.success() => (StepStatus::Success, exit.code()),
            (Interrupt::None, Ok(exit)) => (StepStatus::Failure, exit.code()),
            (Interrupt::None, Err(err)) => {
                push_tail(&mut tail, format!("wait failed: {err}"));
                (StepStatus::Failure, None)
            }
        };

        StepReport {
            name: step.name.clone(),
            status,
            exit_code,
            duration_ms,
            log_tail: tail.into(),
        }
    }
}

fn skipped(step: &StepSpec) -> StepReport {
    StepReport {
        name: step.name.clone(),
        status: StepStatus::Skipped,
        exit_code: None,
        duration_ms: 0,
        log_tail: vec![],
    }
}

fn push_tail(tail: &mut VecDeque<String>, line: String) {
    if tail.len() == LOG_TAIL_LINES {
        tail.pop_front();
    }
    tail.push_back(line);
}

fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
}

#[cfg(not(windows))]
fn shell_command(script: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(script);
    command
}

#[cfg(windows)]
fn shell_command(script: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(script);
    command
}
