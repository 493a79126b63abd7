/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Worker Runtime
//!
//! A worker is a standalone OS process with a stable identity that
//! repeatedly: reaps stale locks (best effort), claims one eligible job,
//! executes its command as a child process with capped output capture,
//! and reports the outcome back through the job manager. Workers share
//! nothing but the durable store.
//!
//! # Shutdown
//!
//! Shutdown is cooperative. The first request (typically SIGINT or
//! SIGTERM forwarded by the embedding process) drains: the in-flight job
//! finishes and its outcome is reported before the loop exits. A second
//! request within the configured grace window escalates: the child is
//! killed and the execution is reported as a failure immediately.
//!
//! # Crash semantics
//!
//! A worker that dies between claim and report leaves the row locked in
//! `processing`. Recovery is entirely the stale-lock reaper's job, which
//! every live worker runs before claiming.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::database::connection::Database;
use crate::error::{QueueError, StorageError};
use crate::models::job::Job;
use crate::queue::JobQueue;

/// Marker appended when captured output exceeds the configured cap.
pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Consecutive storage faults tolerated before the worker halts.
const MAX_CONSECUTIVE_STORAGE_FAULTS: u32 = 5;

/// Stable identity of a worker process.
///
/// Derived from the OS process id plus a random salt, so two workers on
/// the same host never collide even across pid reuse. Stable for the
/// process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerId(String);

impl WorkerId {
    /// Generates the identity for this process.
    pub fn generate() -> Self {
        let salt = Uuid::new_v4().simple().to_string();
        WorkerId(format!("worker-{}-{}", std::process::id(), &salt[..8]))
    }

    /// Wraps an externally assigned identity.
    pub fn new(id: impl Into<String>) -> Self {
        WorkerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shutdown progression observed by the worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownState {
    Running,
    /// Finish the in-flight job, report it, then exit.
    Draining,
    /// Kill the child and report failure immediately.
    Force,
}

struct ShutdownHandleInner {
    tx: watch::Sender<ShutdownState>,
    grace: Duration,
    first_signal: Mutex<Option<Instant>>,
}

/// Handle used to request worker shutdown, typically wired to OS
/// signals by the embedding process.
#[derive(Clone)]
pub struct ShutdownHandle {
    inner: Arc<ShutdownHandleInner>,
}

impl ShutdownHandle {
    /// Registers one shutdown request.
    ///
    /// The first request drains the in-flight job. A second request
    /// within the grace window escalates to killing the child; one that
    /// arrives after the window has passed re-arms it instead.
    pub fn request(&self) {
        let mut first = self
            .inner
            .first_signal
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match *first {
            None => {
                *first = Some(Instant::now());
                info!("shutdown requested, draining in-flight job");
                let _ = self.inner.tx.send(ShutdownState::Draining);
            }
            Some(at) if at.elapsed() <= self.inner.grace => {
                warn!("second shutdown request within grace window, killing in-flight job");
                let _ = self.inner.tx.send(ShutdownState::Force);
            }
            Some(_) => {
                *first = Some(Instant::now());
                let _ = self.inner.tx.send(ShutdownState::Draining);
            }
        }
    }
}

/// Outcome of one child execution, before it is reported.
enum ExecutionOutcome {
    Success { output: String },
    Failure { error: String },
}

/// Result of awaiting the child process.
enum ChildWait {
    Exited(std::process::ExitStatus),
    TimedOut(Duration),
    Killed,
    WaitFailed(std::io::Error),
}

/// A polling worker bound to one database and configuration.
pub struct Worker {
    queue: JobQueue,
    config: QueueConfig,
    id: WorkerId,
    shutdown_rx: watch::Receiver<ShutdownState>,
    shutdown: ShutdownHandle,
}

impl Worker {
    /// Creates a worker with a freshly generated identity.
    pub fn new(database: &Database, config: QueueConfig) -> Self {
        Self::with_id(database, config, WorkerId::generate())
    }

    /// Creates a worker under an externally assigned identity.
    pub fn with_id(database: &Database, config: QueueConfig, id: WorkerId) -> Self {
        let (tx, shutdown_rx) = watch::channel(ShutdownState::Running);
        let shutdown = ShutdownHandle {
            inner: Arc::new(ShutdownHandleInner {
                tx,
                grace: config.shutdown_grace(),
                first_signal: Mutex::new(None),
            }),
        };

        Self {
            queue: JobQueue::new(database, config.clone()),
            config,
            id,
            shutdown_rx,
            shutdown,
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Handle for requesting shutdown from signal handlers or tests.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Runs the claim-execute-report loop until shutdown.
    ///
    /// Transient storage faults are logged and retried after an idle
    /// sleep; a run of consecutive faults halts the worker with the last
    /// error.
    pub async fn run(mut self) -> Result<(), QueueError> {
        info!(worker = %self.id, "worker started");
        let mut storage_faults: u32 = 0;

        loop {
            if *self.shutdown_rx.borrow() != ShutdownState::Running {
                break;
            }

            // Best-effort recovery pass; a failure here must not stop
            // the claim loop.
            if let Err(e) = self.on_queue(|queue| queue.reap_stale_locks()).await {
                warn!(worker = %self.id, error = %e, "stale lock reap failed");
            }

            let worker_id = self.id.clone();
            match self.on_queue(move |queue| queue.claim(&worker_id)).await {
                Ok(Some(job)) => {
                    storage_faults = 0;
                    self.execute_and_report(job).await;
                }
                Ok(None) => {
                    storage_faults = 0;
                    self.idle_sleep().await;
                }
                Err(e) => {
                    storage_faults += 1;
                    if storage_faults >= MAX_CONSECUTIVE_STORAGE_FAULTS {
                        error!(worker = %self.id, error = %e, "persistent storage faults, halting worker");
                        return Err(e);
                    }
                    warn!(worker = %self.id, error = %e, "claim failed, backing off");
                    self.idle_sleep().await;
                }
            }
        }

        info!(worker = %self.id, "worker stopped");
        Ok(())
    }

    /// Sleeps for the poll interval, waking early on a shutdown request.
    async fn idle_sleep(&mut self) {
        let interval = self.config.poll_interval();
        tokio::select! {
            _ = sleep(interval) => {}
            _ = self.shutdown_rx.changed() => {}
        }
    }

    /// Runs a queue call on the blocking thread pool.
    ///
    /// DAL calls sit on synchronous SQLite transactions that can wait
    /// out another process's write lock for the full busy timeout; that
    /// wait must not stall the async executor.
    async fn on_queue<T, F>(&self, f: F) -> Result<T, QueueError>
    where
        F: FnOnce(JobQueue) -> Result<T, QueueError> + Send + 'static,
        T: Send + 'static,
    {
        let queue = self.queue.clone();
        Ok(tokio::task::spawn_blocking(move || f(queue))
            .await
            .map_err(|e| StorageError::BlockingTask(e.to_string()))??)
    }

    async fn execute_and_report(&mut self, job: Job) {
        info!(worker = %self.id, job_id = %job.id, command = %job.command, "executing job");
        let outcome = self.execute(&job).await;

        let job_id = job.id.clone();
        let worker_id = self.id.clone();
        let report = match outcome {
            ExecutionOutcome::Success { output } => {
                let output = (!output.is_empty()).then_some(output);
                self.on_queue(move |queue| queue.report_success(&job_id, &worker_id, output))
                    .await
                    .map(|job| {
                        info!(worker = %self.id, job_id = %job.id, "job completed");
                    })
            }
            ExecutionOutcome::Failure { error } => self
                .on_queue(move |queue| queue.report_failure(&job_id, &worker_id, error))
                .await
                .map(|job| {
                    info!(
                        worker = %self.id,
                        job_id = %job.id,
                        state = %job.state,
                        attempts = job.attempts,
                        "job failed"
                    );
                }),
        };

        match report {
            Ok(()) => {}
            Err(QueueError::LockLost(id)) => {
                // The claim was reclaimed while we ran; whoever holds
                // the row now owns the outcome.
                warn!(worker = %self.id, job_id = %id, "claim lost before report, discarding outcome");
            }
            Err(e) => {
                warn!(worker = %self.id, job_id = %job.id, error = %e, "failed to report outcome");
            }
        }
    }

    /// Spawns the job's command and classifies the result.
    ///
    /// Never returns an error: spawn failures, timeouts, and kills are
    /// all execution failures carried as data.
    async fn execute(&mut self, job: &Job) -> ExecutionOutcome {
        let mut command = build_command(&job.command);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ExecutionOutcome::Failure {
                    error: format!("failed to spawn command: {e}"),
                };
            }
        };

        // Both streams are drained concurrently so the child never
        // blocks on a full pipe, whatever the cap.
        let cap = self.config.output_cap();
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(async move { read_capped(stdout_pipe, cap).await });
        let stderr_task = tokio::spawn(async move { read_capped(stderr_pipe, cap).await });

        let waited = self
            .wait_for_child(&mut child, self.config.worker_timeout())
            .await;

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        match waited {
            ChildWait::Exited(status) if status.success() => ExecutionOutcome::Success {
                output: stdout.trim().to_string(),
            },
            ChildWait::Exited(status) => {
                let stderr = stderr.trim();
                let error = if stderr.is_empty() {
                    match status.code() {
                        Some(code) => format!("command exited with code {code}"),
                        None => "command terminated by signal".to_string(),
                    }
                } else {
                    stderr.to_string()
                };
                ExecutionOutcome::Failure { error }
            }
            ChildWait::TimedOut(limit) => ExecutionOutcome::Failure {
                error: format!("execution timed out after {}s", limit.as_secs()),
            },
            ChildWait::Killed => ExecutionOutcome::Failure {
                error: "terminated by worker shutdown".to_string(),
            },
            ChildWait::WaitFailed(e) => ExecutionOutcome::Failure {
                error: format!("failed to await command: {e}"),
            },
        }
    }

    /// Awaits the child, enforcing the execution timeout and reacting to
    /// shutdown escalation. A plain drain request lets the child finish.
    async fn wait_for_child(&mut self, child: &mut Child, timeout: Option<Duration>) -> ChildWait {
        // A missing timeout is modelled as a deadline far beyond any
        // real execution.
        let limit = timeout.unwrap_or(Duration::from_secs(u64::MAX / 2));
        let timeout_fut = sleep(limit);
        tokio::pin!(timeout_fut);

        loop {
            tokio::select! {
                status = child.wait() => {
                    return match status {
                        Ok(status) => ChildWait::Exited(status),
                        Err(e) => ChildWait::WaitFailed(e),
                    };
                }
                _ = &mut timeout_fut => {
                    warn!(worker = %self.id, "execution timed out, killing child");
                    kill_child(child).await;
                    return ChildWait::TimedOut(limit);
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() {
                        // Sender gone; nothing can escalate any more.
                        let _ = child.wait().await;
                        continue;
                    }
                    if *self.shutdown_rx.borrow() == ShutdownState::Force {
                        kill_child(child).await;
                        return ChildWait::Killed;
                    }
                }
            }
        }
    }
}

async fn kill_child(child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!(error = %e, "failed to kill child process");
    }
}

/// Builds the child-process invocation for a job command.
///
/// The command string is handed to the platform shell verbatim; the
/// worker itself never parses it.
fn build_command(command: &str) -> Command {
    #[cfg(unix)]
    {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(command);
        cmd
    }
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd.exe");
        cmd.arg("/C").arg(command);
        cmd
    }
    #[cfg(not(any(unix, windows)))]
    {
        // No shell available: run the first whitespace token as the
        // program with the rest as arguments.
        let mut parts = command.split_whitespace();
        let mut cmd = Command::new(parts.next().unwrap_or(""));
        cmd.args(parts);
        cmd
    }
}

/// Reads a child stream to the end, keeping at most `cap` bytes and
/// appending [`TRUNCATION_MARKER`] when anything was dropped. The
/// stream is always drained to EOF.
async fn read_capped<R>(reader: Option<R>, cap: usize) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return String::new();
    };

    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    let mut truncated = false;

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if buf.len() < cap {
                    let take = n.min(cap - buf.len());
                    buf.extend_from_slice(&chunk[..take]);
                    truncated |= take < n;
                } else {
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }

    let mut text = String::from_utf8_lossy(&buf).into_owned();
    if truncated {
        text.push_str(TRUNCATION_MARKER);
    }
    text
}
