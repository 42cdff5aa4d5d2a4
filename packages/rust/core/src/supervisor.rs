//! Subprocess supervision for SDK-backed provider instances.
//!
//! The [`Supervisor`] spawns children, drains their stdout/stderr into a shared
//! log channel (one reader task per stream), watches for exit, and is the only
//! place that moves a [`ProcessHandle`] through its lifecycle:
//!
//! ```text
//! Starting ──activate──▶ Active
//!    │                     │
//!    └──────retire─────────┴──▶ Draining ──▶ Dead
//!    └──────────exit───────┴──────────────▶ Dead
//! ```

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use sourcehub_providers::LaunchSpec;
use sourcehub_shared::{Capability, Params, Result, SourceHubError, SupervisorConfig};

use crate::instance::{Instance, InstanceTable};

/// Line written to a child's stdin when it is asked to stop.
const SHUTDOWN_LINE: &[u8] = b"{\"type\":\"shutdown\"}\n";

/// Longest line forwarded from a child; the rest of a longer line is dropped.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Extra time allowed after a kill for the monitor task to observe the exit.
const KILL_SETTLE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle state of a provider subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Starting,
    Active,
    Draining,
    Dead,
}

impl ProcessState {
    /// Whether dispatch may still route calls to the process.
    pub fn is_alive(self) -> bool {
        matches!(self, Self::Starting | Self::Active)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Dead => "dead",
        }
    }

    fn can_move_to(self, next: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, next),
            (Starting, Active) | (Starting | Active, Draining) | (Starting | Active | Draining, Dead)
        )
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
struct Lifecycle {
    state: ProcessState,
    exited_at: Option<DateTime<Utc>>,
    exit_status: Option<String>,
}

/// Shared handle to one supervised child process.
///
/// The child itself is owned by its monitor task; this handle exposes state
/// and the stop request only.
#[derive(Debug)]
pub struct ProcessHandle {
    instance_id: String,
    instance_name: Arc<str>,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    lifecycle: watch::Sender<Lifecycle>,
    stop: CancellationToken,
}

impl ProcessHandle {
    fn new(instance_id: &str, instance_name: Arc<str>, pid: Option<u32>) -> Self {
        let (lifecycle, _) = watch::channel(Lifecycle {
            state: ProcessState::Starting,
            exited_at: None,
            exit_status: None,
        });
        Self {
            instance_id: instance_id.to_string(),
            instance_name,
            pid,
            started_at: Utc::now(),
            lifecycle,
            stop: CancellationToken::new(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn state(&self) -> ProcessState {
        self.lifecycle.borrow().state
    }

    pub fn is_alive(&self) -> bool {
        self.state().is_alive()
    }

    pub fn exited_at(&self) -> Option<DateTime<Utc>> {
        self.lifecycle.borrow().exited_at
    }

    /// Exit status as reported by the OS, once the process is dead.
    pub fn exit_status(&self) -> Option<String> {
        self.lifecycle.borrow().exit_status.clone()
    }

    /// Wait until the process reaches `Dead`.
    pub async fn wait_dead(&self) {
        let mut rx = self.lifecycle.subscribe();
        // Only fails if the sender is gone, and the sender lives in `self`.
        let _ = rx.wait_for(|l| l.state == ProcessState::Dead).await;
    }

    /// Apply a transition if the state machine allows it.
    fn transition(&self, next: ProcessState) -> bool {
        self.lifecycle.send_if_modified(|l| {
            if l.state.can_move_to(next) {
                l.state = next;
                true
            } else {
                false
            }
        })
    }

    fn mark_dead(&self, status: String) {
        self.lifecycle.send_if_modified(|l| {
            if l.state == ProcessState::Dead {
                return false;
            }
            l.state = ProcessState::Dead;
            l.exited_at = Some(Utc::now());
            l.exit_status = Some(status);
            true
        });
    }
}

// ---------------------------------------------------------------------------
// Log records
// ---------------------------------------------------------------------------

/// Which child stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl std::fmt::Display for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One trimmed line drained from a child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub instance_id: String,
    pub instance_name: Arc<str>,
    pub stream: LogStream,
    pub message: String,
}

/// Consume drained lines and emit them as tracing events until every sender is gone.
pub async fn run_log_sink(mut rx: mpsc::Receiver<LogRecord>) {
    while let Some(record) = rx.recv().await {
        info!(
            target: "sourcehub::provider",
            instance = %record.instance_name,
            stream = %record.stream,
            "{}",
            record.message
        );
    }
    debug!("provider log sink closed");
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Owns child processes of subprocess-backed instances.
#[derive(Debug, Clone)]
pub struct Supervisor {
    config: SupervisorConfig,
    log_tx: mpsc::Sender<LogRecord>,
}

impl Supervisor {
    /// Create a supervisor forwarding drained lines to `log_tx`.
    pub fn new(config: SupervisorConfig, log_tx: mpsc::Sender<LogRecord>) -> Self {
        Self { config, log_tx }
    }

    /// Create a supervisor whose lines go to a spawned [`run_log_sink`] task.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn with_tracing_sink(config: SupervisorConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.log_channel_capacity.max(1));
        let sink = tokio::spawn(run_log_sink(rx));
        (Self::new(config, tx), sink)
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Spawn a child and start draining and monitoring it.
    ///
    /// The returned handle starts in [`ProcessState::Starting`].
    #[instrument(skip_all, fields(instance = %instance_name))]
    pub fn launch(
        &self,
        instance_id: &str,
        instance_name: &str,
        launch: &LaunchSpec,
    ) -> Result<Arc<ProcessHandle>> {
        let mut child = Command::new(&launch.program)
            .args(&launch.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SourceHubError::subprocess(
                    instance_name,
                    format!("failed to spawn {}: {e}", launch.program.display()),
                )
            })?;

        let name: Arc<str> = Arc::from(instance_name);
        let handle = Arc::new(ProcessHandle::new(instance_id, Arc::clone(&name), child.id()));

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(drain(
                stdout,
                LogStream::Stdout,
                Arc::clone(&handle),
                self.log_tx.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain(
                stderr,
                LogStream::Stderr,
                Arc::clone(&handle),
                self.log_tx.clone(),
            ));
        }
        let stdin = child.stdin.take();
        tokio::spawn(monitor(
            child,
            stdin,
            Arc::clone(&handle),
            self.config.shutdown_grace(),
        ));

        info!(pid = ?handle.pid(), program = %launch.program.display(), "provider process started");
        Ok(handle)
    }

    /// Run the `activate` handshake on instance `id`.
    ///
    /// Returns `Ok(None)` when `id` is not in `table`. A successful call moves
    /// a `Starting` process to `Active`.
    #[instrument(skip(self, table, params))]
    pub async fn activate(
        &self,
        table: &InstanceTable,
        id: &str,
        params: &Params,
        call_timeout: Duration,
    ) -> Result<Option<Value>> {
        let Some(instance) = table.get(id) else {
            debug!("activate for unknown instance");
            return Ok(None);
        };

        if !instance.capabilities().contains(Capability::Activate) {
            return Err(SourceHubError::provider(
                instance.name(),
                "activate",
                "instance does not advertise activate",
            ));
        }
        if let Some(process) = instance.process().filter(|p| !p.is_alive()) {
            return Err(SourceHubError::ProcessExited {
                instance: instance.name().to_string(),
                status: process
                    .exit_status()
                    .unwrap_or_else(|| process.state().to_string()),
            });
        }

        let value = tokio::time::timeout(call_timeout, instance.provider().activate(params))
            .await
            .map_err(|_| SourceHubError::Timeout {
                instance: instance.name().to_string(),
                operation: "activate".into(),
                after: call_timeout,
            })??;

        if let Some(process) = instance.process() {
            if process.transition(ProcessState::Active) {
                info!(instance = %instance.name(), "provider process active");
            }
        }
        Ok(Some(value))
    }

    /// Stop the processes of superseded instances and wait for them to die.
    ///
    /// Stop requests go out to every process before any wait starts, so the
    /// total wait is bounded by one grace period plus settle time.
    pub async fn retire<I>(&self, instances: I)
    where
        I: IntoIterator<Item = Arc<Instance>>,
    {
        let processes: Vec<Arc<ProcessHandle>> = instances
            .into_iter()
            .filter_map(|i| i.process().cloned())
            .collect();

        for process in &processes {
            if process.transition(ProcessState::Draining) {
                debug!(instance = %process.instance_name(), "retiring provider process");
            }
            process.stop.cancel();
        }

        let bound = self.config.shutdown_grace() + KILL_SETTLE;
        for process in &processes {
            if tokio::time::timeout(bound, process.wait_dead()).await.is_err() {
                warn!(
                    instance = %process.instance_name(),
                    "provider process did not report exit after kill"
                );
            }
        }
    }
}

/// Forward trimmed lines from one child stream until EOF.
///
/// Lines are decoded lossily so a stray non-UTF-8 byte cannot stop draining,
/// and cut at [`MAX_LINE_BYTES`].
async fn drain<R>(
    reader: R,
    stream: LogStream,
    handle: Arc<ProcessHandle>,
    tx: mpsc::Sender<LogRecord>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        match read_capped_line(&mut reader, &mut buf, MAX_LINE_BYTES).await {
            Ok(None) => break,
            Ok(Some(truncated)) => {
                let line = String::from_utf8_lossy(&buf);
                let message = line.trim();
                if message.is_empty() {
                    continue;
                }
                let message = if truncated {
                    format!("{message} [truncated]")
                } else {
                    message.to_string()
                };
                let record = LogRecord {
                    instance_id: handle.instance_id.clone(),
                    instance_name: Arc::clone(&handle.instance_name),
                    stream,
                    message,
                };
                if tx.send(record).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(
                    instance = %handle.instance_name(),
                    stream = %stream,
                    error = %e,
                    "failed to read provider output, marking instance unavailable"
                );
                handle.transition(ProcessState::Draining);
                handle.stop.cancel();
                break;
            }
        }
    }
}

/// Read one line into `buf`, keeping at most `limit` bytes.
///
/// Returns `None` at EOF, otherwise whether the line was cut. The remainder of
/// a cut line is consumed and discarded.
async fn read_capped_line<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    limit: usize,
) -> std::io::Result<Option<bool>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let read = (&mut *reader)
        .take(limit as u64)
        .read_until(b'\n', buf)
        .await?;
    if read == 0 {
        return Ok(None);
    }
    if read < limit || buf.last() == Some(&b'\n') {
        return Ok(Some(false));
    }

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            break;
        }
        match available.iter().position(|b| *b == b'\n') {
            Some(pos) => {
                reader.consume(pos + 1);
                break;
            }
            None => {
                let len = available.len();
                reader.consume(len);
            }
        }
    }
    Ok(Some(true))
}

/// Own the child until it exits, stopping it when the handle is cancelled.
async fn monitor(
    mut child: Child,
    mut stdin: Option<ChildStdin>,
    handle: Arc<ProcessHandle>,
    grace: Duration,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = handle.stop.cancelled() => None,
    };

    let status = match exited {
        Some(status) => status,
        None => {
            if let Some(mut pipe) = stdin.take() {
                // A child that already closed stdin just gets killed below.
                let _ = pipe.write_all(SHUTDOWN_LINE).await;
                let _ = pipe.flush().await;
            }
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    warn!(instance = %handle.instance_name(), "grace period elapsed, killing provider process");
                    if let Err(e) = child.start_kill() {
                        warn!(instance = %handle.instance_name(), error = %e, "failed to kill provider process");
                    }
                    child.wait().await
                }
            }
        }
    };
    drop(stdin);

    let status = match status {
        Ok(status) => status.to_string(),
        Err(e) => format!("wait failed: {e}"),
    };
    let expected = handle.state() == ProcessState::Draining;
    handle.mark_dead(status.clone());

    if expected {
        info!(instance = %handle.instance_name(), %status, "provider process stopped");
    } else {
        warn!(instance = %handle.instance_name(), %status, "provider process exited unexpectedly");
    }
}
