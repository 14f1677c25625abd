//! Supervision of materialized targets.
//!
//! The supervisor owns the single piece of global mutable state in the
//! system: the map from package key to managed child. Children run in their
//! own process group so a group-directed signal stops the whole subtree;
//! their stdout/stderr are scanned line by line into a bounded tail ring and
//! published on the broadcast bus along with lifecycle transitions.

mod tail;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;

pub use tail::TailReader;

use crate::bus::{LogBus, LogEvent, LogStream};

/// Grace period between SIGTERM and SIGKILL when stopping a child.
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// Capacity of the per-child stdout tail ring, in lines.
pub const TAIL_CAPACITY: usize = 1024;

/// Lifecycle state of a managed child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Built and ready, or exited.
    Stopped,
    /// A live OS process spawned by this supervisor exists.
    Running,
    /// The build failed; terminal until the next materialization.
    BuildFailed,
}

impl RunStatus {
    /// Whether the child currently has a live process.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
            Self::BuildFailed => write!(f, "build_failed"),
        }
    }
}

/// What the materializer installs for each target.
#[derive(Debug, Clone)]
pub struct RunnableSpec {
    /// Display name.
    pub name: String,

    /// Resolved binary, absent when the build failed.
    pub binary_path: Option<PathBuf>,

    /// Build failure message, when the build failed.
    pub build_error: Option<String>,
}

impl RunnableSpec {
    /// Spec for a successfully built target.
    #[must_use]
    pub fn built(name: impl Into<String>, binary_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            binary_path: Some(binary_path.into()),
            build_error: None,
        }
    }

    /// Spec for a target whose build failed.
    #[must_use]
    pub fn failed(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            binary_path: None,
            build_error: Some(error.into()),
        }
    }
}

/// The supervisor's per-target record.
#[derive(Debug)]
struct Runnable {
    name: String,
    binary_path: Option<PathBuf>,
    build_error: Option<String>,
    status: RunStatus,
    pid: Option<u32>,
    pgid: Option<i32>,
    started_at: Option<DateTime<Utc>>,
    tail: Arc<Mutex<VecDeque<String>>>,
    done: Option<watch::Receiver<bool>>,
}

impl Runnable {
    fn from_spec(spec: RunnableSpec) -> Self {
        let status = if spec.build_error.is_some() {
            RunStatus::BuildFailed
        } else {
            RunStatus::Stopped
        };
        Self {
            name: spec.name,
            binary_path: spec.binary_path,
            build_error: spec.build_error,
            status,
            pid: None,
            pgid: None,
            started_at: None,
            tail: Arc::new(Mutex::new(VecDeque::with_capacity(TAIL_CAPACITY))),
            done: None,
        }
    }
}

/// Defensive copy of a managed child's public fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnableSnapshot {
    /// Package key.
    pub key: String,

    /// Display name.
    pub name: String,

    /// Lifecycle state.
    pub status: RunStatus,

    /// OS pid, present exactly while running.
    pub pid: Option<u32>,

    /// Resolved binary path, if the build succeeded.
    pub binary_path: Option<PathBuf>,

    /// Build failure message, if the build failed.
    pub build_error: Option<String>,
}

/// Extended snapshot with resource usage for one child.
#[derive(Debug, Clone)]
pub struct RunnableMetadata {
    /// Lifecycle state.
    pub status: RunStatus,

    /// OS pid, present exactly while running.
    pub pid: Option<u32>,

    /// When the current process was started.
    pub start_time: Option<DateTime<Utc>>,

    /// Human-readable uptime, while running.
    pub uptime: Option<String>,

    /// Resident memory as reported by `ps`, while running.
    pub memory_usage: Option<String>,

    /// CPU percentage as reported by `ps`, while running.
    pub cpu_usage: Option<String>,
}

/// Supervisor errors.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// No managed child under that key.
    #[error("package '{0}' not found")]
    NotFound(String),

    /// The child already has a live process.
    #[error("package '{0}' is already running")]
    AlreadyRunning(String),

    /// The build failed; the child cannot be started.
    #[error("package '{0}' failed to build, cannot run")]
    BuildPreviouslyFailed(String),

    /// No binary was recorded for the child.
    #[error("no binary path for package '{0}'")]
    MissingBinary(String),

    /// The operation requires a running child.
    #[error("package '{0}' is not running")]
    NotRunning(String),

    /// The OS refused to start the child.
    #[error("failed to start '{key}'")]
    SpawnFailed {
        /// Package key.
        key: String,
        /// OS error.
        #[source]
        source: std::io::Error,
    },

    /// The OS refused to signal a process group that should exist.
    #[error("failed to signal '{key}': {source}")]
    SignalFailed {
        /// Package key.
        key: String,
        /// errno from the kill.
        source: Errno,
    },
}

/// Owner of the managed-child map.
///
/// Cheap to clone; clones share the same map and bus. Must be used from
/// within a Tokio runtime — starting a child detaches reader and waiter
/// tasks onto it.
#[derive(Clone)]
pub struct Supervisor {
    items: Arc<RwLock<HashMap<String, Runnable>>>,
    bus: Arc<LogBus>,
}

impl Supervisor {
    /// Create a supervisor publishing onto `bus`.
    #[must_use]
    pub fn new(bus: Arc<LogBus>) -> Self {
        Self {
            items: Arc::new(RwLock::new(HashMap::new())),
            bus,
        }
    }

    /// The bus this supervisor publishes to.
    #[must_use]
    pub fn bus(&self) -> &Arc<LogBus> {
        &self.bus
    }

    /// Atomically replace the whole managed-child map.
    ///
    /// External observers see either the full old set or the full new set.
    /// Callers are responsible for stopping running children first (the
    /// materializer does).
    pub fn replace_all(&self, specs: BTreeMap<String, RunnableSpec>) {
        let fresh: HashMap<String, Runnable> = specs
            .into_iter()
            .map(|(key, spec)| (key, Runnable::from_spec(spec)))
            .collect();
        let mut items = self.items.write().expect("supervisor lock poisoned");
        *items = fresh;
    }

    /// Whether any targets are registered.
    #[must_use]
    pub fn has_items(&self) -> bool {
        !self.items.read().expect("supervisor lock poisoned").is_empty()
    }

    /// Keys of all children currently running.
    #[must_use]
    pub fn running_keys(&self) -> Vec<String> {
        let items = self.items.read().expect("supervisor lock poisoned");
        let mut keys: Vec<String> = items
            .iter()
            .filter(|(_, r)| r.status.is_running())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Start the child registered under `key`.
    ///
    /// The spawn happens under the map lock, so concurrent starts on the
    /// same key serialize: exactly one spawns, the loser gets
    /// [`SupervisorError::AlreadyRunning`]. Returns the new pid.
    pub fn start(&self, key: &str) -> Result<u32, SupervisorError> {
        let mut items = self.items.write().expect("supervisor lock poisoned");
        let runnable = items
            .get_mut(key)
            .ok_or_else(|| SupervisorError::NotFound(key.to_string()))?;

        match runnable.status {
            RunStatus::Running => return Err(SupervisorError::AlreadyRunning(key.to_string())),
            RunStatus::BuildFailed => {
                return Err(SupervisorError::BuildPreviouslyFailed(key.to_string()))
            }
            RunStatus::Stopped => {}
        }
        let binary = runnable
            .binary_path
            .clone()
            .ok_or_else(|| SupervisorError::MissingBinary(key.to_string()))?;

        let mut cmd = Command::new(&binary);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(false);

        let mut child = cmd.spawn().map_err(|source| SupervisorError::SpawnFailed {
            key: key.to_string(),
            source,
        })?;
        let Some(pid) = child.id() else {
            let _ = child.start_kill();
            return Err(SupervisorError::SpawnFailed {
                key: key.to_string(),
                source: std::io::Error::other("child pid unavailable"),
            });
        };
        // process_group(0) makes the child the leader of a fresh group.
        let pgid = pid as i32;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (done_tx, done_rx) = watch::channel(false);

        runnable.status = RunStatus::Running;
        runnable.pid = Some(pid);
        runnable.pgid = Some(pgid);
        runnable.started_at = Some(Utc::now());
        runnable.done = Some(done_rx);
        let tail = Arc::clone(&runnable.tail);
        drop(items);

        tracing::info!(key, pid, binary = %binary.display(), "process started");
        self.bus
            .publish(&LogEvent::now(key, LogStream::System, "started"));

        if let Some(out) = stdout {
            tokio::spawn(read_lines(
                Arc::clone(&self.bus),
                key.to_string(),
                Arc::clone(&tail),
                LogStream::Stdout,
                out,
            ));
        }
        if let Some(err) = stderr {
            tokio::spawn(read_lines(
                Arc::clone(&self.bus),
                key.to_string(),
                Arc::clone(&tail),
                LogStream::Stderr,
                err,
            ));
        }
        tokio::spawn(wait_for_exit(
            self.clone(),
            key.to_string(),
            pid,
            child,
            done_tx,
        ));

        Ok(pid)
    }

    /// Stop the child registered under `key`.
    ///
    /// SIGTERM to the process group, then up to [`STOP_GRACE`] for the
    /// waiter to reap the child, then SIGKILL to the group. Returns only
    /// after the child has been reaped. Never holds the map lock while
    /// waiting.
    pub async fn stop(&self, key: &str) -> Result<(), SupervisorError> {
        let (pgid, mut done) = {
            let items = self.items.read().expect("supervisor lock poisoned");
            let runnable = items
                .get(key)
                .ok_or_else(|| SupervisorError::NotFound(key.to_string()))?;
            if !runnable.status.is_running() {
                return Err(SupervisorError::NotRunning(key.to_string()));
            }
            let pgid = runnable
                .pgid
                .ok_or_else(|| SupervisorError::NotRunning(key.to_string()))?;
            let done = runnable
                .done
                .clone()
                .ok_or_else(|| SupervisorError::NotRunning(key.to_string()))?;
            (pgid, done)
        };

        self.signal_group(key, pgid, Signal::SIGTERM)?;

        let reaped = tokio::time::timeout(STOP_GRACE, done.wait_for(|finished| *finished))
            .await
            .is_ok();
        if !reaped {
            tracing::warn!(key, pgid, "process ignored SIGTERM, forcing kill");
            self.signal_group(key, pgid, Signal::SIGKILL)?;
            let _ = done.wait_for(|finished| *finished).await;
        }

        tracing::info!(key, "process stopped");
        Ok(())
    }

    /// Stop every running child, concurrently. Failures are logged, not
    /// propagated; used on graceful shutdown.
    pub async fn stop_all(&self) {
        let keys = self.running_keys();
        let stops = keys.iter().map(|key| {
            let sup = self.clone();
            let key = key.clone();
            async move {
                if let Err(err) = sup.stop(&key).await {
                    tracing::warn!(%key, %err, "failed to stop process during shutdown");
                }
            }
        });
        futures::future::join_all(stops).await;
    }

    /// Snapshot of one child.
    pub fn status(&self, key: &str) -> Result<RunnableSnapshot, SupervisorError> {
        let items = self.items.read().expect("supervisor lock poisoned");
        let runnable = items
            .get(key)
            .ok_or_else(|| SupervisorError::NotFound(key.to_string()))?;
        Ok(snapshot(key, runnable))
    }

    /// Snapshots of every child, sorted by key.
    #[must_use]
    pub fn list(&self) -> Vec<RunnableSnapshot> {
        let items = self.items.read().expect("supervisor lock poisoned");
        let mut all: Vec<RunnableSnapshot> = items
            .iter()
            .map(|(key, runnable)| snapshot(key, runnable))
            .collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    /// Copy of the child's bounded stdout/stderr tail ring.
    pub fn tail_lines(&self, key: &str) -> Result<Vec<String>, SupervisorError> {
        let items = self.items.read().expect("supervisor lock poisoned");
        let runnable = items
            .get(key)
            .ok_or_else(|| SupervisorError::NotFound(key.to_string()))?;
        let tail = runnable.tail.lock().expect("tail lock poisoned");
        Ok(tail.iter().cloned().collect())
    }

    /// Extended status with uptime and resource usage.
    ///
    /// Memory and CPU come from `ps` and surface as preformatted strings;
    /// `"N/A"` when `ps` fails.
    pub async fn metadata(&self, key: &str) -> Result<RunnableMetadata, SupervisorError> {
        let (status, pid, start_time) = {
            let items = self.items.read().expect("supervisor lock poisoned");
            let runnable = items
                .get(key)
                .ok_or_else(|| SupervisorError::NotFound(key.to_string()))?;
            (runnable.status, runnable.pid, runnable.started_at)
        };

        let mut metadata = RunnableMetadata {
            status,
            pid,
            start_time,
            uptime: None,
            memory_usage: None,
            cpu_usage: None,
        };

        if let (RunStatus::Running, Some(pid), Some(started)) = (status, pid, start_time) {
            let elapsed = (Utc::now() - started).num_seconds().max(0) as u64;
            metadata.uptime =
                Some(humantime::format_duration(Duration::from_secs(elapsed)).to_string());
            metadata.memory_usage = Some(resources::memory_usage(pid).await);
            metadata.cpu_usage = Some(resources::cpu_usage(pid).await);
        }

        Ok(metadata)
    }

    /// Open a byte stream over the child's current and future stdout.
    ///
    /// The stream reaches EOF when the child exits. Fails with
    /// [`SupervisorError::NotRunning`] if the child has no live process.
    pub fn tail(&self, key: &str) -> Result<TailReader, SupervisorError> {
        // Subscribe before the liveness check so no line between check and
        // subscription can be missed.
        let subscription = self.bus.subscribe();
        let running = {
            let items = self.items.read().expect("supervisor lock poisoned");
            match items.get(key) {
                Some(runnable) => runnable.status.is_running(),
                None => {
                    self.bus.unsubscribe(subscription.id());
                    return Err(SupervisorError::NotFound(key.to_string()));
                }
            }
        };
        if !running {
            self.bus.unsubscribe(subscription.id());
            return Err(SupervisorError::NotRunning(key.to_string()));
        }
        Ok(TailReader::new(
            Arc::clone(&self.bus),
            subscription,
            key.to_string(),
        ))
    }

    fn signal_group(&self, key: &str, pgid: i32, signal: Signal) -> Result<(), SupervisorError> {
        match killpg(Pid::from_raw(pgid), signal) {
            Ok(()) => Ok(()),
            // The group can be gone if the child exited between the liveness
            // check and the kill; that is a success, not an error.
            Err(Errno::ESRCH) => {
                tracing::debug!(key, pgid, %signal, "process group already gone");
                Ok(())
            }
            Err(source) => Err(SupervisorError::SignalFailed {
                key: key.to_string(),
                source,
            }),
        }
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let items = self.items.read().expect("supervisor lock poisoned");
        f.debug_struct("Supervisor")
            .field("items", &items.len())
            .finish()
    }
}

fn snapshot(key: &str, runnable: &Runnable) -> RunnableSnapshot {
    RunnableSnapshot {
        key: key.to_string(),
        name: runnable.name.clone(),
        status: runnable.status,
        pid: runnable.pid,
        binary_path: runnable.binary_path.clone(),
        build_error: runnable.build_error.clone(),
    }
}

/// Scan one pipe line by line into the tail ring and onto the bus.
async fn read_lines<R>(
    bus: Arc<LogBus>,
    key: String,
    tail: Arc<Mutex<VecDeque<String>>>,
    stream: LogStream,
    pipe: R,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(pipe).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                {
                    let mut ring = tail.lock().expect("tail lock poisoned");
                    if ring.len() == TAIL_CAPACITY {
                        ring.pop_front();
                    }
                    ring.push_back(line.clone());
                }
                bus.publish(&LogEvent::now(&key, stream, line));
            }
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(%key, %stream, %err, "pipe read ended");
                break;
            }
        }
    }
}

/// Reap the child, write its final state, and release anyone waiting in
/// `stop`.
async fn wait_for_exit(
    supervisor: Supervisor,
    key: String,
    pid: u32,
    mut child: Child,
    done_tx: watch::Sender<bool>,
) {
    let status = child.wait().await;
    let text = match &status {
        Ok(exit) => format!("exited: {exit}"),
        Err(err) => format!("exited: wait error: {err}"),
    };

    {
        let mut items = supervisor
            .items
            .write()
            .expect("supervisor lock poisoned");
        if let Some(runnable) = items.get_mut(&key) {
            // A fresh materialization may have replaced the entry; only
            // clear state that still belongs to this process.
            if runnable.pid == Some(pid) {
                runnable.status = RunStatus::Stopped;
                runnable.pid = None;
                runnable.pgid = None;
                runnable.done = None;
            }
        }
    }

    tracing::info!(%key, pid, outcome = %text, "process exited");
    supervisor
        .bus
        .publish(&LogEvent::now(&key, LogStream::System, text));
    let _ = done_tx.send(true);
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
mod resources {
    use tokio::process::Command;

    async fn ps_field(pid: u32, field: &str) -> Option<String> {
        let output = Command::new("ps")
            .args(["-o", field, "-p", &pid.to_string()])
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!value.is_empty()).then_some(value)
    }

    pub(super) async fn memory_usage(pid: u32) -> String {
        match ps_field(pid, "rss=").await.and_then(|v| v.parse::<f64>().ok()) {
            Some(kb) => format!("{:.1} MB", kb / 1024.0),
            None => "N/A".to_string(),
        }
    }

    pub(super) async fn cpu_usage(pid: u32) -> String {
        match ps_field(pid, "%cpu=").await {
            Some(cpu) => format!("{cpu}%"),
            None => "N/A".to_string(),
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
mod resources {
    pub(super) async fn memory_usage(_pid: u32) -> String {
        "unsupported OS".to_string()
    }

    pub(super) async fn cpu_usage(_pid: u32) -> String {
        "unsupported OS".to_string()
    }
}
