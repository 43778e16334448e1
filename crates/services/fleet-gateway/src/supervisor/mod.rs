//! Process supervision for camera relays
//!
//! One independent OS process per camera. The supervisor launches relays
//! sequentially, checks each once after a settle delay, and can tear the
//! whole fleet down. A relay that dies after that check is observed as
//! `Exited` but never restarted; it stays down until the next full
//! stop/start cycle.

mod relay;

pub use relay::{GstKvsRelay, RelayCommand, RelayInvocation};

use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::{Child, Command};

use crate::credentials::Credentials;
use crate::error::{Error, Result};
use crate::fleet::{CameraStreamSpec, FleetConfiguration};

/// Lines of relay output attached to a launch failure
const LOG_TAIL_LINES: usize = 5;

/// A relay log at or above this size is rotated to `{id}.log.1` before launch
const MAX_LOG_BYTES: u64 = 8 * 1024 * 1024;

/// Bytes read from the end of a relay log when extracting its tail
const LOG_TAIL_BYTES: u64 = 8 * 1024;

/// Relay lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProcessState {
    /// Registered, not yet spawned
    Idle,
    /// Spawned, waiting out the settle delay
    Launching,
    /// Survived the liveness check
    Running,
    /// Terminal. `code` is `None` when killed by a signal or never spawned
    Exited { code: Option<i32> },
}

impl ProcessState {
    fn can_transition_to(&self, next: &ProcessState) -> bool {
        matches!(
            (self, next),
            (ProcessState::Idle, ProcessState::Launching)
                | (ProcessState::Idle, ProcessState::Exited { .. })
                | (ProcessState::Launching, ProcessState::Running)
                | (ProcessState::Launching, ProcessState::Exited { .. })
                | (ProcessState::Running, ProcessState::Exited { .. })
        )
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::Idle => write!(f, "idle"),
            ProcessState::Launching => write!(f, "launching"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Exited { code: Some(code) } => write!(f, "exited({})", code),
            ProcessState::Exited { code: None } => write!(f, "exited"),
        }
    }
}

/// A relay process owned by the supervisor
pub struct SupervisedProcess {
    pub sink_stream_id: String,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub log_path: PathBuf,
    pid_path: PathBuf,
    state: ProcessState,
    child: Option<Child>,
}

impl SupervisedProcess {
    fn idle(sink_stream_id: &str, log_path: PathBuf, pid_path: PathBuf) -> Self {
        Self {
            sink_stream_id: sink_stream_id.to_string(),
            pid: None,
            started_at: Utc::now(),
            log_path,
            pid_path,
            state: ProcessState::Idle,
            child: None,
        }
    }

    /// Current state
    pub fn state(&self) -> ProcessState {
        self.state
    }

    fn transition(&mut self, next: ProcessState) -> Result<()> {
        if !self.state.can_transition_to(&next) {
            return Err(Error::InvalidStateTransition {
                sink_stream_id: self.sink_stream_id.clone(),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }

    /// Transition along an edge the caller knows is valid
    fn advance(&mut self, next: ProcessState) {
        if let Err(e) = self.transition(next) {
            debug_assert!(false, "{}", e);
            tracing::error!(error = %e, "Relay state machine violated");
        }
    }

    /// Exit code if the process has exited; reaps it
    fn observe_exit(&mut self) -> Option<Option<i32>> {
        let child = self.child.as_mut()?;
        let observed = match child.try_wait() {
            Ok(Some(status)) => Some(status.code()),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(
                    sink_stream_id = %self.sink_stream_id,
                    error = %e,
                    "Failed to query relay status, treating as exited"
                );
                Some(None)
            }
        };
        if observed.is_some() {
            self.child = None;
        }
        observed
    }

    fn snapshot(&self) -> ProcessSnapshot {
        ProcessSnapshot {
            sink_stream_id: self.sink_stream_id.clone(),
            pid: self.pid,
            state: self.state,
            started_at: self.started_at,
            log_path: self.log_path.clone(),
        }
    }
}

/// Serializable view of a supervised process
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessSnapshot {
    pub sink_stream_id: String,
    pub pid: Option<u32>,
    #[serde(flatten)]
    pub state: ProcessState,
    pub started_at: DateTime<Utc>,
    pub log_path: PathBuf,
}

/// A camera whose relay did not survive launch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchFailure {
    pub sink_stream_id: String,
    pub exit_code: Option<i32>,
    pub reason: String,
    pub log_path: PathBuf,
}

impl From<LaunchFailure> for Error {
    fn from(failure: LaunchFailure) -> Self {
        Error::StreamLaunch {
            sink_stream_id: failure.sink_stream_id,
            reason: failure.reason,
        }
    }
}

/// Outcome of [`ProcessSupervisor::start_all`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LaunchReport {
    pub running: Vec<String>,
    pub failed: Vec<LaunchFailure>,
    /// Disabled cameras
    pub skipped: Vec<String>,
}

/// Supervisor settings
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Wait between spawn and the liveness check
    pub settle_delay: Duration,
    pub log_dir: PathBuf,
    pub pid_dir: PathBuf,
}

impl SupervisorSettings {
    /// Settings rooted at a state directory (`logs/` and `run/` below it)
    pub fn under(state_dir: &Path, settle_delay: Duration) -> Self {
        Self {
            settle_delay,
            log_dir: state_dir.join("logs"),
            pid_dir: state_dir.join("run"),
        }
    }
}

/// Launches, tracks and stops one relay process per camera
pub struct ProcessSupervisor {
    relay: Arc<dyn RelayCommand>,
    settings: SupervisorSettings,
    registry: HashMap<String, SupervisedProcess>,
}

impl ProcessSupervisor {
    /// Create an empty supervisor
    pub fn new(relay: Arc<dyn RelayCommand>, settings: SupervisorSettings) -> Self {
        Self {
            relay,
            settings,
            registry: HashMap::new(),
        }
    }

    /// Launch every enabled camera in configuration order
    ///
    /// Cameras are independent: a failed launch is recorded as `Exited` and
    /// logged, and the remaining cameras still start.
    pub async fn start_all(
        &mut self,
        config: &FleetConfiguration,
        credentials: &Credentials,
    ) -> Result<LaunchReport> {
        if !self.registry.is_empty() {
            return Err(Error::FleetActive(self.registry.len()));
        }

        std::fs::create_dir_all(&self.settings.log_dir)?;
        std::fs::create_dir_all(&self.settings.pid_dir)?;

        let stale = self.reap_stale_relays()?;
        if stale > 0 {
            tracing::warn!(stale = stale, pid_dir = %self.settings.pid_dir.display(), "Terminated relays left over from a previous run");
        }

        tracing::info!(
            version = %config.version,
            cameras = config.len(),
            "Starting fleet"
        );

        let mut report = LaunchReport::default();

        for camera in &config.cameras {
            if !camera.enabled {
                tracing::info!(sink_stream_id = %camera.sink_stream_id, "Camera disabled, not launching");
                report.skipped.push(camera.sink_stream_id.clone());
                continue;
            }

            match self.launch(camera, credentials).await {
                Ok(()) => report.running.push(camera.sink_stream_id.clone()),
                Err(failure) => report.failed.push(failure),
            }
        }

        tracing::info!(
            version = %config.version,
            running = report.running.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "Fleet started"
        );

        Ok(report)
    }

    async fn launch(
        &mut self,
        camera: &CameraStreamSpec,
        credentials: &Credentials,
    ) -> std::result::Result<(), LaunchFailure> {
        let id = camera.sink_stream_id.clone();
        let stem = file_stem(&id);
        let mut process = SupervisedProcess::idle(
            &id,
            self.settings.log_dir.join(format!("{}.log", stem)),
            self.settings.pid_dir.join(format!("{}.pid", stem)),
        );

        let invocation = self.relay.build(camera, credentials);

        tracing::info!(
            sink_stream_id = %id,
            label = %camera.display_name(),
            source = %redact_userinfo(&camera.source_uri),
            command = %redact_userinfo(&invocation.display()),
            "Launching relay"
        );

        match spawn_relay(&invocation, &process.log_path, MAX_LOG_BYTES) {
            Ok(child) => {
                process.pid = child.id();
                process.child = Some(child);
                process.advance(ProcessState::Launching);
                if let Some(pid) = process.pid {
                    if let Err(e) = std::fs::write(&process.pid_path, format!("{}\n", pid)) {
                        tracing::warn!(sink_stream_id = %id, error = %e, "Failed to write pid file");
                    }
                }
                self.registry.insert(id.clone(), process);
            }
            Err(e) => {
                process.advance(ProcessState::Exited { code: None });
                let failure = LaunchFailure {
                    sink_stream_id: id.clone(),
                    exit_code: None,
                    reason: format!("spawn failed: {}", e),
                    log_path: process.log_path.clone(),
                };
                log_launch_failure(&failure, "");
                self.registry.insert(id, process);
                return Err(failure);
            }
        }

        tokio::time::sleep(self.settings.settle_delay).await;
        self.check_liveness(&id)
    }

    /// One-shot liveness check after the settle delay
    fn check_liveness(&mut self, id: &str) -> std::result::Result<(), LaunchFailure> {
        let Some(process) = self.registry.get_mut(id) else {
            return Ok(());
        };

        match process.observe_exit() {
            None => {
                process.advance(ProcessState::Running);
                tracing::info!(sink_stream_id = %id, pid = ?process.pid, "Relay running");
                Ok(())
            }
            Some(code) => {
                process.advance(ProcessState::Exited { code });
                let _ = std::fs::remove_file(&process.pid_path);
                let failure = LaunchFailure {
                    sink_stream_id: id.to_string(),
                    exit_code: code,
                    reason: match code {
                        Some(code) => format!("relay exited with code {} during settle period", code),
                        None => "relay terminated by signal during settle period".to_string(),
                    },
                    log_path: process.log_path.clone(),
                };
                log_launch_failure(
                    &failure,
                    &read_log_tail(&process.log_path, LOG_TAIL_LINES, LOG_TAIL_BYTES),
                );
                Err(failure)
            }
        }
    }

    /// Terminate relays recorded in pid files that no registry entry owns
    ///
    /// Only called with an empty registry, so every pid file left in the pid
    /// directory belongs to a gateway that exited without stopping its fleet.
    /// Returns the number of pid files cleared.
    fn reap_stale_relays(&self) -> Result<usize> {
        let mut cleared = 0;

        for entry in std::fs::read_dir(&self.settings.pid_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("pid") {
                continue;
            }

            match std::fs::read_to_string(&path).ok().and_then(|c| c.trim().parse::<u32>().ok()) {
                Some(pid) if pid > 1 => terminate_stale(pid, &path),
                _ => tracing::warn!(path = %path.display(), "Discarding unreadable pid file"),
            }

            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove stale pid file");
            }
            cleared += 1;
        }

        Ok(cleared)
    }

    /// Signal every tracked relay and clear the registry
    ///
    /// Does not wait for the relays to exit. The registry is empty when this
    /// returns, whatever the signalling outcome. Returns the number of
    /// entries removed.
    pub fn stop_all(&mut self) -> usize {
        let removed = self.registry.len();

        for (id, mut process) in self.registry.drain() {
            if let Some(child) = process.child.as_mut() {
                if matches!(child.try_wait(), Ok(None)) {
                    terminate(&id, child);
                }
            }

            if let Err(e) = std::fs::remove_file(&process.pid_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(sink_stream_id = %id, error = %e, "Failed to remove pid file");
                }
            }

            tracing::info!(sink_stream_id = %id, pid = ?process.pid, state = %process.state, "Relay stopped");
        }

        if removed > 0 {
            tracing::info!(stopped = removed, "Fleet stopped");
        }
        removed
    }

    /// Current view of the registry, sorted by sink stream id
    ///
    /// Running relays found dead are recorded as `Exited`.
    pub fn snapshot(&mut self) -> Vec<ProcessSnapshot> {
        for process in self.registry.values_mut() {
            if process.state != ProcessState::Running {
                continue;
            }
            if let Some(code) = process.observe_exit() {
                process.advance(ProcessState::Exited { code });
                tracing::warn!(
                    sink_stream_id = %process.sink_stream_id,
                    exit_code = ?code,
                    log_path = %process.log_path.display(),
                    "Relay exited; it stays down until the next reconfiguration"
                );
            }
        }

        let mut processes: Vec<ProcessSnapshot> = self.registry.values().map(SupervisedProcess::snapshot).collect();
        processes.sort_by(|a, b| a.sink_stream_id.cmp(&b.sink_stream_id));
        processes
    }

    /// Look up a process by sink stream id
    pub fn get(&self, sink_stream_id: &str) -> Option<&SupervisedProcess> {
        self.registry.get(sink_stream_id)
    }

    /// Number of registered processes
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    /// Whether no processes are registered
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }
}

fn spawn_relay(invocation: &RelayInvocation, log_path: &Path, max_log_bytes: u64) -> std::io::Result<Child> {
    rotate_log(log_path, max_log_bytes)?;
    let mut log = OpenOptions::new().create(true).append(true).open(log_path)?;
    writeln!(log, "--- relay launch at {} ---", Utc::now().to_rfc3339())?;
    let log_err = log.try_clone()?;

    let mut command = Command::new(&invocation.program);
    command
        .args(&invocation.args)
        .envs(invocation.env.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));

    // Own process group so terminal signals to the gateway do not reach relays
    #[cfg(unix)]
    command.process_group(0);

    command.spawn()
}

fn terminate(id: &str, child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(sink_stream_id = %id, pid = pid, error = %e, "SIGTERM failed, killing");
                }
            }
        }
    }

    if let Err(e) = child.start_kill() {
        tracing::warn!(sink_stream_id = %id, error = %e, "Failed to kill relay");
    }
}

/// Move a full log aside to `{name}.1`, replacing any older rotation
fn rotate_log(path: &Path, max_bytes: u64) -> std::io::Result<()> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.len() >= max_bytes => {
            let mut rotated = path.as_os_str().to_owned();
            rotated.push(".1");
            std::fs::rename(path, PathBuf::from(rotated))
        }
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// SIGTERM the process group of a relay from a previous run
fn terminate_stale(pid: u32, pid_path: &Path) {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        // Relays lead their own process group
        match killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => tracing::info!(pid = pid, path = %pid_path.display(), "Stopped stale relay"),
            Err(Errno::ESRCH) => tracing::debug!(pid = pid, "Stale relay already gone"),
            Err(e) => tracing::warn!(pid = pid, error = %e, "Failed to stop stale relay"),
        }
    }

    #[cfg(not(unix))]
    tracing::warn!(pid = pid, path = %pid_path.display(), "Cannot signal stale relay on this platform");
}

fn log_launch_failure(failure: &LaunchFailure, log_tail: &str) {
    tracing::warn!(
        sink_stream_id = %failure.sink_stream_id,
        exit_code = ?failure.exit_code,
        log_path = %failure.log_path.display(),
        log_tail = %log_tail,
        reason = %failure.reason,
        "StreamLaunchFailure"
    );
}

/// Last `lines` lines within the final `max_bytes` of a log
fn read_log_tail(path: &Path, lines: usize, max_bytes: u64) -> String {
    let Ok(mut file) = File::open(path) else {
        return String::new();
    };
    let Ok(len) = file.metadata().map(|m| m.len()) else {
        return String::new();
    };

    let start = len.saturating_sub(max_bytes);
    let mut buf = Vec::with_capacity((len - start) as usize);
    if file.seek(SeekFrom::Start(start)).is_err() || file.read_to_end(&mut buf).is_err() {
        return String::new();
    }

    let content = String::from_utf8_lossy(&buf);
    let mut all: Vec<&str> = content.lines().collect();
    // first line is partial when reading from the middle of the file
    if start > 0 && !all.is_empty() {
        all.remove(0);
    }
    all[all.len().saturating_sub(lines)..].join("\n")
}

/// File name stem for a sink stream id
fn file_stem(sink_stream_id: &str) -> String {
    sink_stream_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Strip `user:password@` from a URI for logging
fn redact_userinfo(uri: &str) -> String {
    match (uri.find("://"), uri.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}***{}", &uri[..scheme_end + 3], &uri[at..])
        }
        _ => uri.to_string(),
    }
}
