//! Process supervisor: owns the language server child process.
//!
//! Liveness is observed two ways. [`ProcessSupervisor::is_alive`] polls the
//! exit status without blocking. A watcher task subscribed to `SIGCHLD`
//! re-checks the tracked child whenever any child of this process exits,
//! so auxiliary processes exiting are not mistaken for the server.
//!
//! Neither path does protocol I/O or teardown. They flip the process's
//! liveness flag and enqueue a [`LivenessEvent`]; the manager consumes
//! events at its next poll point.

use std::fs::OpenOptions;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::LspError;
use crate::types::LspConfig;

/// How long a server gets to exit on its own after `exit`.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// How long a server gets to exit after SIGTERM.
const TERM_GRACE: Duration = Duration::from_secs(1);

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[cfg(not(unix))]
const WATCH_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Something happened that means the server can no longer be trusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessEvent {
    /// The tracked child exited outside of an explicit stop.
    ChildExited {
        pid: u32,
        status: Option<ExitStatus>,
    },
    /// Framed I/O with the child failed fatally.
    TransportFailed { pid: u32, reason: String },
}

impl LivenessEvent {
    #[must_use]
    pub fn pid(&self) -> u32 {
        match self {
            Self::ChildExited { pid, .. } | Self::TransportFailed { pid, .. } => *pid,
        }
    }

    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::ChildExited {
                status: Some(status),
                ..
            } => format!("server process exited ({status})"),
            Self::ChildExited { status: None, .. } => String::from("server process exited"),
            Self::TransportFailed { reason, .. } => format!("transport failed: {reason}"),
        }
    }
}

/// Capability handed to the correlator: observe whether the process it
/// talks to is still alive, and report transport failures.
///
/// It never exposes the OS-level process.
#[derive(Debug, Clone)]
pub struct LivenessHandle {
    pid: u32,
    alive: watch::Receiver<bool>,
    report: mpsc::UnboundedSender<LivenessEvent>,
}

impl LivenessHandle {
    /// A handle not tied to a supervised process, for driving a
    /// correlator over arbitrary streams.
    ///
    /// Dropping the returned sender counts as the peer going down.
    #[must_use]
    pub fn detached(
        pid: u32,
    ) -> (
        Self,
        watch::Sender<bool>,
        mpsc::UnboundedReceiver<LivenessEvent>,
    ) {
        let (alive_tx, alive_rx) = watch::channel(true);
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let handle = Self {
            pid,
            alive: alive_rx,
            report: report_tx,
        };
        (handle, alive_tx, report_rx)
    }

    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// False once the process is observed down or the sender is gone.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        *self.alive.borrow() && self.alive.has_changed().is_ok()
    }

    /// Resolves once the process is observed down. Cancel-safe.
    pub async fn down(&mut self) {
        // A dropped sender means the supervisor let go of the process.
        let _ = self.alive.wait_for(|alive| !*alive).await;
    }

    pub fn report_transport_failure(&self, reason: String) {
        let event = LivenessEvent::TransportFailed {
            pid: self.pid,
            reason,
        };
        if self.report.send(event).is_err() {
            tracing::debug!(pid = self.pid, "Liveness receiver gone; dropping event");
        }
    }
}

/// A freshly spawned server: its pid, pipes and liveness capability.
pub struct ProcessHandle {
    pub pid: u32,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub liveness: LivenessHandle,
}

/// Shared between the supervisor and its watcher task so an exit is
/// reported at most once, whichever path sees it first.
#[derive(Clone)]
struct ExitReporter {
    pid: u32,
    alive: Arc<watch::Sender<bool>>,
    stopping: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<LivenessEvent>,
}

impl ExitReporter {
    fn child_exited(&self, status: Option<ExitStatus>) {
        if !self.alive.send_replace(false) {
            return;
        }
        if self.stopping.load(Ordering::SeqCst) {
            tracing::debug!(pid = self.pid, ?status, "Language server exited during stop");
            return;
        }
        tracing::warn!(pid = self.pid, ?status, "Language server exited unexpectedly");
        let _ = self.events.send(LivenessEvent::ChildExited {
            pid: self.pid,
            status,
        });
    }
}

struct TrackedProcess {
    pid: u32,
    child: Arc<Mutex<Child>>,
    reporter: ExitReporter,
    watcher: JoinHandle<()>,
}

impl Drop for TrackedProcess {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

/// `Some(status)` once the child has exited, `None` while it runs.
fn poll_exit(child: &Mutex<Child>) -> Option<Option<ExitStatus>> {
    let mut child = child.lock().unwrap_or_else(PoisonError::into_inner);
    match child.try_wait() {
        Ok(Some(status)) => Some(Some(status)),
        Ok(None) => None,
        Err(e) => {
            tracing::warn!("Exit-status poll failed, treating server as gone: {e}");
            Some(None)
        }
    }
}

async fn wait_exit(child: &Mutex<Child>, grace: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        if poll_exit(child).is_some() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
}

#[cfg(unix)]
fn terminate(child: &Mutex<Child>, pid: u32) {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        tracing::warn!(pid, "pid out of range for SIGTERM; killing instead");
        force_kill(child);
        return;
    };
    // The child has not been reaped yet (we are the only reaper), so the
    // pid still names it.
    let rc = unsafe { libc::kill(raw, libc::SIGTERM) };
    if rc != 0 {
        tracing::debug!(
            pid,
            "SIGTERM failed: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn terminate(child: &Mutex<Child>, _pid: u32) {
    force_kill(child);
}

fn force_kill(child: &Mutex<Child>) {
    let mut child = child.lock().unwrap_or_else(PoisonError::into_inner);
    if let Err(e) = child.start_kill() {
        tracing::debug!("Kill failed: {e}");
    }
}

#[cfg(unix)]
async fn watch_child(
    child: Arc<Mutex<Child>>,
    reporter: ExitReporter,
    mut sigchld: tokio::signal::unix::Signal,
) {
    loop {
        if let Some(status) = poll_exit(&child) {
            reporter.child_exited(status);
            return;
        }
        // Any child exiting raises SIGCHLD; the poll above filters for ours.
        if sigchld.recv().await.is_none() {
            return;
        }
    }
}

#[cfg(not(unix))]
async fn watch_child(child: Arc<Mutex<Child>>, reporter: ExitReporter) {
    let mut tick = tokio::time::interval(WATCH_POLL_INTERVAL);
    loop {
        tick.tick().await;
        if let Some(status) = poll_exit(&child) {
            reporter.child_exited(status);
            return;
        }
    }
}

fn open_log_sink(path: &Path) -> Stdio {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && let Err(e) = std::fs::create_dir_all(parent)
    {
        tracing::warn!(
            "Failed to create log dir {}: {e}; discarding server stderr",
            parent.display()
        );
        return Stdio::null();
    }
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Stdio::from(file),
        Err(e) => {
            tracing::warn!(
                "Failed to open server log {}: {e}; discarding server stderr",
                path.display()
            );
            Stdio::null()
        }
    }
}

fn spawn_error(command: &str, source: std::io::Error) -> LspError {
    LspError::Spawn {
        command: command.to_string(),
        source,
    }
}

/// Owns at most one server process at a time.
pub struct ProcessSupervisor {
    process: Option<TrackedProcess>,
    events_tx: mpsc::UnboundedSender<LivenessEvent>,
    events_rx: mpsc::UnboundedReceiver<LivenessEvent>,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    #[must_use]
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            process: None,
            events_tx,
            events_rx,
        }
    }

    /// Spawn the server with stdin/stdout piped and stderr sent to the
    /// configured log file (or discarded).
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self, config: &LspConfig) -> Result<ProcessHandle, LspError> {
        if let Some(old) = self.process.take() {
            tracing::warn!(pid = old.pid, "Starting a new server while one is tracked; killing it");
            old.reporter.stopping.store(true, Ordering::SeqCst);
            force_kill(&old.child);
        }

        let resolved = which::which(&config.command).map_err(|e| {
            spawn_error(
                &config.command,
                std::io::Error::new(std::io::ErrorKind::NotFound, e),
            )
        })?;

        let stderr = match &config.log_path {
            Some(path) => open_log_sink(path),
            None => Stdio::null(),
        };

        // Subscribe before spawning so an immediate exit is not missed.
        #[cfg(unix)]
        let sigchld = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::child())
            .map_err(|e| spawn_error(&config.command, e))?;

        let mut child = Command::new(&resolved)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(&config.command, e))?;

        let pid = child
            .id()
            .ok_or_else(|| spawn_error(&config.command, std::io::Error::other("exited at spawn")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error(&config.command, std::io::Error::other("no stdin")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error(&config.command, std::io::Error::other("no stdout")))?;

        let (alive_tx, alive_rx) = watch::channel(true);
        let reporter = ExitReporter {
            pid,
            alive: Arc::new(alive_tx),
            stopping: Arc::new(AtomicBool::new(false)),
            events: self.events_tx.clone(),
        };
        let child = Arc::new(Mutex::new(child));

        #[cfg(unix)]
        let watcher = tokio::spawn(watch_child(child.clone(), reporter.clone(), sigchld));
        #[cfg(not(unix))]
        let watcher = tokio::spawn(watch_child(child.clone(), reporter.clone()));

        tracing::info!(pid, command = %resolved.display(), "Language server started");

        self.process = Some(TrackedProcess {
            pid,
            child,
            reporter,
            watcher,
        });

        Ok(ProcessHandle {
            pid,
            stdin,
            stdout,
            liveness: LivenessHandle {
                pid,
                alive: alive_rx,
                report: self.events_tx.clone(),
            },
        })
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.pid)
    }

    /// Non-blocking exit-status poll of the tracked process.
    ///
    /// An exit found here is reported exactly like one found by the
    /// watcher.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        let Some(process) = &self.process else {
            return false;
        };
        if !*process.reporter.alive.borrow() {
            return false;
        }
        match poll_exit(&process.child) {
            Some(status) => {
                process.reporter.child_exited(status);
                false
            }
            None => true,
        }
    }

    /// Mark the current process as being stopped on purpose: its exit is
    /// expected and will not be reported.
    pub fn begin_shutdown(&self) {
        if let Some(process) = &self.process {
            process.reporter.stopping.store(true, Ordering::SeqCst);
        }
    }

    /// Drain liveness events that concern the current process.
    ///
    /// Events about earlier processes are stale and dropped.
    pub fn take_events(&mut self) -> Vec<LivenessEvent> {
        let current = self.pid();
        let mut events = Vec::new();
        while let Ok(event) = self.events_rx.try_recv() {
            if Some(event.pid()) == current {
                events.push(event);
            } else {
                tracing::trace!(pid = event.pid(), "Dropping stale liveness event");
            }
        }
        events
    }

    /// Make sure the process is gone and release everything tied to it.
    ///
    /// The caller has already asked the server to shut down and closed the
    /// pipes. Escalates from waiting, to SIGTERM, to kill.
    pub async fn stop(&mut self) {
        let Some(process) = self.process.take() else {
            return;
        };
        process.reporter.stopping.store(true, Ordering::SeqCst);
        process.watcher.abort();
        let pid = process.pid;

        if !wait_exit(&process.child, EXIT_GRACE).await {
            tracing::debug!(pid, "Language server did not exit in time; terminating");
            terminate(&process.child, pid);
            if !wait_exit(&process.child, TERM_GRACE).await {
                tracing::warn!(pid, "Language server ignored terminate; killing");
                force_kill(&process.child);
                if !wait_exit(&process.child, TERM_GRACE).await {
                    tracing::warn!(pid, "Language server still not reaped after kill");
                }
            }
        }

        process.reporter.alive.send_replace(false);
        tracing::info!(pid, "Language server stopped");
    }
}
