//! LspManager facade: the public API consumed by the CLI.
//!
//! The manager is an explicit context object owning the supervisor, the
//! correlator over the server's pipes and the document sessions. One task
//! drives it through `&mut self`.
//!
//! Crash detection only enqueues liveness events. Every public operation
//! begins by consuming them; that is the single place where the session
//! is torn down and restarted.

use std::path::Path;

use serde_json::Value;
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::mpsc;

use crate::completion::CompletionItem;
use crate::correlator::{Correlator, EventForwarder};
use crate::diagnostics::DiagnosticsIndex;
use crate::documents::DocumentSessions;
use crate::error::LspError;
use crate::protocol;
use crate::supervisor::{LivenessEvent, ProcessSupervisor};
use crate::types::{LspConfig, LspEvent, ServerState};

type ServerCorrelator = Correlator<ChildStdout, ChildStdin>;

/// Lifecycle of the session as the manager sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Running,
    Down,
    ShuttingDown,
    Stopped,
}

/// What to do when the server is lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LossAction {
    Restart,
    Ignore,
}

impl SessionState {
    /// A loss is only unexpected while the session is meant to be up.
    fn on_liveness_lost(self) -> LossAction {
        match self {
            Self::Starting | Self::Running => LossAction::Restart,
            Self::Down | Self::ShuttingDown | Self::Stopped => LossAction::Ignore,
        }
    }

    /// The status reported to consumers, if this state is one.
    #[must_use]
    pub fn status(self) -> Option<ServerState> {
        match self {
            Self::Starting => Some(ServerState::Starting),
            Self::Running => Some(ServerState::Running),
            Self::Down => Some(ServerState::Down),
            Self::Stopped => Some(ServerState::Stopped),
            Self::ShuttingDown => None,
        }
    }
}

/// Public facade for the language server client.
///
/// Constructed via [`LspManager::start`], which spawns and initializes the
/// server. When the server dies outside [`LspManager::stop`] the session
/// goes `Down`, forgets its documents and starts a fresh server.
pub struct LspManager {
    config: LspConfig,
    root_uri: String,
    supervisor: ProcessSupervisor,
    /// Present exactly while the session is `Running`.
    correlator: Option<ServerCorrelator>,
    documents: DocumentSessions,
    forwarder: EventForwarder,
    events_tx: mpsc::UnboundedSender<LspEvent>,
    events_rx: mpsc::UnboundedReceiver<LspEvent>,
    state: SessionState,
    capabilities: Option<Value>,
    restarts: u32,
}

impl LspManager {
    fn idle(config: LspConfig, root_uri: String) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            documents: DocumentSessions::new(config.language_id.clone()),
            config,
            root_uri,
            supervisor: ProcessSupervisor::new(),
            correlator: None,
            forwarder: EventForwarder::new(events_tx.clone()),
            events_tx,
            events_rx,
            state: SessionState::Stopped,
            capabilities: None,
            restarts: 0,
        }
    }

    /// Spawn the server and run the `initialize` handshake.
    ///
    /// `workspace_root` must be absolute; it becomes the `rootUri`.
    pub async fn start(config: LspConfig, workspace_root: &Path) -> Result<Self, LspError> {
        let root_uri = protocol::path_to_file_uri(workspace_root)
            .map_err(|_| LspError::InvalidRoot(workspace_root.to_path_buf()))?;
        let mut manager = Self::idle(config, root_uri.to_string());
        manager.launch().await?;
        Ok(manager)
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        tracing::debug!(from = ?self.state, to = ?next, "Session state changed");
        self.state = next;
        if let Some(status) = next.status() {
            let _ = self.events_tx.send(LspEvent::Status(status));
        }
    }

    async fn launch(&mut self) -> Result<(), LspError> {
        self.set_state(SessionState::Starting);
        tracing::info!(command = %self.config.command, "Starting language server...");

        let handle = match self.supervisor.start(&self.config) {
            Ok(handle) => handle,
            Err(e) => {
                self.set_state(SessionState::Down);
                return Err(e);
            }
        };
        let pid = handle.pid;
        let mut correlator = Correlator::new(
            handle.stdout,
            handle.stdin,
            self.config.timeouts(),
            handle.liveness,
        );

        match self.initialize(&mut correlator).await {
            Ok(capabilities) => {
                self.capabilities = Some(capabilities);
                self.correlator = Some(correlator);
                self.set_state(SessionState::Running);
                tracing::info!(pid, "Language server initialized");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(pid, "Initialize failed: {e}");
                drop(correlator);
                self.supervisor.begin_shutdown();
                self.supervisor.stop().await;
                self.set_state(SessionState::Down);
                Err(e)
            }
        }
    }

    async fn initialize(&mut self, correlator: &mut ServerCorrelator) -> Result<Value, LspError> {
        let params = protocol::initialize_params(&self.root_uri);
        let mut observer = (&mut self.documents, &mut self.forwarder);
        let result = correlator
            .send_request(protocol::INITIALIZE, Some(params), &mut observer)
            .await?;
        let capabilities = match result {
            Value::Object(mut obj) => obj.remove("capabilities").unwrap_or(Value::Null),
            _ => Value::Null,
        };
        correlator
            .send_notification(protocol::INITIALIZED, Some(serde_json::json!({})))
            .await?;
        Ok(capabilities)
    }

    /// Consume queued liveness events; restart if the server was lost.
    async fn process_liveness(&mut self) {
        let mut events = self.supervisor.take_events();
        if events.is_empty() && self.state == SessionState::Running && !self.supervisor.is_alive()
        {
            events = self.supervisor.take_events();
        }
        let Some(event) = events.into_iter().next() else {
            return;
        };
        match self.state.on_liveness_lost() {
            LossAction::Restart => self.recover(&event).await,
            LossAction::Ignore => {
                tracing::debug!(state = ?self.state, "Ignoring liveness event: {}", event.describe());
            }
        }
    }

    async fn recover(&mut self, event: &LivenessEvent) {
        tracing::warn!(pid = event.pid(), "Language server lost: {}", event.describe());
        self.set_state(SessionState::Down);
        if let Some(mut correlator) = self.correlator.take() {
            correlator.discard_pending();
        }
        self.documents.reset();
        self.capabilities = None;
        self.supervisor.begin_shutdown();
        self.supervisor.stop().await;

        self.restarts += 1;
        match self.launch().await {
            Ok(()) => tracing::info!(restarts = self.restarts, "Language server restarted"),
            Err(e) => tracing::error!("Language server restart failed: {e}"),
        }
    }

    /// Act on a fatal error before handing it back, so the caller sees the
    /// session already `Down` (or restarted).
    async fn escalate<T>(&mut self, result: Result<T, LspError>) -> Result<T, LspError> {
        if let Err(e) = &result
            && e.is_fatal()
        {
            self.process_liveness().await;
        }
        result
    }

    /// Start a fresh server after a failed restart. Running sessions are
    /// left alone.
    pub async fn restart(&mut self) -> Result<(), LspError> {
        self.process_liveness().await;
        if self.state == SessionState::Running {
            return Ok(());
        }
        self.launch().await
    }

    pub async fn open(&mut self, uri: &str, text: &str, language_id: &str) -> Result<(), LspError> {
        self.process_liveness().await;
        let Self {
            correlator: Some(correlator),
            documents,
            ..
        } = self
        else {
            return Err(LspError::NotRunning);
        };
        let result = documents.open(correlator, uri, text, language_id).await;
        self.escalate(result).await
    }

    pub async fn change(&mut self, uri: &str, text: &str) -> Result<(), LspError> {
        self.process_liveness().await;
        let Self {
            correlator: Some(correlator),
            documents,
            ..
        } = self
        else {
            return Err(LspError::NotRunning);
        };
        let result = documents.change(correlator, uri, text).await;
        self.escalate(result).await
    }

    pub async fn save(&mut self, uri: &str) -> Result<(), LspError> {
        self.process_liveness().await;
        let Self {
            correlator: Some(correlator),
            documents,
            ..
        } = self
        else {
            return Err(LspError::NotRunning);
        };
        let result = documents.save(correlator, uri).await;
        self.escalate(result).await
    }

    pub async fn close(&mut self, uri: &str) -> Result<(), LspError> {
        self.process_liveness().await;
        let Self {
            correlator: Some(correlator),
            documents,
            ..
        } = self
        else {
            return Err(LspError::NotRunning);
        };
        let result = documents.close(correlator, uri).await;
        self.escalate(result).await
    }

    pub async fn close_all(&mut self) -> Result<(), LspError> {
        self.process_liveness().await;
        let Self {
            correlator: Some(correlator),
            documents,
            ..
        } = self
        else {
            return Err(LspError::NotRunning);
        };
        let result = documents.close_all(correlator).await;
        self.escalate(result).await
    }

    /// Ask for completions at a 0-based position.
    ///
    /// A result the client cannot parse is logged and yields no items.
    pub async fn completion(
        &mut self,
        uri: &str,
        line: u32,
        character: u32,
    ) -> Result<Vec<CompletionItem>, LspError> {
        self.process_liveness().await;
        let Self {
            correlator: Some(correlator),
            documents,
            forwarder,
            ..
        } = self
        else {
            return Err(LspError::NotRunning);
        };
        let params = protocol::completion_params(uri, line, character);
        let result = correlator
            .send_request(protocol::COMPLETION, Some(params), &mut (documents, forwarder))
            .await;
        let result = self.escalate(result).await?;
        match protocol::parse_completion_result(result) {
            Ok(items) => Ok(items),
            Err(e) => {
                tracing::warn!(uri, "Unparseable completion result: {e}");
                Ok(Vec::new())
            }
        }
    }

    /// The diagnostics index of an open document, after dispatching
    /// whatever the server already sent.
    pub async fn diagnostics(&mut self, uri: &str) -> Option<DiagnosticsIndex> {
        if let Err(e) = self.poll().await {
            tracing::debug!("Poll before diagnostics failed: {e}");
        }
        self.documents.index(uri)
    }

    /// Handle liveness events and dispatch every frame that is ready.
    ///
    /// Returns how many frames were handled. A transport failure found
    /// here is acted on before returning.
    pub async fn poll(&mut self) -> Result<usize, LspError> {
        // Output written while this task was busy is only visible to the
        // non-blocking read once the reactor has run.
        tokio::task::yield_now().await;
        self.process_liveness().await;
        let Self {
            correlator: Some(correlator),
            documents,
            forwarder,
            ..
        } = self
        else {
            return Ok(0);
        };
        let result = correlator.pump_incoming(&mut (documents, forwarder));
        self.escalate(result).await
    }

    /// Whether a server is running, its transport has not failed and its
    /// process has not exited.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.state == SessionState::Running
            && self
                .correlator
                .as_ref()
                .is_some_and(ServerCorrelator::is_alive)
            && self.supervisor.is_alive()
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.supervisor.pid()
    }

    /// Server capabilities from the last successful `initialize`.
    #[must_use]
    pub fn capabilities(&self) -> Option<&Value> {
        self.capabilities.as_ref()
    }

    #[must_use]
    pub fn documents(&self) -> &DocumentSessions {
        &self.documents
    }

    /// How many times the server was restarted after being lost.
    #[must_use]
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Drain events emitted since the last call. Non-blocking.
    pub fn take_events(&mut self) -> Vec<LspEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events_rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Close documents, run the `shutdown`/`exit` exchange and make sure
    /// the process is gone.
    ///
    /// Failures along the way are logged; the process is always released.
    pub async fn stop(&mut self) {
        if self.state == SessionState::Stopped && self.correlator.is_none() {
            return;
        }
        self.set_state(SessionState::ShuttingDown);
        self.supervisor.begin_shutdown();

        if let Some(mut correlator) = self.correlator.take() {
            if let Err(e) = self.documents.close_all(&mut correlator).await {
                tracing::debug!("Closing documents during shutdown failed: {e}");
            }
            let transport_failed = match correlator
                .send_request(protocol::SHUTDOWN, None, &mut ())
                .await
            {
                Ok(Value::Null) => false,
                Ok(other) => {
                    tracing::debug!(?other, "Unexpected shutdown result");
                    false
                }
                Err(e) => {
                    tracing::debug!("Shutdown request failed: {e}");
                    e.is_fatal()
                }
            };
            if transport_failed {
                tracing::debug!("Transport already failed; not sending exit");
            } else if let Err(e) = correlator.send_notification(protocol::EXIT, None).await {
                tracing::debug!("Exit notification failed: {e}");
            }
        }

        self.documents.reset();
        self.capabilities = None;
        self.supervisor.stop().await;
        self.set_state(SessionState::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_manager() -> LspManager {
        LspManager::idle(LspConfig::default(), String::from("file:///workspace"))
    }

    #[test]
    fn loss_restarts_only_when_meant_to_be_up() {
        assert_eq!(
            SessionState::Running.on_liveness_lost(),
            LossAction::Restart
        );
        assert_eq!(
            SessionState::Starting.on_liveness_lost(),
            LossAction::Restart
        );
        for state in [
            SessionState::Down,
            SessionState::ShuttingDown,
            SessionState::Stopped,
        ] {
            assert_eq!(state.on_liveness_lost(), LossAction::Ignore, "{state:?}");
        }
    }

    #[test]
    fn shutting_down_is_not_a_reported_status() {
        assert_eq!(SessionState::ShuttingDown.status(), None);
        assert_eq!(SessionState::Down.status(), Some(ServerState::Down));
    }

    #[test]
    fn status_emitted_once_per_transition() {
        let mut manager = test_manager();
        manager.set_state(SessionState::Down);
        manager.set_state(SessionState::Down);
        manager.set_state(SessionState::ShuttingDown);
        manager.set_state(SessionState::Stopped);
        assert_eq!(
            manager.take_events(),
            [
                LspEvent::Status(ServerState::Down),
                LspEvent::Status(ServerState::Stopped),
            ]
        );
        assert!(manager.take_events().is_empty());
    }

    #[tokio::test]
    async fn operations_without_server_fail_not_running() {
        let mut manager = test_manager();
        assert!(matches!(
            manager.open("file:///a.c", "", "c").await,
            Err(LspError::NotRunning)
        ));
        assert!(matches!(
            manager.change("file:///a.c", "x").await,
            Err(LspError::NotRunning)
        ));
        assert!(matches!(
            manager.completion("file:///a.c", 0, 0).await,
            Err(LspError::NotRunning)
        ));
        assert_eq!(manager.poll().await.unwrap(), 0);
        assert!(manager.diagnostics("file:///a.c").await.is_none());
        assert!(!manager.is_alive());
        assert!(manager.pid().is_none());
    }

    #[tokio::test]
    async fn stop_when_stopped_is_silent() {
        let mut manager = test_manager();
        manager.stop().await;
        assert_eq!(manager.state(), SessionState::Stopped);
        assert!(manager.take_events().is_empty());
    }

    #[tokio::test]
    async fn start_with_missing_server_fails() {
        let config = LspConfig {
            command: String::from("definitely-not-a-real-server-binary"),
            ..LspConfig::default()
        };
        let root = std::env::temp_dir();
        let err = LspManager::start(config, &root).await.err().unwrap();
        assert!(matches!(err, LspError::Spawn { .. }));
    }

    #[tokio::test]
    async fn relative_root_is_rejected() {
        let err = LspManager::start(LspConfig::default(), Path::new("relative"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, LspError::InvalidRoot(_)));
    }
}
