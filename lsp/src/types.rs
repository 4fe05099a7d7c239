//! Public types shared with the configuration layer and the CLI.
//!
//! The CLI builds an [`LspConfig`], receives [`LspEvent`]s and reads
//! [`Diagnostic`]s through a [`crate::DiagnosticsIndex`].

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_IO_TIMEOUT_MS: u64 = 5_000;

fn default_command() -> String {
    String::from("clangd")
}

fn default_language_id() -> String {
    String::from("cpp")
}

fn default_io_timeout_ms() -> u64 {
    DEFAULT_IO_TIMEOUT_MS
}

/// Configuration for the single language server this client drives.
#[derive(Debug, Clone, Deserialize)]
pub struct LspConfig {
    /// Executable to spawn, resolved through `PATH` (e.g. "clangd").
    #[serde(default = "default_command")]
    pub command: String,
    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Language id used when a document has to be opened implicitly.
    #[serde(default = "default_language_id")]
    pub language_id: String,
    /// File receiving the server's stderr. Discarded when unset.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(default = "default_io_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_io_timeout_ms")]
    pub write_timeout_ms: u64,
}

impl Default for LspConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: Vec::new(),
            language_id: default_language_id(),
            log_path: None,
            read_timeout_ms: DEFAULT_IO_TIMEOUT_MS,
            write_timeout_ms: DEFAULT_IO_TIMEOUT_MS,
        }
    }
}

impl LspConfig {
    #[must_use]
    pub fn timeouts(&self) -> IoTimeouts {
        IoTimeouts {
            read: Duration::from_millis(self.read_timeout_ms),
            write: Duration::from_millis(self.write_timeout_ms),
        }
    }
}

/// Per-operation bounds for framed I/O.
///
/// These bound a single frame read or write, not a whole RPC: a request
/// that has to skip over several notifications may take several read
/// timeouts to complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoTimeouts {
    pub read: Duration,
    pub write: Duration,
}

impl Default for IoTimeouts {
    fn default() -> Self {
        Self {
            read: Duration::from_millis(DEFAULT_IO_TIMEOUT_MS),
            write: Duration::from_millis(DEFAULT_IO_TIMEOUT_MS),
        }
    }
}

/// Severity of a diagnostic, ordered from least to most severe.
///
/// The wire uses 1 (error) .. 4 (hint); [`Self::from_lsp`] is the only
/// place that knows those numbers. No wire value maps to `Fatal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiagnosticSeverity {
    Ignored = 0,
    Note = 1,
    Warning = 2,
    Error = 3,
    Fatal = 4,
}

impl DiagnosticSeverity {
    /// Convert from LSP numeric severity (1=Error, 2=Warning, 3=Info, 4=Hint).
    ///
    /// Returns `None` for values outside the LSP-defined range.
    /// Callers (boundary code) decide the fallback policy.
    #[must_use]
    pub fn from_lsp(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Error),
            2 => Some(Self::Warning),
            3 => Some(Self::Note),
            4 => Some(Self::Ignored),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self >= Self::Error
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Ignored => "ignored",
            Self::Note => "note",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Fatal => "fatal",
        }
    }
}

/// A single diagnostic reported by the server.
///
/// Fields are private so a diagnostic cannot change after it was
/// received; a document's set is replaced, never patched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    severity: DiagnosticSeverity,
    message: String,
    /// 0-indexed line number, as on the wire.
    line: u32,
    /// 0-indexed column.
    column: u32,
    source: Option<String>,
}

impl Diagnostic {
    #[must_use]
    pub fn new(severity: DiagnosticSeverity, message: String, line: u32, column: u32) -> Self {
        Self {
            severity,
            message,
            line,
            column,
            source: None,
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    #[must_use]
    pub fn severity(&self) -> DiagnosticSeverity {
        self.severity
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 0-indexed line number.
    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }

    /// 1-indexed line number, the form consumers display and index by.
    #[must_use]
    pub fn display_line(&self) -> u32 {
        self.line + 1
    }

    /// 0-indexed column.
    #[must_use]
    pub fn column(&self) -> u32 {
        self.column
    }

    #[must_use]
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Format as `path:line:col: severity: message` (1-indexed for display).
    #[must_use]
    pub fn display_with_path(&self, path: &std::path::Path) -> String {
        format!(
            "{}:{}:{}: {}: {}",
            path.display(),
            self.display_line(),
            self.column + 1,
            self.severity.label(),
            self.message,
        )
    }
}

/// Lifecycle of the server session as seen by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Starting,
    Running,
    Down,
    Stopped,
}

impl ServerState {
    #[must_use]
    pub fn is_running(self) -> bool {
        self == Self::Running
    }

    /// Human-readable status line text.
    #[must_use]
    pub fn describe(self) -> &'static str {
        match self {
            Self::Starting => "language server starting",
            Self::Running => "language server running",
            Self::Down => "language server went down",
            Self::Stopped => "language server stopped",
        }
    }
}

/// An event emitted by the client core.
#[derive(Debug, Clone, PartialEq)]
pub enum LspEvent {
    /// Session state changed. Emitted once per transition.
    Status(ServerState),
    /// The server published diagnostics for a document.
    Diagnostics {
        uri: String,
        items: Vec<Diagnostic>,
    },
    /// The server sent a request this client does not answer.
    ServerRequest { method: String },
}
