//! Error taxonomy for the client core.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Which framed I/O operation ran out of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    ReadFrame,
    WriteFrame,
}

impl fmt::Display for IoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFrame => f.write_str("frame read"),
            Self::WriteFrame => f.write_str("frame write"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LspError {
    #[error("{op} timed out after {}ms", after.as_millis())]
    Timeout { op: IoOp, after: Duration },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("language server closed its output stream")]
    Disconnected,

    #[error("pipe I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("language server is down")]
    ServerDown,

    #[error("server returned error {code}: {message}")]
    Server { code: i64, message: String },

    #[error("failed to start {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("language server is not running")]
    NotRunning,

    #[error("workspace root {} cannot be expressed as a file URI", .0.display())]
    InvalidRoot(PathBuf),
}

impl LspError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Whether the session can no longer be trusted after this error.
    ///
    /// Fatal errors are escalated as liveness events; the rest only
    /// concern the caller that saw them.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::Protocol(_)
                | Self::Disconnected
                | Self::Io(_)
                | Self::ServerDown
        )
    }

    /// First line of the message, cut to `width` characters.
    ///
    /// This is what a status line shows next to the point of use.
    #[must_use]
    pub fn summary(&self, width: usize) -> String {
        single_line(&self.to_string(), width)
    }
}

/// Collapse `text` to its first line and truncate to `width` characters,
/// ending with `...` when something was cut.
#[must_use]
pub fn single_line(text: &str, width: usize) -> String {
    let first = text.lines().next().unwrap_or_default().trim_end();
    let cut = first.lines().count() < text.lines().count();
    if first.chars().count() <= width && !cut {
        return first.to_string();
    }
    if width <= 3 {
        return first.chars().take(width).collect();
    }
    let mut out: String = first.chars().take(width - 3).collect();
    out.push_str("...");
    out
}
