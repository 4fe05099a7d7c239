//! Language server client core.
//!
//! Layers, leaf first: [`codec`] frames bytes, [`correlator`] matches
//! JSON-RPC responses to requests, [`supervisor`] owns the server process,
//! [`documents`] mirrors open buffers, [`diagnostics`] indexes what the
//! server reported. [`LspManager`] ties them together.

pub mod codec;
pub mod completion;
pub mod correlator;
pub mod diagnostics;
pub mod documents;
pub mod error;
pub mod supervisor;
pub mod types;

pub(crate) mod protocol;

mod manager;

pub use completion::{CompletionItem, CompletionKind, rank_candidates, word_start};
pub use correlator::{Correlator, EventForwarder, MessageObserver, PendingRequest};
pub use diagnostics::DiagnosticsIndex;
pub use documents::{DocumentSessions, NotificationSink};
pub use error::{IoOp, LspError};
pub use manager::{LspManager, SessionState};
pub use protocol::{PathToUriError, path_to_file_uri};
pub use supervisor::{LivenessEvent, LivenessHandle, ProcessHandle, ProcessSupervisor};
pub use types::{Diagnostic, DiagnosticSeverity, IoTimeouts, LspConfig, LspEvent, ServerState};
