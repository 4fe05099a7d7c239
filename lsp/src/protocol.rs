//! Internal LSP message serde types for JSON-RPC communication.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::completion::{CompletionItem, CompletionKind};
use crate::types::{Diagnostic, DiagnosticSeverity};

pub(crate) const INITIALIZE: &str = "initialize";
pub(crate) const INITIALIZED: &str = "initialized";
pub(crate) const SHUTDOWN: &str = "shutdown";
pub(crate) const EXIT: &str = "exit";
pub(crate) const DID_OPEN: &str = "textDocument/didOpen";
pub(crate) const DID_CHANGE: &str = "textDocument/didChange";
pub(crate) const DID_SAVE: &str = "textDocument/didSave";
pub(crate) const DID_CLOSE: &str = "textDocument/didClose";
pub(crate) const COMPLETION: &str = "textDocument/completion";
pub(crate) const PUBLISH_DIAGNOSTICS: &str = "textDocument/publishDiagnostics";

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub struct PathToUriError {
    path: PathBuf,
}

#[derive(Debug, Serialize)]
pub(crate) struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl<'a> Request<'a> {
    pub fn new(id: u64, method: &'a str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl<'a> Notification<'a> {
    pub fn new(method: &'a str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

/// The `error` member of a response.
#[derive(Debug, Deserialize)]
pub(crate) struct ResponseError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// A received frame, classified by how it must be routed.
#[derive(Debug)]
pub(crate) enum Incoming {
    /// Carries the id of a request we are waiting on.
    Response {
        id: u64,
        result: serde_json::Value,
        error: Option<ResponseError>,
    },
    /// Carries an id we never issued; the server is asking us something.
    ServerRequest {
        method: Option<String>,
        params: Option<serde_json::Value>,
    },
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
}

/// Classify `frame`. `is_pending` decides whether an id belongs to us.
///
/// Returns `None` for frames that are neither (no id and no method).
pub(crate) fn classify(
    mut frame: serde_json::Value,
    is_pending: impl Fn(u64) -> bool,
) -> Option<Incoming> {
    let obj = frame.as_object_mut()?;
    let method = obj
        .get("method")
        .and_then(serde_json::Value::as_str)
        .map(String::from);
    let params = obj.remove("params");
    let id = obj.remove("id");

    match id {
        Some(id) if id.as_u64().is_some_and(&is_pending) => {
            let id = id.as_u64()?;
            let error = obj.remove("error").map(|e| {
                serde_json::from_value(e).unwrap_or(ResponseError {
                    code: 0,
                    message: String::from("malformed error object"),
                })
            });
            let result = obj.remove("result").unwrap_or(serde_json::Value::Null);
            Some(Incoming::Response { id, result, error })
        }
        Some(_) => Some(Incoming::ServerRequest { method, params }),
        None => method.map(|method| Incoming::Notification { method, params }),
    }
}

pub(crate) fn initialize_params(root_uri: &str) -> serde_json::Value {
    serde_json::json!({
        "processId": std::process::id(),
        "rootUri": root_uri,
        "capabilities": {
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": false,
                    "willSave": false,
                    "willSaveWaitUntil": false,
                    "didSave": true
                },
                "completion": {
                    "completionItem": {
                        "snippetSupport": false
                    }
                },
                "publishDiagnostics": {
                    "relatedInformation": false
                }
            }
        },
        "trace": "off"
    })
}

pub(crate) fn did_open_params(
    uri: &str,
    language_id: &str,
    version: i32,
    text: &str,
) -> serde_json::Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

/// Whole-document sync: a single content change without a range.
pub(crate) fn did_change_params(uri: &str, version: i32, text: &str) -> serde_json::Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri,
            "version": version
        },
        "contentChanges": [{
            "text": text
        }]
    })
}

pub(crate) fn text_document_params(uri: &str) -> serde_json::Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri
        }
    })
}

pub(crate) fn completion_params(uri: &str, line: u32, character: u32) -> serde_json::Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri
        },
        "position": {
            "line": line,
            "character": character
        }
    })
}

#[derive(Debug, Deserialize)]
pub(crate) struct PublishDiagnosticsParams {
    pub uri: String,
    pub diagnostics: Vec<LspDiagnostic>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LspDiagnostic {
    pub range: LspRange,
    pub severity: Option<u64>,
    pub source: Option<String>,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LspRange {
    pub start: LspPosition,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LspPosition {
    pub line: u32,
    pub character: u32,
}

impl LspDiagnostic {
    pub fn to_diagnostic(&self) -> Diagnostic {
        let diag = Diagnostic::new(
            self.severity
                .and_then(DiagnosticSeverity::from_lsp)
                .unwrap_or(DiagnosticSeverity::Warning),
            self.message.clone(),
            self.range.start.line,
            self.range.start.character,
        );
        match &self.source {
            Some(source) => diag.with_source(source.clone()),
            None => diag,
        }
    }
}

impl PublishDiagnosticsParams {
    pub fn into_parts(self) -> (String, Vec<Diagnostic>) {
        let items = self
            .diagnostics
            .iter()
            .map(LspDiagnostic::to_diagnostic)
            .collect();
        (self.uri, items)
    }
}

/// Parse `publishDiagnostics` params into the URI and normalized records.
pub(crate) fn parse_publish_diagnostics(
    params: Option<&serde_json::Value>,
) -> Option<(String, Vec<Diagnostic>)> {
    let params = params?;
    match PublishDiagnosticsParams::deserialize(params) {
        Ok(parsed) => Some(parsed.into_parts()),
        Err(e) => {
            tracing::debug!("Failed to parse publishDiagnostics: {e}");
            None
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CompletionResponse {
    List(Vec<WireCompletionItem>),
    Complete { items: Vec<WireCompletionItem> },
}

#[derive(Debug, Deserialize)]
struct WireCompletionItem {
    label: String,
    kind: Option<u64>,
    documentation: Option<Documentation>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Documentation {
    Plain(String),
    Markup { value: String },
}

/// Parse a completion result: an item array, a `CompletionList`, or null.
pub(crate) fn parse_completion_result(
    result: serde_json::Value,
) -> Result<Vec<CompletionItem>, serde_json::Error> {
    if result.is_null() {
        return Ok(Vec::new());
    }
    let items = match serde_json::from_value(result)? {
        CompletionResponse::List(items) | CompletionResponse::Complete { items } => items,
    };
    Ok(items
        .into_iter()
        .map(|item| CompletionItem {
            label: item.label,
            kind: item.kind.and_then(CompletionKind::from_lsp),
            documentation: item.documentation.map(|doc| match doc {
                Documentation::Plain(text) | Documentation::Markup { value: text } => text,
            }),
        })
        .collect())
}

pub fn path_to_file_uri(path: &Path) -> Result<url::Url, PathToUriError> {
    url::Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}
