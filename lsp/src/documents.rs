//! Per-document synchronization state.
//!
//! A document goes `Closed -> Open(v=1) -> Open(v=n) -> Closed`. The map
//! only changes once the matching notification was written, except for
//! close, which forgets the document first so a failed send cannot bring
//! it back.

use std::collections::HashMap;
use std::future::Future;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::correlator::{Correlator, MessageObserver};
use crate::diagnostics::DiagnosticsIndex;
use crate::error::LspError;
use crate::protocol;
use crate::types::Diagnostic;

/// Where document notifications are written.
pub trait NotificationSink {
    fn notify(
        &mut self,
        method: &'static str,
        params: Value,
    ) -> impl Future<Output = Result<(), LspError>> + Send;
}

impl<R, W> NotificationSink for Correlator<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    fn notify(
        &mut self,
        method: &'static str,
        params: Value,
    ) -> impl Future<Output = Result<(), LspError>> + Send {
        self.send_notification(method, Some(params))
    }
}

/// What is known about one open document. Its text is not kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    version: i32,
    language_id: String,
    diagnostics: Vec<Diagnostic>,
}

impl Document {
    fn opened(language_id: &str) -> Self {
        Self {
            version: 1,
            language_id: language_id.to_string(),
            diagnostics: Vec::new(),
        }
    }

    #[must_use]
    pub fn version(&self) -> i32 {
        self.version
    }

    #[must_use]
    pub fn language_id(&self) -> &str {
        &self.language_id
    }

    #[must_use]
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }
}

/// Every document currently open on the server, keyed by URI.
#[derive(Debug, Clone, Default)]
pub struct DocumentSessions {
    documents: HashMap<String, Document>,
    default_language_id: String,
}

impl DocumentSessions {
    /// `default_language_id` is used when a change arrives for a document
    /// that was never opened.
    #[must_use]
    pub fn new(default_language_id: impl Into<String>) -> Self {
        Self {
            documents: HashMap::new(),
            default_language_id: default_language_id.into(),
        }
    }

    /// Send `didOpen` at version 1. Opening an open document does nothing.
    pub async fn open(
        &mut self,
        sink: &mut impl NotificationSink,
        uri: &str,
        text: &str,
        language_id: &str,
    ) -> Result<(), LspError> {
        if self.documents.contains_key(uri) {
            tracing::debug!(uri, "Document already open");
            return Ok(());
        }
        sink.notify(
            protocol::DID_OPEN,
            protocol::did_open_params(uri, language_id, 1, text),
        )
        .await?;
        self.documents
            .insert(uri.to_string(), Document::opened(language_id));
        tracing::debug!(uri, language_id, "Opened document");
        Ok(())
    }

    /// Send the full new text as `didChange` with the next version.
    ///
    /// A change for a document that is not open opens it instead.
    pub async fn change(
        &mut self,
        sink: &mut impl NotificationSink,
        uri: &str,
        text: &str,
    ) -> Result<(), LspError> {
        let Some(doc) = self.documents.get(uri) else {
            tracing::warn!(uri, "Change for a document that is not open; opening it");
            let language_id = self.default_language_id.clone();
            return self.open(sink, uri, text, &language_id).await;
        };
        let version = doc.version + 1;
        sink.notify(
            protocol::DID_CHANGE,
            protocol::did_change_params(uri, version, text),
        )
        .await?;
        if let Some(doc) = self.documents.get_mut(uri) {
            doc.version = version;
        }
        tracing::trace!(uri, version, "Sent change");
        Ok(())
    }

    pub async fn save(
        &mut self,
        sink: &mut impl NotificationSink,
        uri: &str,
    ) -> Result<(), LspError> {
        if !self.documents.contains_key(uri) {
            tracing::debug!(uri, "Saving a document that is not open");
        }
        sink.notify(protocol::DID_SAVE, protocol::text_document_params(uri))
            .await
    }

    /// Forget the document and send `didClose`. Closing a document that
    /// is not open does nothing.
    pub async fn close(
        &mut self,
        sink: &mut impl NotificationSink,
        uri: &str,
    ) -> Result<(), LspError> {
        if self.documents.remove(uri).is_none() {
            return Ok(());
        }
        tracing::debug!(uri, "Closing document");
        sink.notify(protocol::DID_CLOSE, protocol::text_document_params(uri))
            .await
    }

    /// Close every open document in URI order.
    ///
    /// After the first failed send the rest are forgotten without I/O.
    pub async fn close_all(&mut self, sink: &mut impl NotificationSink) -> Result<(), LspError> {
        let mut uris: Vec<String> = self.documents.drain().map(|(uri, _)| uri).collect();
        uris.sort();
        for (i, uri) in uris.iter().enumerate() {
            if let Err(e) = sink
                .notify(protocol::DID_CLOSE, protocol::text_document_params(uri))
                .await
            {
                tracing::warn!(
                    uri = %uri,
                    discarded = uris.len() - i - 1,
                    "Close failed; dropping remaining documents: {e}"
                );
                return Err(e);
            }
        }
        Ok(())
    }

    /// Replace the diagnostics of an open document.
    ///
    /// Returns `false` (and drops them) when the document is not open.
    pub fn on_diagnostics_pushed(&mut self, uri: &str, diagnostics: Vec<Diagnostic>) -> bool {
        let Some(doc) = self.documents.get_mut(uri) else {
            tracing::debug!(uri, "Diagnostics for a document that is not open");
            return false;
        };
        tracing::debug!(uri, count = diagnostics.len(), "Diagnostics updated");
        doc.diagnostics = diagnostics;
        true
    }

    /// Forget everything. The server that knew these documents is gone.
    pub fn reset(&mut self) {
        if !self.documents.is_empty() {
            tracing::info!(count = self.documents.len(), "Dropping document state");
        }
        self.documents.clear();
    }

    #[must_use]
    pub fn index(&self, uri: &str) -> Option<DiagnosticsIndex> {
        self.documents
            .get(uri)
            .map(|doc| DiagnosticsIndex::index_by_line(&doc.diagnostics))
    }

    #[must_use]
    pub fn get(&self, uri: &str) -> Option<&Document> {
        self.documents.get(uri)
    }

    #[must_use]
    pub fn is_open(&self, uri: &str) -> bool {
        self.documents.contains_key(uri)
    }

    #[must_use]
    pub fn version(&self, uri: &str) -> Option<i32> {
        self.documents.get(uri).map(Document::version)
    }

    #[must_use]
    pub fn diagnostics(&self, uri: &str) -> Option<&[Diagnostic]> {
        self.documents.get(uri).map(Document::diagnostics)
    }

    /// Open URIs, sorted.
    #[must_use]
    pub fn uris(&self) -> Vec<&str> {
        let mut uris: Vec<&str> = self.documents.keys().map(String::as_str).collect();
        uris.sort_unstable();
        uris
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

impl MessageObserver for DocumentSessions {
    fn on_notification(&mut self, method: &str, params: Option<&Value>) {
        if method != protocol::PUBLISH_DIAGNOSTICS {
            return;
        }
        if let Some((uri, items)) = protocol::parse_publish_diagnostics(params) {
            self.on_diagnostics_pushed(&uri, items);
        }
    }
}
