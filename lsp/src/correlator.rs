//! JSON-RPC request/response correlation over a framed transport.
//!
//! A [`Correlator`] is driven by one task. While it waits for the response
//! to a request, every other frame it reads is dispatched in arrival order
//! to a [`MessageObserver`]; nothing is buffered for later.

use std::collections::HashMap;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::codec::{FrameReader, FrameWriter};
use crate::error::LspError;
use crate::protocol::{self, Incoming, Notification, Request};
use crate::supervisor::LivenessHandle;
use crate::types::{IoTimeouts, LspEvent};

/// Receives everything the server sends that is not the response a caller
/// is currently waiting for.
pub trait MessageObserver {
    fn on_notification(&mut self, method: &str, params: Option<&Value>);

    /// A request from the server. It is never answered.
    fn on_request(&mut self, method: Option<&str>, params: Option<&Value>) {
        let _ = params;
        tracing::debug!(method = method.unwrap_or("<none>"), "Ignoring server request");
    }

    /// A pending request completed; `error` is set for error responses.
    fn on_response(&mut self, request: &PendingRequest, error: Option<&LspError>) {
        let _ = (request, error);
    }

    /// The transport failed fatally and every pending request was dropped.
    fn on_server_down(&mut self, error: &LspError) {
        let _ = error;
    }
}

impl MessageObserver for () {
    fn on_notification(&mut self, method: &str, _params: Option<&Value>) {
        tracing::trace!(method, "Dropping notification");
    }
}

impl<T: MessageObserver + ?Sized> MessageObserver for &mut T {
    fn on_notification(&mut self, method: &str, params: Option<&Value>) {
        (**self).on_notification(method, params);
    }

    fn on_request(&mut self, method: Option<&str>, params: Option<&Value>) {
        (**self).on_request(method, params);
    }

    fn on_response(&mut self, request: &PendingRequest, error: Option<&LspError>) {
        (**self).on_response(request, error);
    }

    fn on_server_down(&mut self, error: &LspError) {
        (**self).on_server_down(error);
    }
}

/// Fan-out: both observers see every message, first one first.
impl<A: MessageObserver, B: MessageObserver> MessageObserver for (A, B) {
    fn on_notification(&mut self, method: &str, params: Option<&Value>) {
        self.0.on_notification(method, params);
        self.1.on_notification(method, params);
    }

    fn on_request(&mut self, method: Option<&str>, params: Option<&Value>) {
        self.0.on_request(method, params);
        self.1.on_request(method, params);
    }

    fn on_response(&mut self, request: &PendingRequest, error: Option<&LspError>) {
        self.0.on_response(request, error);
        self.1.on_response(request, error);
    }

    fn on_server_down(&mut self, error: &LspError) {
        self.0.on_server_down(error);
        self.1.on_server_down(error);
    }
}

/// Turns published diagnostics and server requests into [`LspEvent`]s.
///
/// Diagnostics are forwarded for every URI the server mentions; whether a
/// document is open is tracked by [`crate::DocumentSessions`].
#[derive(Debug, Clone)]
pub struct EventForwarder {
    events: mpsc::UnboundedSender<LspEvent>,
}

impl EventForwarder {
    #[must_use]
    pub fn new(events: mpsc::UnboundedSender<LspEvent>) -> Self {
        Self { events }
    }

    fn emit(&self, event: LspEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("Event receiver gone; dropping event");
        }
    }
}

impl MessageObserver for EventForwarder {
    fn on_notification(&mut self, method: &str, params: Option<&Value>) {
        if method != protocol::PUBLISH_DIAGNOSTICS {
            tracing::trace!(method, "Ignoring notification");
            return;
        }
        if let Some((uri, items)) = protocol::parse_publish_diagnostics(params) {
            self.emit(LspEvent::Diagnostics { uri, items });
        }
    }

    fn on_request(&mut self, method: Option<&str>, _params: Option<&Value>) {
        let method = method.unwrap_or("<none>").to_string();
        tracing::debug!(%method, "Server sent a request; not answering");
        self.emit(LspEvent::ServerRequest { method });
    }
}

/// A request that was written and has not been answered yet.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub id: u64,
    pub method: String,
    pub params: Option<Value>,
    pub created: Instant,
}

fn envelope(msg: &impl Serialize) -> Result<Value, LspError> {
    // Going through `Value` emits object keys in sorted order.
    serde_json::to_value(msg).map_err(|e| LspError::protocol(format!("serializing envelope: {e}")))
}

/// Matches responses to requests on one reader/writer pair.
pub struct Correlator<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    next_id: u64,
    pending: HashMap<u64, PendingRequest>,
    timeouts: IoTimeouts,
    liveness: LivenessHandle,
    /// Set once a fatal transport error was seen; no more I/O after that.
    broken: bool,
}

impl<R, W> Correlator<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, timeouts: IoTimeouts, liveness: LivenessHandle) -> Self {
        Self {
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
            next_id: 0,
            pending: HashMap::new(),
            timeouts,
            liveness,
            broken: false,
        }
    }

    #[must_use]
    pub fn pid(&self) -> u32 {
        self.liveness.pid()
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.broken && self.liveness.is_alive()
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Send a request and wait for its response, dispatching everything
    /// else that arrives in the meantime to `observer`.
    ///
    /// An error response fails only this call. Transport failures are
    /// reported through the liveness handle and drop all pending requests.
    pub async fn send_request(
        &mut self,
        method: &str,
        params: Option<Value>,
        observer: &mut impl MessageObserver,
    ) -> Result<Value, LspError> {
        if !self.is_alive() {
            return Err(self.server_down(observer));
        }

        let id = self.next_id;
        self.next_id += 1;
        let frame = envelope(&Request::new(id, method, params.clone()))?;
        self.pending.insert(
            id,
            PendingRequest {
                id,
                method: method.to_string(),
                params,
                created: Instant::now(),
            },
        );

        if let Err(e) = self.writer.write_frame(&frame, self.timeouts.write).await {
            let e = self.fail(e);
            observer.on_server_down(&e);
            return Err(e);
        }
        tracing::debug!(id, method, "Sent request");

        loop {
            let frame = match self.receive().await {
                Ok(frame) => frame,
                Err(e) => {
                    let e = self.fail(e);
                    observer.on_server_down(&e);
                    return Err(e);
                }
            };
            if let Some(outcome) = self.dispatch(frame, Some(id), observer) {
                return outcome;
            }
        }
    }

    /// Send a notification. No response is expected.
    pub async fn send_notification(
        &mut self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), LspError> {
        if !self.is_alive() {
            self.discard_pending();
            return Err(LspError::ServerDown);
        }
        let frame = envelope(&Notification::new(method, params))?;
        if let Err(e) = self.writer.write_frame(&frame, self.timeouts.write).await {
            return Err(self.fail(e));
        }
        tracing::trace!(method, "Sent notification");
        Ok(())
    }

    /// Dispatch every frame that can be read without waiting.
    ///
    /// Returns how many frames were handled.
    pub fn pump_incoming(&mut self, observer: &mut impl MessageObserver) -> Result<usize, LspError> {
        let mut handled = 0;
        loop {
            match self.reader.try_read_now() {
                Ok(Some(frame)) => {
                    let _ = self.dispatch(frame, None, observer);
                    handled += 1;
                }
                Ok(None) => return Ok(handled),
                Err(e) => {
                    let e = self.fail(e);
                    observer.on_server_down(&e);
                    return Err(e);
                }
            }
        }
    }

    /// Drop every pending request. Their callers will never see a result.
    pub fn discard_pending(&mut self) {
        for (id, request) in self.pending.drain() {
            tracing::debug!(
                id,
                method = %request.method,
                age_ms = request.created.elapsed().as_millis(),
                "Request cancelled"
            );
        }
    }

    /// Wait for the next frame, or for the process to be observed down.
    async fn receive(&mut self) -> Result<Value, LspError> {
        let read_timeout = self.timeouts.read;
        tokio::select! {
            biased;
            frame = self.reader.read_frame(read_timeout) => frame,
            () = self.liveness.down() => Err(LspError::ServerDown),
        }
    }

    /// Route one frame. Returns the outcome when it answers `awaiting`.
    fn dispatch(
        &mut self,
        frame: Value,
        awaiting: Option<u64>,
        observer: &mut impl MessageObserver,
    ) -> Option<Result<Value, LspError>> {
        let pending = &self.pending;
        let Some(incoming) = protocol::classify(frame, |id| pending.contains_key(&id)) else {
            tracing::debug!("Dropping frame that is neither response nor message");
            return None;
        };

        match incoming {
            Incoming::Response { id, result, error } => {
                let request = self.pending.remove(&id)?;
                let outcome = match error {
                    Some(err) => Err(LspError::Server {
                        code: err.code,
                        message: err.message,
                    }),
                    None => Ok(result),
                };
                tracing::debug!(
                    id,
                    method = %request.method,
                    ok = outcome.is_ok(),
                    elapsed_ms = request.created.elapsed().as_millis(),
                    "Received response"
                );
                observer.on_response(&request, outcome.as_ref().err());
                if awaiting == Some(id) {
                    return Some(outcome);
                }
                tracing::debug!(id, "Response arrived for a request nobody awaits");
                None
            }
            Incoming::ServerRequest { method, params } => {
                observer.on_request(method.as_deref(), params.as_ref());
                None
            }
            Incoming::Notification { method, params } => {
                observer.on_notification(&method, params.as_ref());
                None
            }
        }
    }

    /// Escalate a fatal transport error: report it and drop pending work.
    fn fail(&mut self, error: LspError) -> LspError {
        if error.is_fatal() {
            self.broken = true;
            // A down flag was raised by whoever saw the process go; only
            // failures seen here need reporting.
            if !matches!(error, LspError::ServerDown) {
                tracing::warn!(pid = self.liveness.pid(), "Transport failed: {error}");
                self.liveness.report_transport_failure(error.to_string());
            }
            self.discard_pending();
        }
        error
    }

    fn server_down(&mut self, observer: &mut impl MessageObserver) -> LspError {
        let error = self.fail(LspError::ServerDown);
        observer.on_server_down(&error);
        error
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::io::{AsyncReadExt, DuplexStream, ReadHalf, WriteHalf};
    use tokio::sync::watch;

    use super::*;
    use crate::supervisor::LivenessEvent;

    const T: Duration = Duration::from_secs(2);

    type TestCorrelator = Correlator<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    struct FakeServer {
        reader: FrameReader<ReadHalf<DuplexStream>>,
        writer: FrameWriter<WriteHalf<DuplexStream>>,
    }

    impl FakeServer {
        async fn recv(&mut self) -> Value {
            self.reader.read_frame(T).await.unwrap()
        }

        async fn send(&mut self, msg: Value) {
            self.writer.write_frame(&msg, T).await.unwrap();
        }
    }

    struct Harness {
        correlator: TestCorrelator,
        server: FakeServer,
        alive: watch::Sender<bool>,
        reports: mpsc::UnboundedReceiver<LivenessEvent>,
    }

    fn harness_with(timeouts: IoTimeouts) -> Harness {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (cr, cw) = tokio::io::split(client);
        let (sr, sw) = tokio::io::split(server);
        let (liveness, alive, reports) = LivenessHandle::detached(4242);
        Harness {
            correlator: Correlator::new(cr, cw, timeouts, liveness),
            server: FakeServer {
                reader: FrameReader::new(sr),
                writer: FrameWriter::new(sw),
            },
            alive,
            reports,
        }
    }

    fn harness() -> Harness {
        harness_with(IoTimeouts::default())
    }

    #[derive(Default)]
    struct Recorder {
        notifications: Vec<String>,
        requests: Vec<Option<String>>,
        responses: Vec<(u64, bool)>,
        downs: usize,
    }

    impl MessageObserver for Recorder {
        fn on_notification(&mut self, method: &str, _params: Option<&Value>) {
            self.notifications.push(method.to_string());
        }

        fn on_request(&mut self, method: Option<&str>, _params: Option<&Value>) {
            self.requests.push(method.map(String::from));
        }

        fn on_response(&mut self, request: &PendingRequest, error: Option<&LspError>) {
            self.responses.push((request.id, error.is_none()));
        }

        fn on_server_down(&mut self, _error: &LspError) {
            self.downs += 1;
        }
    }

    fn notification(method: &str) -> Value {
        json!({"jsonrpc": "2.0", "method": method, "params": {}})
    }

    #[tokio::test]
    async fn ids_start_at_zero_and_increase() {
        let Harness {
            mut correlator,
            mut server,
            alive: _alive,
            ..
        } = harness();
        let task = tokio::spawn(async move {
            for expected in 0..2u64 {
                let req = server.recv().await;
                assert_eq!(req["id"], expected);
                server
                    .send(json!({"jsonrpc": "2.0", "id": expected, "result": expected * 10}))
                    .await;
            }
        });

        let mut rec = Recorder::default();
        let first = correlator.send_request("a", None, &mut rec).await.unwrap();
        let second = correlator.send_request("b", None, &mut rec).await.unwrap();
        assert_eq!(first, json!(0));
        assert_eq!(second, json!(10));
        assert_eq!(rec.responses, [(0, true), (1, true)]);
        assert_eq!(correlator.pending_len(), 0);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn interleaved_messages_are_dispatched_in_order() {
        let Harness {
            mut correlator,
            mut server,
            alive: _alive,
            ..
        } = harness();
        let task = tokio::spawn(async move {
            let req = server.recv().await;
            server.send(notification("first")).await;
            server
                .send(json!({"jsonrpc": "2.0", "id": 77, "method": "workspace/configuration"}))
                .await;
            server.send(notification("second")).await;
            server
                .send(json!({"jsonrpc": "2.0", "id": req["id"], "result": {"done": true}}))
                .await;
            // The server request above must not have been answered.
            let next = server.recv().await;
            assert_eq!(next["method"], "ping");
        });

        let mut rec = Recorder::default();
        let result = correlator
            .send_request("textDocument/completion", Some(json!({})), &mut rec)
            .await
            .unwrap();
        assert_eq!(result["done"], true);
        assert_eq!(rec.notifications, ["first", "second"]);
        assert_eq!(rec.requests, [Some("workspace/configuration".to_string())]);

        correlator.send_notification("ping", None).await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn error_response_fails_only_its_caller() {
        let Harness {
            mut correlator,
            mut server,
            alive: _alive,
            mut reports,
        } = harness();
        let task = tokio::spawn(async move {
            let req = server.recv().await;
            server
                .send(json!({
                    "jsonrpc": "2.0",
                    "id": req["id"],
                    "error": {"code": -32601, "message": "no such method"}
                }))
                .await;
            let req = server.recv().await;
            server
                .send(json!({"jsonrpc": "2.0", "id": req["id"], "result": null}))
                .await;
        });

        let mut rec = Recorder::default();
        let err = correlator
            .send_request("bogus", None, &mut rec)
            .await
            .unwrap_err();
        assert!(matches!(err, LspError::Server { code: -32601, .. }));
        assert!(!err.is_fatal());

        let ok = correlator.send_request("fine", None, &mut rec).await.unwrap();
        assert!(ok.is_null());
        assert_eq!(rec.responses, [(0, false), (1, true)]);
        assert_eq!(rec.downs, 0);
        assert!(reports.try_recv().is_err());
        task.await.unwrap();
    }

    #[tokio::test]
    async fn process_down_while_pending_resolves_server_down() {
        let Harness {
            mut correlator,
            mut server,
            alive,
            mut reports,
        } = harness();
        let task = tokio::spawn(async move {
            let req = server.recv().await;
            assert_eq!(req["method"], "textDocument/completion");
            alive.send_replace(false);
            // Keep the pipe open so only the liveness flag can end the wait.
            tokio::time::sleep(Duration::from_secs(3)).await;
            drop(server);
        });

        let mut rec = Recorder::default();
        let err = tokio::time::timeout(
            T,
            correlator.send_request("textDocument/completion", None, &mut rec),
        )
        .await
        .expect("must not hang")
        .unwrap_err();
        assert!(matches!(err, LspError::ServerDown));
        assert_eq!(correlator.pending_len(), 0);
        assert_eq!(rec.downs, 1);
        // The party that lowered the flag already knows.
        assert!(reports.try_recv().is_err());

        let err = correlator.send_notification("x", None).await.unwrap_err();
        assert!(matches!(err, LspError::ServerDown));
        task.abort();
    }

    #[tokio::test]
    async fn disconnect_is_reported_as_transport_failure() {
        let Harness {
            mut correlator,
            mut server,
            alive: _alive,
            mut reports,
        } = harness();
        let task = tokio::spawn(async move {
            let _ = server.recv().await;
            drop(server);
        });

        let mut rec = Recorder::default();
        let err = correlator
            .send_request("initialize", None, &mut rec)
            .await
            .unwrap_err();
        assert!(matches!(err, LspError::Disconnected));
        assert_eq!(correlator.pending_len(), 0);
        match reports.try_recv().unwrap() {
            LivenessEvent::TransportFailed { pid, .. } => assert_eq!(pid, 4242),
            other => panic!("expected transport failure, got {other:?}"),
        }
        task.await.unwrap();
    }

    #[tokio::test]
    async fn read_timeout_is_fatal() {
        let Harness {
            mut correlator,
            mut server,
            alive: _alive,
            mut reports,
        } = harness_with(IoTimeouts {
            read: Duration::from_millis(50),
            write: T,
        });

        let mut rec = Recorder::default();
        let err = correlator
            .send_request("slow", None, &mut rec)
            .await
            .unwrap_err();
        assert!(matches!(err, LspError::Timeout { .. }));
        assert!(matches!(
            reports.try_recv(),
            Ok(LivenessEvent::TransportFailed { .. })
        ));

        // The transport is known dead: later sends fail without writing.
        assert!(!correlator.is_alive());
        let err = correlator.send_notification("exit", None).await.unwrap_err();
        assert!(matches!(err, LspError::ServerDown));
        assert!(reports.try_recv().is_err());
        drop(correlator);

        assert_eq!(server.recv().await["method"], "slow");
        assert!(matches!(
            server.reader.read_frame(T).await,
            Err(LspError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn dropped_liveness_sender_means_down() {
        let Harness {
            mut correlator,
            alive,
            ..
        } = harness();
        assert!(correlator.is_alive());

        drop(alive);
        assert!(!correlator.is_alive());
        let err = correlator.send_notification("x", None).await.unwrap_err();
        assert!(matches!(err, LspError::ServerDown));
    }

    #[tokio::test]
    async fn sending_while_down_does_no_io() {
        let Harness {
            mut correlator,
            mut server,
            alive,
            ..
        } = harness();
        alive.send_replace(false);

        let mut rec = Recorder::default();
        let err = correlator
            .send_request("x", None, &mut rec)
            .await
            .unwrap_err();
        assert!(matches!(err, LspError::ServerDown));
        assert_eq!(rec.downs, 1);
        drop(correlator);

        assert!(matches!(
            server.reader.read_frame(T).await,
            Err(LspError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn pump_dispatches_buffered_frames_only() {
        let Harness {
            mut correlator,
            mut server,
            alive: _alive,
            ..
        } = harness();
        server.send(notification("a")).await;
        server.send(notification("b")).await;

        let mut first = Recorder::default();
        let mut second = Recorder::default();
        let handled = correlator
            .pump_incoming(&mut (&mut first, &mut second))
            .unwrap();
        assert_eq!(handled, 2);
        assert_eq!(first.notifications, ["a", "b"]);
        assert_eq!(second.notifications, ["a", "b"]);

        assert_eq!(correlator.pump_incoming(&mut ()).unwrap(), 0);
    }

    #[tokio::test]
    async fn envelopes_have_sorted_keys() {
        let (client, server) = tokio::io::duplex(4096);
        let (cr, cw) = tokio::io::split(client);
        let (liveness, _alive, _reports) = LivenessHandle::detached(1);
        let mut correlator = Correlator::new(cr, cw, IoTimeouts::default(), liveness);

        correlator.send_notification("exit", None).await.unwrap();
        drop(correlator);

        let mut raw = Vec::new();
        let mut server = server;
        server.read_to_end(&mut raw).await.unwrap();
        assert_eq!(
            raw,
            b"Content-Length: 33\r\n\r\n{\"jsonrpc\":\"2.0\",\"method\":\"exit\"}"
        );
    }

    #[tokio::test]
    async fn forwarder_emits_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut forwarder = EventForwarder::new(tx);
        let params = json!({
            "uri": "file:///a.c",
            "diagnostics": [{
                "range": {"start": {"line": 0, "character": 1}, "end": {"line": 0, "character": 2}},
                "severity": 1,
                "message": "boom"
            }]
        });
        forwarder.on_notification(protocol::PUBLISH_DIAGNOSTICS, Some(&params));
        forwarder.on_notification("window/logMessage", None);
        forwarder.on_request(Some("client/registerCapability"), None);

        match rx.try_recv().unwrap() {
            LspEvent::Diagnostics { uri, items } => {
                assert_eq!(uri, "file:///a.c");
                assert_eq!(items.len(), 1);
            }
            other => panic!("expected diagnostics, got {other:?}"),
        }
        assert!(matches!(
            rx.try_recv().unwrap(),
            LspEvent::ServerRequest { method } if method == "client/registerCapability"
        ));
        assert!(rx.try_recv().is_err());
    }
}
