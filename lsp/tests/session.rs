//! End-to-end sessions against real processes.
//!
//! `cat` stands in for a language server: every request it echoes back
//! carries a pending id, so it reads as a response with a null result.

#![cfg(unix)]

use std::path::PathBuf;
use std::time::Duration;

use quill_lsp::{LspConfig, LspError, LspEvent, LspManager, ServerState, SessionState};

const A: &str = "file:///a.c";

fn echo_config() -> LspConfig {
    LspConfig {
        command: String::from("cat"),
        language_id: String::from("c"),
        ..LspConfig::default()
    }
}

fn root() -> PathBuf {
    std::env::temp_dir()
}

fn signal(pid: u32, sig: libc::c_int) {
    let pid = libc::pid_t::try_from(pid).unwrap();
    assert_eq!(unsafe { libc::kill(pid, sig) }, 0);
}

fn sigkill(pid: u32) {
    signal(pid, libc::SIGKILL);
}

/// A `publishDiagnostics` frame for `A` with one error.
fn diagnostics_frame() -> (usize, &'static str) {
    let body = r#"{"jsonrpc":"2.0","method":"textDocument/publishDiagnostics","params":{"uri":"file:///a.c","diagnostics":[{"range":{"start":{"line":0,"character":4},"end":{"line":0,"character":5}},"severity":1,"message":"boom"}]}}"#;
    (body.len(), body)
}

fn statuses(events: &[LspEvent]) -> Vec<ServerState> {
    events
        .iter()
        .filter_map(|e| match e {
            LspEvent::Status(s) => Some(*s),
            _ => None,
        })
        .collect()
}

/// Poll until the session is running on a process other than `old_pid`.
async fn wait_for_restart(manager: &mut LspManager, old_pid: u32) {
    for _ in 0..100 {
        let _ = manager.poll().await;
        if manager.state() == SessionState::Running && manager.pid() != Some(old_pid) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("server was not restarted");
}

#[tokio::test]
async fn document_lifecycle_against_echo_server() {
    let mut manager = LspManager::start(echo_config(), &root()).await.unwrap();
    assert_eq!(manager.state(), SessionState::Running);
    assert!(manager.is_alive());
    assert!(manager.capabilities().is_some());
    assert_eq!(
        statuses(&manager.take_events()),
        [ServerState::Starting, ServerState::Running]
    );

    manager.open(A, "int main(){}", "c").await.unwrap();
    manager.change(A, "int main(){return 0;}").await.unwrap();
    manager.save(A).await.unwrap();
    assert_eq!(manager.documents().version(A), Some(2));

    // The echoed notifications are ordinary traffic to dispatch.
    let handled = manager.poll().await.unwrap();
    assert!(handled <= 4);

    let items = manager.completion(A, 0, 4).await.unwrap();
    assert!(items.is_empty());

    let index = manager.diagnostics(A).await.unwrap();
    assert!(index.is_empty());

    manager.close(A).await.unwrap();
    assert!(!manager.documents().is_open(A));

    manager.stop().await;
    assert_eq!(manager.state(), SessionState::Stopped);
    assert!(manager.pid().is_none());
    assert_eq!(statuses(&manager.take_events()), [ServerState::Stopped]);
    assert!(matches!(
        manager.open(A, "", "c").await,
        Err(LspError::NotRunning)
    ));
}

#[tokio::test]
async fn crash_restarts_with_fresh_state() {
    let mut manager = LspManager::start(echo_config(), &root()).await.unwrap();
    manager.open(A, "int x;", "c").await.unwrap();
    let old_pid = manager.pid().unwrap();
    manager.take_events();

    sigkill(old_pid);
    wait_for_restart(&mut manager, old_pid).await;

    assert_eq!(manager.restarts(), 1);
    assert!(manager.is_alive());
    assert!(manager.documents().is_empty());
    assert_eq!(
        statuses(&manager.take_events()),
        [
            ServerState::Down,
            ServerState::Starting,
            ServerState::Running
        ]
    );

    // The new server starts with no documents open.
    manager.change(A, "int y;").await.unwrap();
    assert_eq!(manager.documents().version(A), Some(1));
    manager.stop().await;
}

#[tokio::test]
async fn crash_while_request_pending() {
    let mut manager = LspManager::start(echo_config(), &root()).await.unwrap();
    let pid = manager.pid().unwrap();

    // A stopped echo server never answers; kill it while we wait.
    signal(pid, libc::SIGSTOP);
    let killer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        sigkill(pid);
    });

    let err = manager.completion(A, 0, 0).await.unwrap_err();
    assert!(err.is_fatal(), "unexpected error: {err}");
    killer.await.unwrap();

    wait_for_restart(&mut manager, pid).await;
    assert!(
        statuses(&manager.take_events()).contains(&ServerState::Down)
    );
    manager.stop().await;
}

#[tokio::test]
async fn read_timeout_restarts_before_the_error_returns() {
    let config = LspConfig {
        read_timeout_ms: 200,
        ..echo_config()
    };
    let mut manager = LspManager::start(config, &root()).await.unwrap();
    let old_pid = manager.pid().unwrap();
    manager.take_events();

    signal(old_pid, libc::SIGSTOP);
    let err = manager.completion(A, 0, 0).await.unwrap_err();
    assert!(matches!(err, LspError::Timeout { .. }), "unexpected error: {err}");

    // No poll in between: the failure was already acted on.
    assert_eq!(manager.restarts(), 1);
    assert_ne!(manager.pid(), Some(old_pid));
    assert_eq!(
        statuses(&manager.take_events()),
        [
            ServerState::Down,
            ServerState::Starting,
            ServerState::Running
        ]
    );
    assert!(manager.is_alive());
    manager.stop().await;
}

#[tokio::test]
async fn exit_during_stop_does_not_restart() {
    let mut manager = LspManager::start(echo_config(), &root()).await.unwrap();
    manager.take_events();

    manager.stop().await;
    let _ = manager.poll().await;

    assert_eq!(manager.restarts(), 0);
    assert_eq!(manager.state(), SessionState::Stopped);
    assert_eq!(statuses(&manager.take_events()), [ServerState::Stopped]);
}

#[tokio::test]
async fn published_diagnostics_become_events() {
    let (len, body) = diagnostics_frame();
    let script = format!("printf 'Content-Length: {len}\\r\\n\\r\\n%s' '{body}'; exec cat");
    let config = LspConfig {
        command: String::from("sh"),
        args: vec![String::from("-c"), script],
        ..echo_config()
    };

    let mut manager = LspManager::start(config, &root()).await.unwrap();
    let events = manager.take_events();
    let diagnostics = events.iter().find_map(|e| match e {
        LspEvent::Diagnostics { uri, items } => Some((uri.clone(), items.clone())),
        _ => None,
    });
    let (uri, items) = diagnostics.expect("diagnostics published before initialize reply");
    assert_eq!(uri, A);
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].message(), "boom");

    // Nothing was open when they arrived, so no document holds them.
    assert!(manager.diagnostics(A).await.is_none());
    manager.stop().await;
}

#[tokio::test]
async fn diagnostics_include_output_written_while_thread_was_busy() {
    let (len, body) = diagnostics_frame();
    // Publish after the document is open, from a background subshell
    // sharing the server's stdout.
    let script = format!(
        "(sleep 1; printf 'Content-Length: {len}\\r\\n\\r\\n%s' '{body}') & exec cat"
    );
    let config = LspConfig {
        command: String::from("sh"),
        args: vec![String::from("-c"), script],
        ..echo_config()
    };

    let mut manager = LspManager::start(config, &root()).await.unwrap();
    manager.open(A, "int x;", "c").await.unwrap();

    // Block the runtime thread so the reactor cannot see the frame arrive.
    std::thread::sleep(Duration::from_secs(2));

    let index = manager.diagnostics(A).await.unwrap();
    assert_eq!(index.len(), 1);
    assert_eq!(index.error_count(), 1);
    manager.stop().await;
}
