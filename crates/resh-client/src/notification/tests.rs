use std::sync::Arc;
use std::time::Duration;

use resh_core::ExitCode;
use resh_test_utils::CaptureWriter;

use super::*;
use crate::pipeline::{OutputSink, OutputStream};
use crate::transport::testing::RecordingSession;
use crate::transport::{ForcedExit, SessionHandle, SessionOutcome};

struct Harness {
    interceptor: Arc<Interceptor>,
    sink: Arc<OutputSink>,
    handle: SessionHandle,
    session: Arc<RecordingSession>,
    out: CaptureWriter,
    err: CaptureWriter,
}

fn fixed_size() -> TermSize {
    TermSize { cols: 80, rows: 24 }
}

fn config() -> NotificationConfig {
    NotificationConfig {
        on_top: false,
        show_full: false,
        reconnect_window: Duration::from_secs(600),
        tmux: false,
        term_size: fixed_size,
    }
}

fn harness(config: NotificationConfig) -> Harness {
    let out = CaptureWriter::new();
    let err = CaptureWriter::new();
    let sink = OutputSink::new(Box::new(out.clone()), Box::new(err.clone()));
    let session = RecordingSession::new();
    let handle = SessionHandle::new(session.clone(), fixed_size());
    let interceptor = Interceptor::spawn(config, sink.clone(), handle.clone());
    Harness {
        interceptor,
        sink,
        handle,
        session,
        out,
        err,
    }
}

async fn lose_connection(h: &Harness) {
    h.interceptor
        .notify(NoticeEvent::ConnectionLost("network unreachable".into()));
    let mut phases = h.interceptor.phases();
    phases
        .wait_for(|p| *p == Phase::Intercept)
        .await
        .unwrap();
    assert!(h.interceptor.is_intercepting());
}

async fn forced(h: &Harness) -> ForcedExit {
    let outcome = tokio::time::timeout(Duration::from_secs(5), h.handle.wait())
        .await
        .unwrap();
    match outcome {
        SessionOutcome::Forced(f) => f,
        other => panic!("expected forced exit, got {other:?}"),
    }
}

#[test]
fn cursor_reports() {
    assert_eq!(parse_cursor_report(b"\x1b[12;40R"), Some((12, 40)));
    assert_eq!(parse_cursor_report(b"\x1b[1;1R"), Some((1, 1)));
    assert_eq!(parse_cursor_report(b"\x1b[1R"), None);
    assert_eq!(parse_cursor_report(b"\x1b[a;bR"), None);
    assert_eq!(parse_cursor_report(b"hello!"), None);
}

#[test]
fn tmux_variable_turns_on_control_mode() {
    assert!(tmux_from_env(Some("/tmp/tmux-1000/default,4242,0".into())));
    assert!(!tmux_from_env(Some(OsString::new())));
    assert!(!tmux_from_env(None));

    let config = NotificationConfig::from_options(&SshOptions::new()).unwrap();
    assert_eq!(config.tmux, tmux_from_env(std::env::var_os("TMUX")));
    assert_eq!(config.reconnect_window, Duration::from_secs(600));
}

#[tokio::test(start_paused = true)]
async fn idle_ignores_everything_but_loss() {
    let h = harness(config());
    h.interceptor.notify(NoticeEvent::Reconnected);
    h.interceptor.notify(NoticeEvent::UserAbort);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(h.interceptor.phase(), Phase::Idle);
    assert!(h.err.contents().is_empty());
    assert!(h.handle.forced_exit().is_none());
}

#[tokio::test(start_paused = true)]
async fn reconnect_redraws_and_releases_cache() {
    let h = harness(config());
    lose_connection(&h).await;

    h.sink
        .write(OutputStream::Stdout, b"line1\nline2\n")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(450)).await;
    assert!(h.out.contents().is_empty());
    let notice = h.err.contents_string();
    assert!(notice.contains("Connection lost"), "{notice:?}");
    assert!(notice.contains("Ctrl+A to toggle full notifications"));

    h.interceptor.notify(NoticeEvent::Reconnected);
    h.out.wait_for_len(12).await;
    assert_eq!(h.out.contents(), b"line1\nline2\n");
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.interceptor.phase(), Phase::Idle);
    assert!(!h.interceptor.is_intercepting());
    assert_eq!(
        h.session.resizes(),
        vec![TermSize { cols: 80, rows: 23 }, TermSize { cols: 80, rows: 24 }]
    );
    assert!(h.err.contents_string().contains("Reconnected"));
    assert!(h.handle.forced_exit().is_none());
}

#[tokio::test(start_paused = true)]
async fn ctrl_c_while_intercepting_exits() {
    let h = harness(config());
    lose_connection(&h).await;
    h.interceptor.handle_input(vec![0x03]);

    let exit = forced(&h).await;
    assert_eq!(exit.code, ExitCode::UdpCtrlC);
    assert_eq!(exit.reason, "interrupted while reconnecting");
    assert_eq!(h.interceptor.phase(), Phase::Exit);
}

#[tokio::test(start_paused = true)]
async fn user_abort_event_exits() {
    let h = harness(config());
    lose_connection(&h).await;
    h.interceptor.notify(NoticeEvent::UserAbort);
    assert_eq!(forced(&h).await.code, ExitCode::UdpCtrlC);
}

#[tokio::test(start_paused = true)]
async fn reconnect_window_expiry_exits() {
    let h = harness(NotificationConfig {
        reconnect_window: Duration::from_secs(5),
        ..config()
    });
    lose_connection(&h).await;

    let exit = forced(&h).await;
    assert_eq!(exit.code, ExitCode::UdpReconnectTimeout);
    assert_eq!(exit.reason, "reconnect timeout after 5 seconds");
}

#[tokio::test(start_paused = true)]
async fn ctrl_a_toggles_full_notice() {
    let h = harness(config());
    lose_connection(&h).await;
    assert!(!h.interceptor.show_full());

    h.interceptor.handle_input(vec![0x01]);
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(h.interceptor.show_full());
    assert!(h.err.contents_string().contains("Press Ctrl+C to exit"));

    h.interceptor.handle_input(vec![0x01]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!h.interceptor.show_full());
}

#[tokio::test(start_paused = true)]
async fn full_notice_shows_last_error() {
    let h = harness(NotificationConfig {
        show_full: true,
        ..config()
    });
    lose_connection(&h).await;
    h.interceptor
        .notify(NoticeEvent::ReconnectError("connection refused".into()));
    tokio::time::sleep(Duration::from_millis(450)).await;
    assert!(h.err.contents_string().contains("Last error: connection refused"));
}

#[tokio::test(start_paused = true)]
async fn other_keys_are_discarded() {
    let h = harness(config());
    lose_connection(&h).await;
    h.interceptor.handle_input(b"ls -la\r".to_vec());
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(h.interceptor.phase(), Phase::Intercept);
    assert!(h.handle.forced_exit().is_none());
}

#[tokio::test(start_paused = true)]
async fn on_top_asks_for_cursor_and_restores_it() {
    let h = harness(NotificationConfig {
        on_top: true,
        ..config()
    });
    h.interceptor
        .notify(NoticeEvent::ConnectionLost("timeout".into()));
    h.err.wait_for_len(4).await;
    assert!(h.err.contents().starts_with(b"\x1b[6n"));

    h.interceptor.handle_input(b"\x1b[12;40R".to_vec());
    tokio::time::sleep(Duration::from_millis(250)).await;
    let drawn = h.err.contents_string();
    assert!(drawn.contains("\x1b[s\x1b[1;1H"), "{drawn:?}");
    assert!(drawn.contains("\x1b[12;40H"));
}

#[tokio::test(start_paused = true)]
async fn on_top_without_cursor_report_falls_back_to_restore() {
    let h = harness(NotificationConfig {
        on_top: true,
        ..config()
    });
    h.interceptor
        .notify(NoticeEvent::ConnectionLost("timeout".into()));
    tokio::time::sleep(Duration::from_millis(800)).await;
    let drawn = h.err.contents_string();
    assert!(drawn.contains("\x1b[u"), "{drawn:?}");
}

#[tokio::test(start_paused = true)]
async fn tmux_detach_exits_with_acknowledgement() {
    let h = harness(NotificationConfig {
        tmux: true,
        ..config()
    });
    assert!(h.interceptor.tmux_active());
    lose_connection(&h).await;

    h.interceptor.handle_input(b"detach\r".to_vec());
    let exit = forced(&h).await;
    assert_eq!(exit.code, ExitCode::TmuxDetach);
    assert_eq!(exit.reason, "detached from tmux");
    assert!(h.err.contents_string().contains("%begin "));
    assert!(h.out.contents().is_empty());
}

#[tokio::test(start_paused = true)]
async fn tmux_notice_goes_through_the_active_pane() {
    let h = harness(NotificationConfig {
        tmux: true,
        ..config()
    });
    h.interceptor.observe_output(b"%output %5 hello\r\n");
    lose_connection(&h).await;
    tokio::time::sleep(Duration::from_millis(250)).await;
    let drawn = h.err.contents_string();
    assert!(drawn.starts_with("%output %5 "), "{drawn:?}");
    // no cursor query in control mode
    assert!(!drawn.contains("\x1b[6n"));
}

#[tokio::test(start_paused = true)]
async fn tmux_ctrl_c_key_exits() {
    let h = harness(NotificationConfig {
        tmux: true,
        ..config()
    });
    lose_connection(&h).await;
    h.interceptor
        .handle_input(b"send -t %1 0x03\r".to_vec());
    assert_eq!(forced(&h).await.code, ExitCode::UdpCtrlC);
}
