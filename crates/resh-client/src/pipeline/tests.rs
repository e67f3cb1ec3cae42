use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use resh_core::{ExitCode, ProcessContext};
use resh_test_utils::CaptureWriter;

use super::*;
use crate::notification::{Interceptor, NoticeEvent, NotificationConfig, Phase};
use crate::transport::testing::RecordingSession;
use crate::transport::{ForcedExit, SessionOutcome};

const SIZE: TermSize = TermSize { cols: 80, rows: 24 };

struct Harness {
    keys: mpsc::UnboundedSender<Vec<u8>>,
    server_in: DuplexStream,
    remote_stdout: DuplexStream,
    local_out: CaptureWriter,
    local_err: CaptureWriter,
    console: CaptureWriter,
    sink: Arc<OutputSink>,
    handle: SessionHandle,
    session: Arc<RecordingSession>,
    pipeline: Pipeline,
}

fn pipeline_config() -> PipelineConfig {
    PipelineConfig {
        escape_char: Some(b'~'),
        escape_window: Duration::from_secs(1),
        translate_line_endings: false,
        inject_ctrl_z: false,
    }
}

fn notification_config(tmux: bool) -> NotificationConfig {
    NotificationConfig {
        on_top: false,
        show_full: false,
        reconnect_window: Duration::from_secs(600),
        tmux,
        term_size: || SIZE,
    }
}

fn start(
    config: PipelineConfig,
    notifications: Option<NotificationConfig>,
    filter: Arc<dyn TransferFilter>,
) -> (Harness, Option<Arc<Interceptor>>) {
    let (keys, keys_rx) = mpsc::unbounded_channel();
    let (server_in_w, server_in) = tokio::io::duplex(4096);
    let (remote_stdout, stdout_r) = tokio::io::duplex(4096);
    let local_out = CaptureWriter::new();
    let local_err = CaptureWriter::new();
    let console = CaptureWriter::new();
    let sink = OutputSink::new(Box::new(local_out.clone()), Box::new(local_err.clone()));
    let session = RecordingSession::new();
    let handle = SessionHandle::new(session.clone(), SIZE);
    let interceptor =
        notifications.map(|c| Interceptor::spawn(c, sink.clone(), handle.clone()));

    let parts = PipelineParts {
        io: SessionIo {
            stdin: Box::new(server_in_w),
            stdout: Box::new(stdout_r),
            stderr: Box::new(tokio::io::empty()),
        },
        stdin: StdinReader::from_channel(keys_rx),
        sink: sink.clone(),
        console_out: Box::new(console.clone()),
        filter,
        interceptor: interceptor.clone(),
        handle: handle.clone(),
        ctx: ProcessContext::new(),
    };
    let pipeline = Pipeline::start(parts, config);
    (
        Harness {
            keys,
            server_in,
            remote_stdout,
            local_out,
            local_err,
            console,
            sink,
            handle,
            session,
            pipeline,
        },
        interceptor,
    )
}

async fn read_exact(stream: &mut DuplexStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    buf
}

async fn forced(handle: &SessionHandle) -> ForcedExit {
    match tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .unwrap()
    {
        SessionOutcome::Forced(f) => f,
        other => panic!("expected forced exit, got {other:?}"),
    }
}

async fn wait_intercepting(interceptor: &Interceptor) {
    interceptor
        .phases()
        .wait_for(|p| *p == Phase::Intercept)
        .await
        .unwrap();
}

#[tokio::test]
async fn escape_then_dot_kills_the_session() {
    let (mut h, _) = start(pipeline_config(), None, Arc::new(PassThrough));
    for chunk in [&b"hello"[..], b"\r", b"~", b"."] {
        h.keys.send(chunk.to_vec()).unwrap();
    }

    let exit = forced(&h.handle).await;
    assert_eq!(exit.code, ExitCode::ConsoleKill);
    assert!(exit.reason.contains("^~."), "{}", exit.reason);
    assert_eq!(read_exact(&mut h.server_in, 6).await, b"hello\r");
    assert!(h.console.contents_string().contains("Terminate"));
}

#[tokio::test(start_paused = true)]
async fn slow_escape_is_forwarded() {
    let (mut h, _) = start(pipeline_config(), None, Arc::new(PassThrough));
    h.keys.send(b"\r".to_vec()).unwrap();
    assert_eq!(read_exact(&mut h.server_in, 1).await, b"\r");
    tokio::time::sleep(Duration::from_secs(2)).await;
    h.keys.send(b"~".to_vec()).unwrap();

    assert_eq!(read_exact(&mut h.server_in, 1).await, b"~");
    assert!(h.handle.forced_exit().is_none());
    assert!(h.console.contents().is_empty());
}

#[tokio::test]
async fn cancelled_console_asks_for_redraw() {
    let (mut h, _) = start(pipeline_config(), None, Arc::new(PassThrough));
    for chunk in [&b"\r"[..], b"~", b"q", b"x"] {
        h.keys.send(chunk.to_vec()).unwrap();
    }
    assert_eq!(read_exact(&mut h.server_in, 2).await, b"\rx");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.session.resizes().last(), Some(&SIZE));
    assert!(h.handle.forced_exit().is_none());
}

#[tokio::test]
async fn stdin_eof_closes_server_input() {
    let (mut h, _) = start(pipeline_config(), None, Arc::new(PassThrough));
    h.keys.send(b"abc".to_vec()).unwrap();
    drop(h.keys);

    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), h.server_in.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, b"abc");
}

#[tokio::test(start_paused = true)]
async fn stdin_eof_can_send_ctrl_z_first() {
    let config = PipelineConfig {
        inject_ctrl_z: true,
        ..pipeline_config()
    };
    let (mut h, _) = start(config, None, Arc::new(PassThrough));
    h.keys.send(b"abc".to_vec()).unwrap();
    drop(h.keys);

    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), h.server_in.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, b"abc\x1a");
}

#[tokio::test]
async fn console_eof_keeps_reading_and_escaping() {
    let config = PipelineConfig {
        inject_ctrl_z: true,
        ..pipeline_config()
    };
    let (mut h, _) = start(config, None, Arc::new(PassThrough));
    h.keys.send(b"abc".to_vec()).unwrap();
    h.keys.send(Vec::new()).unwrap();
    assert_eq!(read_exact(&mut h.server_in, 4).await, b"abc\x1a");

    for chunk in [&b"\r"[..], b"~", b"."] {
        h.keys.send(chunk.to_vec()).unwrap();
    }
    let exit = forced(&h.handle).await;
    assert_eq!(exit.code, ExitCode::ConsoleKill);
    assert_eq!(read_exact(&mut h.server_in, 1).await, b"\r");
}

#[tokio::test]
async fn line_endings_are_translated_both_ways() {
    let config = PipelineConfig {
        translate_line_endings: true,
        escape_char: None,
        ..pipeline_config()
    };
    let (mut h, _) = start(config, None, Arc::new(PassThrough));
    h.keys.send(b"a\r\nb".to_vec()).unwrap();
    assert_eq!(read_exact(&mut h.server_in, 3).await, b"a\nb");
    h.keys.send(b"c\r".to_vec()).unwrap();
    h.keys.send(b"\nd".to_vec()).unwrap();
    assert_eq!(read_exact(&mut h.server_in, 3).await, b"c\nd");

    h.remote_stdout.write_all(b"x\ny\n").await.unwrap();
    h.local_out.wait_for_len(6).await;
    assert_eq!(h.local_out.contents(), b"x\r\ny\r\n");
}

#[tokio::test]
async fn held_carriage_return_is_sent_at_eof() {
    let config = PipelineConfig {
        translate_line_endings: true,
        escape_char: None,
        ..pipeline_config()
    };
    let (mut h, _) = start(config, None, Arc::new(PassThrough));
    h.keys.send(b"q\r".to_vec()).unwrap();
    drop(h.keys);

    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), h.server_in.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, b"q\r");
}

struct DropComments;

impl TransferFilter for DropComments {
    fn filter_input(&self, chunk: Vec<u8>) -> Option<Vec<u8>> {
        (!chunk.starts_with(b"#")).then_some(chunk)
    }

    fn filter_output(&self, chunk: Vec<u8>) -> Option<Vec<u8>> {
        Some(chunk.to_ascii_uppercase())
    }
}

#[tokio::test]
async fn transfer_filter_sees_both_directions() {
    let (mut h, _) = start(pipeline_config(), None, Arc::new(DropComments));
    h.keys.send(b"# hidden".to_vec()).unwrap();
    h.keys.send(b"shown".to_vec()).unwrap();
    assert_eq!(read_exact(&mut h.server_in, 5).await, b"shown");

    h.remote_stdout.write_all(b"quiet").await.unwrap();
    h.local_out.wait_for_len(5).await;
    assert_eq!(h.local_out.contents(), b"QUIET");
}

#[tokio::test]
async fn remote_eof_finishes_the_pipeline() {
    let (h, _) = start(pipeline_config(), None, Arc::new(PassThrough));
    let Harness {
        mut remote_stdout,
        local_out,
        pipeline,
        ..
    } = h;
    remote_stdout.write_all(b"bye").await.unwrap();
    drop(remote_stdout);
    tokio::time::timeout(Duration::from_secs(5), pipeline.finish())
        .await
        .unwrap();
    assert_eq!(local_out.contents(), b"bye");
}

#[tokio::test(start_paused = true)]
async fn intercepted_output_is_released_in_order() {
    let (mut h, interceptor) = start(
        pipeline_config(),
        Some(notification_config(false)),
        Arc::new(PassThrough),
    );
    let interceptor = interceptor.unwrap();
    interceptor.notify(NoticeEvent::ConnectionLost("network unreachable".into()));
    wait_intercepting(&interceptor).await;

    h.remote_stdout.write_all(b"line1\n").await.unwrap();
    h.remote_stdout.write_all(b"line2\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(450)).await;
    assert!(h.local_out.contents().is_empty());
    assert!(h.local_err.contents_string().contains("Connection lost"));

    interceptor.notify(NoticeEvent::Reconnected);
    h.local_out.wait_for_len(12).await;
    assert_eq!(h.local_out.contents(), b"line1\nline2\n");

    h.remote_stdout.write_all(b"line3\n").await.unwrap();
    h.local_out.wait_for_len(18).await;
    assert_eq!(h.local_out.contents(), b"line1\nline2\nline3\n");
    assert!(!h.sink.is_intercepting());
}

#[tokio::test(start_paused = true)]
async fn input_typed_during_redraw_follows_the_reconnect() {
    let (mut h, interceptor) = start(
        pipeline_config(),
        Some(notification_config(false)),
        Arc::new(PassThrough),
    );
    let interceptor = interceptor.unwrap();
    interceptor.notify(NoticeEvent::ConnectionLost("timeout".into()));
    wait_intercepting(&interceptor).await;

    let mut phases = interceptor.phases();
    interceptor.notify(NoticeEvent::Reconnected);
    phases.wait_for(|p| *p == Phase::Redraw).await.unwrap();
    h.keys.send(b"ab".to_vec()).unwrap();
    h.keys.send(b"cd".to_vec()).unwrap();

    phases.wait_for(|p| *p == Phase::Idle).await.unwrap();
    h.keys.send(b"ef".to_vec()).unwrap();
    assert_eq!(read_exact(&mut h.server_in, 6).await, b"abcdef");
    assert!(h.handle.forced_exit().is_none());
}

#[tokio::test(start_paused = true)]
async fn input_is_diverted_while_intercepting() {
    let (mut h, interceptor) = start(
        pipeline_config(),
        Some(notification_config(false)),
        Arc::new(PassThrough),
    );
    let interceptor = interceptor.unwrap();
    h.keys.send(b"before".to_vec()).unwrap();
    assert_eq!(read_exact(&mut h.server_in, 6).await, b"before");

    interceptor.notify(NoticeEvent::ConnectionLost("timeout".into()));
    wait_intercepting(&interceptor).await;
    h.keys.send(b"ls\r".to_vec()).unwrap();
    h.keys.send(vec![0x03]).unwrap();

    let exit = forced(&h.handle).await;
    assert_eq!(exit.code, ExitCode::UdpCtrlC);
    let mut more = [0u8; 1];
    let nothing =
        tokio::time::timeout(Duration::from_millis(500), h.server_in.read(&mut more)).await;
    assert!(!matches!(nothing, Ok(Ok(n)) if n > 0));
}

#[tokio::test(start_paused = true)]
async fn tmux_detach_while_intercepting_ends_the_session() {
    let (mut h, interceptor) = start(
        pipeline_config(),
        Some(notification_config(true)),
        Arc::new(PassThrough),
    );
    let interceptor = interceptor.unwrap();
    interceptor.notify(NoticeEvent::ConnectionLost("timeout".into()));
    wait_intercepting(&interceptor).await;

    h.keys.send(b"detach\r".to_vec()).unwrap();
    let exit = forced(&h.handle).await;
    assert_eq!(exit.code, ExitCode::TmuxDetach);
    assert!(h.local_err.contents_string().contains("%begin "));

    let mut more = [0u8; 1];
    let nothing =
        tokio::time::timeout(Duration::from_millis(500), h.server_in.read(&mut more)).await;
    assert!(!matches!(nothing, Ok(Ok(n)) if n > 0));
}

#[tokio::test(start_paused = true)]
async fn resize_forwarder_skips_unchanged_sizes() {
    let session = RecordingSession::new();
    let handle = SessionHandle::new(session.clone(), SIZE);
    let (tx, rx) = mpsc::unbounded_channel();
    let task = spawn_resize_forwarder(handle.clone(), rx);

    tx.send(SIZE).unwrap();
    tx.send(TermSize { cols: 120, rows: 40 }).unwrap();
    drop(tx);
    task.await.unwrap();

    assert_eq!(session.resizes(), vec![TermSize { cols: 120, rows: 40 }]);
    assert_eq!(handle.size(), TermSize { cols: 120, rows: 40 });
}

#[tokio::test(start_paused = true)]
async fn full_queue_diverts_to_interceptor_once_intercepting() {
    let sink = OutputSink::new(Box::new(CaptureWriter::new()), Box::new(CaptureWriter::new()));
    let handle = SessionHandle::new(RecordingSession::new(), SIZE);
    let interceptor = Interceptor::spawn(notification_config(false), sink, handle.clone());

    let (queue, mut queued) = mpsc::channel(INPUT_QUEUE_CAPACITY);
    for i in 0..INPUT_QUEUE_CAPACITY {
        queue.try_send(vec![b'a' + i as u8]).unwrap();
    }
    let (keys, keys_rx) = mpsc::unbounded_channel();
    let stage = InputStage {
        reader: StdinReader::from_channel(keys_rx),
        detector: EscapeDetector::new(None, Duration::from_secs(1)),
        console_out: Box::new(CaptureWriter::new()),
        filter: Arc::new(PassThrough),
        interceptor: Some(interceptor.clone()),
        handle: handle.clone(),
        translate: None,
        inject_ctrl_z: false,
    };
    let task = tokio::spawn(stage.run(queue));

    // Ctrl+C waits for room while the link is up
    keys.send(vec![0x03]).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(handle.forced_exit().is_none());

    interceptor.notify(NoticeEvent::ConnectionLost("timeout".into()));
    wait_intercepting(&interceptor).await;
    let exit = forced(&handle).await;
    assert_eq!(exit.code, ExitCode::UdpCtrlC);

    let mut held = Vec::new();
    while let Ok(chunk) = queued.try_recv() {
        held.push(chunk);
    }
    assert_eq!(held.len(), INPUT_QUEUE_CAPACITY);
    assert!(!held.contains(&vec![0x03]));
    task.abort();
}

#[test]
fn line_endings_survive_split_reads() {
    let mut to_lf = CrlfToLf::default();
    assert_eq!(to_lf.convert(b"a\r\nb\rc"), b"a\nb\rc");
    assert_eq!(to_lf.convert(b"x\r"), b"x");
    assert_eq!(to_lf.convert(b"\ny"), b"\ny");
    assert_eq!(to_lf.convert(b"\r\r\n"), b"\r\n");
    assert_eq!(to_lf.finish(), None);
    to_lf.convert(b"\r");
    assert_eq!(to_lf.finish(), Some(b"\r".to_vec()));

    let mut to_crlf = LfToCrlf::default();
    assert_eq!(to_crlf.convert(b"a\nb\r\nc"), b"a\r\nb\r\nc");
    assert_eq!(to_crlf.convert(b"\n"), b"\r\n");
    assert_eq!(to_crlf.convert(b"d\r"), b"d\r");
    assert_eq!(to_crlf.convert(b"\ne"), b"\ne");
}
