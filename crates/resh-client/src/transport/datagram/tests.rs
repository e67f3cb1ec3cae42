use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use resh_core::tunnel::Reply;
use resh_core::tunnel::messages::ExitMessage;
use resh_test_utils::{MockTunnel, MockTunnelConfig};

use super::*;
use crate::terminal::TermSize;
use crate::transport::{PtyRequest, StartRequest};

async fn tunnel(config: MockTunnelConfig, alive_timeout: Duration) -> (DatagramTransport, MockTunnel) {
    let (client, server) = tokio::io::duplex(256 * 1024);
    let mock = MockTunnel::spawn(server, config);
    let transport = DatagramTransport::from_stream(client, alive_timeout)
        .await
        .unwrap();
    (transport, mock)
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap()
}

fn pty_options() -> SessionOptions {
    SessionOptions {
        pty: Some(PtyRequest {
            term: "xterm-256color".into(),
            size: TermSize { cols: 120, rows: 40 },
        }),
        ..Default::default()
    }
}

#[tokio::test]
async fn session_echoes_and_reports_exit() {
    let config = MockTunnelConfig {
        greeting: b"welcome\n".to_vec(),
        exit_code: 7,
        ..Default::default()
    };
    let (transport, mock) = tunnel(config, Duration::from_secs(100)).await;

    let session = transport.new_session(pty_options()).await.unwrap();
    let mut io = session.start(StartRequest::Shell).await.unwrap();
    io.stdin.write_all(b"ls\n").await.unwrap();
    io.stdin.shutdown().await.unwrap();

    let mut out = Vec::new();
    io.stdout.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"welcome\nls\n");

    assert_eq!(session.wait().await, RemoteExit::Status(7));
    transport.wait().await;
    assert_eq!(transport.active_sessions(), 0);

    let starts = mock.log.starts();
    assert_eq!(starts.len(), 1);
    assert!(starts[0].shell && starts[0].pty);
    assert_eq!((starts[0].cols, starts[0].rows), (120, 40));
    assert_eq!(starts[0].envs.get("TERM").map(String::as_str), Some("xterm-256color"));
}

#[tokio::test]
async fn refused_start_carries_remote_text() {
    let config = MockTunnelConfig {
        start_reply: Reply::error("permission denied"),
        ..Default::default()
    };
    let (transport, _mock) = tunnel(config, Duration::from_secs(100)).await;

    let session = transport.new_session(SessionOptions::default()).await.unwrap();
    let err = session
        .start(StartRequest::Exec("ls".into()))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("permission denied"));
    assert_eq!(session.wait().await, RemoteExit::Lost);
    assert_eq!(transport.active_sessions(), 0);
}

#[tokio::test]
async fn session_ids_are_never_reused() {
    let (transport, mock) = tunnel(MockTunnelConfig::default(), Duration::from_secs(100)).await;
    let a = transport.new_session(SessionOptions::default()).await.unwrap();
    let mut io = a.start(StartRequest::Exec("true".into())).await.unwrap();
    io.stdin.shutdown().await.unwrap();
    a.wait().await;

    let b = transport.new_session(SessionOptions::default()).await.unwrap();
    let _io = b.start(StartRequest::Exec("true".into())).await.unwrap();
    let ids: Vec<u64> = mock.log.starts().iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![0, 1]);
    assert_eq!(mock.log.starts()[1].args, vec!["-c".to_string(), "true".to_string()]);
}

#[tokio::test]
async fn resize_and_close_travel_on_the_bus() {
    let (transport, mock) = tunnel(MockTunnelConfig::default(), Duration::from_secs(100)).await;
    let session = transport.new_session(pty_options()).await.unwrap();
    let _io = session.start(StartRequest::Shell).await.unwrap();

    session.window_change(TermSize { cols: 90, rows: 30 }).await.unwrap();
    session.close().await.unwrap();
    assert_eq!(session.wait().await, RemoteExit::Status(255));

    let resizes = mock.log.resizes();
    assert_eq!(resizes.len(), 1);
    assert_eq!((resizes[0].cols, resizes[0].rows), (90, 30));
    assert_eq!(mock.log.closes(), vec![0]);
}

#[tokio::test]
async fn exit_for_unknown_id_is_ignored() {
    let (transport, mock) = tunnel(MockTunnelConfig::default(), Duration::from_secs(100)).await;
    let session = transport.new_session(SessionOptions::default()).await.unwrap();
    mock.send_bus(BusCommand::Exit, &ExitMessage { id: 42, code: 1 });
    mock.send_bus(BusCommand::Exit, &ExitMessage { id: 0, code: 3 });
    assert_eq!(session.wait().await, RemoteExit::Status(3));
}

#[tokio::test]
async fn dial_tunnels_bytes() {
    let (transport, mock) = tunnel(MockTunnelConfig::default(), Duration::from_secs(100)).await;
    let mut stream = transport.dial("db.internal", 5432).await.unwrap();
    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    assert_eq!(mock.log.dials()[0].addr, "db.internal:5432");
    assert_eq!(format_addr("::1", 22), "[::1]:22");
}

#[tokio::test]
async fn refused_dial_is_an_error() {
    let config = MockTunnelConfig {
        dial_reply: Reply::error("connection refused"),
        ..Default::default()
    };
    let (transport, _mock) = tunnel(config, Duration::from_secs(100)).await;
    let err = match transport.dial("localhost", 1).await {
        Ok(_) => panic!("dial should fail"),
        Err(e) => e,
    };
    assert!(err.to_string().contains("connection refused"));
}

#[tokio::test]
async fn listener_claims_announced_connection() {
    let (transport, mock) = tunnel(MockTunnelConfig::default(), Duration::from_secs(100)).await;
    let mut listener = transport
        .listen(ListenAddr::Unix("/tmp/wayland-resh".into()))
        .await
        .unwrap();
    let mut conn = listener.accept().await.unwrap();
    conn.write_all(b"hi").await.unwrap();
    let mut buf = [0u8; 2];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hi");
    let listens = mock.log.listens();
    assert_eq!(listens[0].network, "unix");
    assert_eq!(listens[0].addr, "/tmp/wayland-resh");
}

#[tokio::test(start_paused = true)]
async fn silent_server_triggers_alive_timeout() {
    let config = MockTunnelConfig {
        answer_alive: false,
        ..Default::default()
    };
    let (transport, mock) = tunnel(config, Duration::from_secs(1)).await;
    let mut events = transport.events().unwrap();
    assert!(transport.events().is_none());

    let mut seen = Vec::new();
    loop {
        let event = next_event(&mut events).await;
        let done = event == TransportEvent::AliveTimeout;
        seen.push(event);
        if done {
            break;
        }
    }
    assert!(matches!(seen[0], TransportEvent::ConnectionLost(_)), "{seen:?}");
    assert!(seen.len() > 2, "{seen:?}");
    assert!(
        seen[1..seen.len() - 1]
            .iter()
            .all(|e| matches!(e, TransportEvent::ReconnectError(_))),
        "{seen:?}"
    );
    assert!(mock.log.alive_received() > 0);
}

#[tokio::test(start_paused = true)]
async fn silent_outage_is_reported_lost_then_reconnected() {
    let (transport, mock) = tunnel(MockTunnelConfig::default(), Duration::from_secs(1)).await;
    let mut events = transport.events().unwrap();
    mock.set_answer_alive(false);

    let lost = next_event(&mut events).await;
    assert!(
        matches!(&lost, TransportEvent::ConnectionLost(reason) if reason.contains("no reply")),
        "{lost:?}"
    );
    let retry = next_event(&mut events).await;
    assert!(matches!(retry, TransportEvent::ReconnectError(_)), "{retry:?}");
    let alives_while_lost = mock.log.alive_received();

    mock.set_answer_alive(true);
    loop {
        match next_event(&mut events).await {
            TransportEvent::ReconnectError(_) => continue,
            TransportEvent::Reconnected => break,
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert!(mock.log.alive_received() > alives_while_lost);

    let quiet = tokio::time::timeout(Duration::from_millis(500), events.recv()).await;
    assert!(quiet.is_err(), "unexpected event: {quiet:?}");
}

#[tokio::test(start_paused = true)]
async fn answered_alives_keep_the_tunnel_up() {
    let (transport, mock) = tunnel(MockTunnelConfig::default(), Duration::from_secs(1)).await;
    let mut events = transport.events().unwrap();
    let waited = tokio::time::timeout(Duration::from_secs(5), events.recv()).await;
    assert!(waited.is_err(), "unexpected event: {:?}", waited);
    assert!(mock.log.alive_received() >= 10);
}

#[tokio::test]
async fn dropped_tunnel_reports_connection_lost() {
    let (transport, mock) = tunnel(MockTunnelConfig::default(), Duration::from_secs(100)).await;
    let mut events = transport.events().unwrap();
    mock.close();
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap();
    assert!(matches!(event, Some(TransportEvent::ConnectionLost(_))));
}
