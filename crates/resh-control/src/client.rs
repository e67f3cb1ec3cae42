//! Mux client handshake.
//!
//! Opens the control socket, exchanges HELLO and requests proxy mode. On
//! success the socket is handed to [`MuxPacketTransport`] and from then on
//! carries unencrypted SSH packets.

use std::path::Path;

use tokio::net::UnixStream;
use tracing::debug;

use resh_core::constants::{CONTROL_DIAL_TIMEOUT, MUX_PROTOCOL_VERSION};

use crate::error::{MuxError, MuxResult};
use crate::protocol::{MUX_MSG_HELLO, MUX_S_PROXY, MuxMessage, read_message, write_message};
use crate::transport::MuxPacketTransport;

/// Dial the control socket with the standard timeout.
pub async fn dial(path: &Path) -> MuxResult<UnixStream> {
    match tokio::time::timeout(CONTROL_DIAL_TIMEOUT, UnixStream::connect(path)).await {
        Ok(stream) => Ok(stream?),
        Err(_) => Err(MuxError::Timeout),
    }
}

/// Run the proxy handshake on an already connected stream.
///
/// HELLO and the proxy request go out back to back; both replies are read
/// afterwards. A master that breaks off mid-handshake counts as a refusal.
pub async fn handshake<S>(stream: &mut S) -> MuxResult<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let hello = MuxMessage::Hello {
        version: MUX_PROTOCOL_VERSION,
    };
    write_message(stream, &hello).await?;
    write_message(stream, &MuxMessage::ProxyRequest { request_id: 0 }).await?;

    match read_reply(stream, "HELLO").await? {
        MuxMessage::Hello { version } if version == MUX_PROTOCOL_VERSION => {}
        MuxMessage::Hello { version } => return Err(MuxError::ProtocolMismatch { version }),
        MuxMessage::Failure { reason } => return Err(MuxError::ServerFailure(reason)),
        other => {
            return Err(MuxError::UnexpectedMessage {
                expected: MUX_MSG_HELLO,
                got: other.kind(),
            });
        }
    }

    match read_reply(stream, "proxy response").await? {
        MuxMessage::Proxy { .. } => Ok(()),
        MuxMessage::Failure { reason } => Err(MuxError::ServerFailure(reason)),
        other => Err(MuxError::UnexpectedMessage {
            expected: MUX_S_PROXY,
            got: other.kind(),
        }),
    }
}

async fn read_reply<S>(stream: &mut S, what: &str) -> MuxResult<MuxMessage>
where
    S: tokio::io::AsyncRead + Unpin,
{
    read_message(stream).await.map_err(|e| match e {
        MuxError::Io(e) => MuxError::ServerFailure(format!("no {} from master: {}", what, e)),
        MuxError::Codec(msg) => MuxError::ServerFailure(format!("bad {} from master: {}", what, msg)),
        other => other,
    })
}

/// Connect to a control master and switch it into proxy mode.
pub async fn connect_proxy(path: &Path) -> MuxResult<MuxPacketTransport> {
    let mut stream = dial(path).await?;
    handshake(&mut stream).await?;
    debug!(path = %path.display(), "control master proxy established");
    Ok(MuxPacketTransport::new(stream))
}

/// Whether a master is listening on `path`.
pub async fn is_alive(path: &Path) -> bool {
    let Ok(mut stream) = dial(path).await else {
        return false;
    };
    let hello = MuxMessage::Hello {
        version: MUX_PROTOCOL_VERSION,
    };
    if write_message(&mut stream, &hello).await.is_err() {
        return false;
    }
    matches!(
        tokio::time::timeout(CONTROL_DIAL_TIMEOUT, read_message(&mut stream)).await,
        Ok(Ok(MuxMessage::Hello { .. }))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use resh_core::PacketTransport;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    async fn serve_once<F, Fut>(dir: &Path, script: F) -> std::path::PathBuf
    where
        F: FnOnce(UnixStream) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let path = dir.join("ctl.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            script(stream).await;
        });
        path
    }

    #[tokio::test]
    async fn happy_path_reads_first_packet() {
        let dir = tempfile::tempdir().unwrap();
        let path = serve_once(dir.path(), |mut s| async move {
            assert_eq!(
                read_message(&mut s).await.unwrap(),
                MuxMessage::Hello { version: 4 }
            );
            write_message(&mut s, &MuxMessage::Hello { version: 4 })
                .await
                .unwrap();
            assert_eq!(
                read_message(&mut s).await.unwrap(),
                MuxMessage::ProxyRequest { request_id: 0 }
            );
            write_message(&mut s, &MuxMessage::Proxy { request_id: 0 })
                .await
                .unwrap();
            s.write_all(&[0, 0, 0, 4, 0, 0, 1, 2]).await.unwrap();
            let mut rest = Vec::new();
            let _ = s.read_to_end(&mut rest).await;
        })
        .await;

        let transport = connect_proxy(&path).await.unwrap();
        let packet = transport.read_packet().await.unwrap().unwrap();
        assert_eq!(&packet[..], &[0x00, 0x01, 0x02]);
    }

    #[tokio::test]
    async fn version_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = serve_once(dir.path(), |mut s| async move {
            let _ = read_message(&mut s).await;
            write_message(&mut s, &MuxMessage::Hello { version: 5 })
                .await
                .unwrap();
        })
        .await;

        let err = connect_proxy(&path).await.unwrap_err();
        assert!(matches!(err, MuxError::ProtocolMismatch { version: 5 }));
    }

    #[tokio::test]
    async fn proxy_refusal_carries_reason() {
        let dir = tempfile::tempdir().unwrap();
        let path = serve_once(dir.path(), |mut s| async move {
            let _ = read_message(&mut s).await;
            write_message(&mut s, &MuxMessage::Hello { version: 4 })
                .await
                .unwrap();
            let _ = read_message(&mut s).await;
            write_message(
                &mut s,
                &MuxMessage::Failure {
                    reason: "proxy mode disabled".into(),
                },
            )
            .await
            .unwrap();
        })
        .await;

        let err = connect_proxy(&path).await.unwrap_err();
        assert!(err.to_string().contains("proxy mode disabled"));
    }

    #[tokio::test]
    async fn unexpected_reply_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = serve_once(dir.path(), |mut s| async move {
            let _ = read_message(&mut s).await;
            write_message(&mut s, &MuxMessage::Other { kind: 0x8000_0001 })
                .await
                .unwrap();
        })
        .await;

        let err = connect_proxy(&path).await.unwrap_err();
        assert!(matches!(
            err,
            MuxError::UnexpectedMessage {
                expected: MUX_MSG_HELLO,
                got: 0x8000_0001
            }
        ));
    }

    #[tokio::test]
    async fn requests_are_sent_before_any_reply() {
        let dir = tempfile::tempdir().unwrap();
        let path = serve_once(dir.path(), |mut s| async move {
            // both requests must already be on the wire
            let first = read_message(&mut s).await.unwrap();
            let second = read_message(&mut s).await.unwrap();
            assert_eq!(first, MuxMessage::Hello { version: 4 });
            assert_eq!(second, MuxMessage::ProxyRequest { request_id: 0 });
            write_message(&mut s, &MuxMessage::Hello { version: 4 })
                .await
                .unwrap();
            write_message(&mut s, &MuxMessage::Proxy { request_id: 0 })
                .await
                .unwrap();
            let mut rest = Vec::new();
            let _ = s.read_to_end(&mut rest).await;
        })
        .await;

        let connected =
            tokio::time::timeout(std::time::Duration::from_secs(5), connect_proxy(&path)).await;
        assert!(matches!(connected, Ok(Ok(_))));
    }

    #[tokio::test]
    async fn master_hanging_up_is_a_server_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = serve_once(dir.path(), |mut s| async move {
            let _ = read_message(&mut s).await;
            drop(s);
        })
        .await;

        let err = connect_proxy(&path).await.unwrap_err();
        assert!(matches!(err, MuxError::ServerFailure(_)), "{err:?}");
        assert!(err.to_string().contains("HELLO"), "{err}");
    }

    #[tokio::test]
    async fn failure_in_place_of_hello_carries_reason() {
        let dir = tempfile::tempdir().unwrap();
        let path = serve_once(dir.path(), |mut s| async move {
            let _ = read_message(&mut s).await;
            write_message(
                &mut s,
                &MuxMessage::Failure {
                    reason: "too many sessions".into(),
                },
            )
            .await
            .unwrap();
        })
        .await;

        let err = connect_proxy(&path).await.unwrap_err();
        assert!(matches!(&err, MuxError::ServerFailure(r) if r == "too many sessions"));
    }

    #[tokio::test]
    async fn missing_socket_is_not_alive() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_alive(&dir.path().join("nope.sock")).await);
    }
}
