//! Plumbing between channel events and the byte streams of [`SessionIo`].

use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::watch;
use tracing::trace;

use super::{RemoteExit, SessionIo};

/// Capacity of each in-memory session pipe.
const PIPE_SIZE: usize = 256 * 1024;

/// Transport-side ends of a session's pipes.
pub(crate) struct PipeEnds {
    /// Bytes the user wrote to stdin.
    pub stdin: DuplexStream,
    pub sinks: OutputSinks,
}

/// Create the three pipes of a session.
pub(crate) fn session_pipes() -> (SessionIo, PipeEnds) {
    let (stdin_user, stdin_remote) = tokio::io::duplex(PIPE_SIZE);
    let (stdout_user, stdout_remote) = tokio::io::duplex(PIPE_SIZE);
    let (stderr_user, stderr_remote) = tokio::io::duplex(PIPE_SIZE);
    let io = SessionIo {
        stdin: Box::new(stdin_user),
        stdout: Box::new(stdout_user),
        stderr: Box::new(stderr_user),
    };
    let ends = PipeEnds {
        stdin: stdin_remote,
        sinks: OutputSinks {
            stdout: Some(stdout_remote),
            stderr: Some(stderr_remote),
        },
    };
    (io, ends)
}

/// Write side of stdout and stderr. Writes after EOF are dropped.
pub(crate) struct OutputSinks {
    stdout: Option<DuplexStream>,
    stderr: Option<DuplexStream>,
}

impl OutputSinks {
    pub async fn stdout(&mut self, data: &[u8]) {
        Self::write(&mut self.stdout, data).await;
    }

    pub async fn stderr(&mut self, data: &[u8]) {
        Self::write(&mut self.stderr, data).await;
    }

    async fn write(slot: &mut Option<DuplexStream>, data: &[u8]) {
        if let Some(pipe) = slot
            && pipe.write_all(data).await.is_err()
        {
            // Reader is gone; keep draining the channel.
            trace!("session pipe reader dropped");
            *slot = None;
        }
    }

    /// Signal EOF on both streams.
    pub async fn eof(&mut self) {
        for slot in [&mut self.stdout, &mut self.stderr] {
            if let Some(mut pipe) = slot.take() {
                let _ = pipe.shutdown().await;
            }
        }
    }
}

/// One-shot record of how a session ended.
#[derive(Clone)]
pub(crate) struct ExitCell {
    tx: std::sync::Arc<watch::Sender<Option<RemoteExit>>>,
}

impl ExitCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            tx: std::sync::Arc::new(tx),
        }
    }

    /// Record the exit; later calls are ignored.
    pub fn set(&self, exit: RemoteExit) {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(exit);
            true
        });
    }

    pub fn get(&self) -> Option<RemoteExit> {
        self.tx.borrow().clone()
    }

    pub async fn wait(&self) -> RemoteExit {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(exit) => exit.clone().unwrap_or(RemoteExit::Lost),
            Err(_) => RemoteExit::Lost,
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn sinks_deliver_then_eof() {
        let (mut io, mut ends) = session_pipes();
        ends.sinks.stdout(b"out").await;
        ends.sinks.stderr(b"err").await;
        ends.sinks.eof().await;
        ends.sinks.stdout(b"late").await;

        let mut out = Vec::new();
        io.stdout.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"out");
        let mut err = Vec::new();
        io.stderr.read_to_end(&mut err).await.unwrap();
        assert_eq!(err, b"err");
    }

    #[tokio::test]
    async fn exit_cell_keeps_first_value() {
        let cell = ExitCell::new();
        cell.set(RemoteExit::Status(2));
        cell.set(RemoteExit::Lost);
        assert_eq!(cell.wait().await, RemoteExit::Status(2));
        assert_eq!(cell.get(), Some(RemoteExit::Status(2)));
    }
}
