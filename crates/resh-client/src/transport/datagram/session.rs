//! One remote session on the datagram tunnel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::debug;

use resh_core::tunnel::codec::{read_reply, write_message};
use resh_core::tunnel::messages::{CloseMessage, ResizeMessage, StartMessage, StderrMessage};
use resh_core::tunnel::{BusCommand, StreamKind};
use resh_core::{Error, Result};

use super::Inner;
use crate::terminal::TermSize;
use crate::transport::channel_io::ExitCell;
use crate::transport::{RemoteExit, RemoteSession, SessionIo, SessionOptions, StartRequest};

/// Session keyed by its tunnel id. Exit arrives on the bus.
pub struct DatagramSession {
    inner: Arc<Inner>,
    id: u64,
    options: SessionOptions,
    exit: ExitCell,
    started: AtomicBool,
}

impl std::fmt::Debug for DatagramSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramSession")
            .field("id", &self.id)
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl DatagramSession {
    pub(super) fn new(inner: Arc<Inner>, id: u64, options: SessionOptions, exit: ExitCell) -> Self {
        Self {
            inner,
            id,
            options,
            exit,
            started: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn start_message(&self, request: &StartRequest) -> Result<StartMessage> {
        let size = self.options.pty.as_ref().map(|p| p.size).unwrap_or_default();
        let mut msg = StartMessage {
            id: self.id,
            pty: self.options.pty.is_some(),
            cols: size.cols,
            rows: size.rows,
            envs: self.options.env.clone(),
            ..Default::default()
        };
        if let Some(pty) = &self.options.pty {
            msg.envs.insert("TERM".into(), pty.term.clone());
        }
        match request {
            StartRequest::Shell => msg.shell = true,
            StartRequest::Exec(command) => {
                msg.name = "sh".into();
                msg.args = vec!["-c".into(), command.clone()];
            }
            StartRequest::Subsystem(name) => {
                return Err(Error::RemoteExec {
                    message: format!("subsystem {} is not available over the datagram tunnel", name),
                });
            }
        }
        Ok(msg)
    }
}

#[async_trait]
impl RemoteSession for DatagramSession {
    async fn start(&self, request: StartRequest) -> Result<SessionIo> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Protocol {
                message: format!("session {} already started", self.id),
            });
        }
        let result = async {
            let msg = self.start_message(&request)?;
            let mut stream = self.inner.open_stream(StreamKind::Session).await?;
            write_message(&mut stream, &msg).await?;
            read_reply(&mut stream).await?;

            let mut stderr = self.inner.open_stream(StreamKind::Stderr).await?;
            write_message(&mut stderr, &StderrMessage { id: self.id }).await?;
            read_reply(&mut stderr).await?;

            let (stdout, stdin) = tokio::io::split(stream);
            Ok(SessionIo {
                stdin: Box::new(stdin),
                stdout: Box::new(stdout),
                stderr: Box::new(stderr),
            })
        }
        .await;

        if let Err(e) = &result {
            debug!(id = self.id, error = %e, "session start failed");
            self.inner.finish_session(self.id, RemoteExit::Lost);
        }
        result
    }

    async fn window_change(&self, size: TermSize) -> Result<()> {
        self.inner
            .send_bus(
                BusCommand::Resize,
                &ResizeMessage {
                    id: self.id,
                    cols: size.cols,
                    rows: size.rows,
                },
            )
            .await
    }

    async fn wait(&self) -> RemoteExit {
        self.exit.wait().await
    }

    async fn close(&self) -> Result<()> {
        if self.exit.get().is_some() {
            return Ok(());
        }
        if !self.started.load(Ordering::SeqCst) || self.inner.lost.load(Ordering::SeqCst) {
            self.inner.finish_session(self.id, RemoteExit::Lost);
            return Ok(());
        }
        let res = self
            .inner
            .send_bus(BusCommand::Close, &CloseMessage { id: self.id })
            .await;
        if res.is_err() {
            self.inner.finish_session(self.id, RemoteExit::Lost);
        }
        res
    }
}
