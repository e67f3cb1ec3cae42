//! Transport adapters.
//!
//! Every way of reaching the remote host (direct TCP via russh, a shared
//! OpenSSH ControlMaster connection, the reconnectable datagram tunnel)
//! exposes the same [`Transport`] contract. Sessions opened on any of them
//! are driven through [`RemoteSession`] and handed to the I/O pipeline as
//! plain async byte streams.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use resh_core::Result;

use crate::terminal::TermSize;

pub mod datagram;
pub mod hostkey;
pub mod proxy;
pub mod session;
pub mod tcp;

mod channel_io;

pub use session::{ForcedExit, SessionHandle, SessionOutcome};

/// Bidirectional byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn AsyncStream>;
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    ControlMaster,
    Datagram,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::ControlMaster => "control-master",
            TransportKind::Datagram => "datagram",
        }
    }
}

/// Pseudo-terminal parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub size: TermSize,
}

/// Settings applied before the session starts.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub pty: Option<PtyRequest>,
    pub env: BTreeMap<String, String>,
}

/// What a session runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartRequest {
    Shell,
    Exec(String),
    Subsystem(String),
}

/// The three server-side byte streams of a started session.
pub struct SessionIo {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: BoxedReader,
}

impl std::fmt::Debug for SessionIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionIo").finish_non_exhaustive()
    }
}

/// How the remote side of a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteExit {
    Status(i32),
    Signal { signal: String, message: String },
    /// The channel closed without an exit status.
    Lost,
}

impl RemoteExit {
    /// Process exit code, following OpenSSH (255 when no status arrived).
    pub fn code(&self) -> i32 {
        match self {
            RemoteExit::Status(code) => *code,
            RemoteExit::Signal { .. } | RemoteExit::Lost => 255,
        }
    }
}

/// One logical remote session.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Start the shell, command or subsystem and return its streams.
    async fn start(&self, request: StartRequest) -> Result<SessionIo>;

    async fn window_change(&self, size: TermSize) -> Result<()>;

    /// Ask the remote program to repaint by jiggling the window size.
    async fn redraw(&self, size: TermSize) -> Result<()> {
        let shrunk = TermSize {
            cols: size.cols,
            rows: size.rows.saturating_sub(1).max(1),
        };
        self.window_change(shrunk).await?;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        self.window_change(size).await
    }

    /// Resolves once the remote side has exited.
    async fn wait(&self) -> RemoteExit;

    async fn close(&self) -> Result<()>;
}

/// Where a remote listener binds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl ListenAddr {
    pub fn network(&self) -> &'static str {
        match self {
            ListenAddr::Tcp { .. } => "tcp",
            ListenAddr::Unix(_) => "unix",
        }
    }

    pub fn address(&self) -> String {
        match self {
            ListenAddr::Tcp { host, port } => format!("{}:{}", host, port),
            ListenAddr::Unix(path) => path.display().to_string(),
        }
    }
}

/// A listener on the remote host.
#[async_trait]
pub trait RemoteListener: Send {
    async fn accept(&mut self) -> Result<BoxedStream>;
}

/// Connection health notifications. Only the datagram tunnel emits them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ConnectionLost(String),
    ReconnectError(String),
    Reconnected,
    AliveTimeout,
}

/// A connection to the remote host.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn new_session(&self, options: SessionOptions) -> Result<Arc<dyn RemoteSession>>;

    /// Open a TCP connection from the remote host.
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream>;

    async fn listen(&self, addr: ListenAddr) -> Result<Box<dyn RemoteListener>>;

    /// Resolves when the connection is gone or, for the datagram tunnel,
    /// every session has exited.
    async fn wait(&self);

    async fn close(&self) -> Result<()>;

    /// Take the event stream. Returns `None` for transports that cannot
    /// notice a lost connection, or when already taken.
    fn events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        None
    }
}
