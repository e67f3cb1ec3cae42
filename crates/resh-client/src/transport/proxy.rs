//! ControlMaster proxy transport.
//!
//! The master's socket carries plaintext SSH packets once the mux proxy
//! handshake is done; the connection layer in resh-core runs channels on
//! top of them.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use resh_core::constants::IO_BUFFER_SIZE;
use resh_core::packet::PacketTransport;
use resh_core::sshconn::{
    Channel, ChannelEvent, ChannelEvents, ChannelHandle, ConnectionLayer, ForwardedChannel,
};
use resh_core::{Error, Result};

use super::channel_io::{ExitCell, OutputSinks, session_pipes};
use super::{
    BoxedStream, ListenAddr, RemoteExit, RemoteListener, RemoteSession, SessionIo, SessionOptions,
    StartRequest, Transport, TransportKind,
};
use crate::terminal::TermSize;

/// Transport sharing an existing OpenSSH master connection.
#[derive(Clone)]
pub struct ProxyTransport {
    layer: ConnectionLayer,
    forwarded: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<ForwardedChannel>>>,
}

impl std::fmt::Debug for ProxyTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyTransport")
            .field("closed", &self.layer.is_closed())
            .finish_non_exhaustive()
    }
}

impl ProxyTransport {
    /// Connect to the master at `socket` and switch it to proxy mode.
    pub async fn connect(socket: &Path) -> Result<Self> {
        let transport = resh_control::connect_proxy(socket).await?;
        debug!(socket = %socket.display(), "control master proxy ready");
        Ok(Self::from_packets(Arc::new(transport)))
    }

    /// Run over any packet transport.
    pub fn from_packets(transport: Arc<dyn PacketTransport>) -> Self {
        let layer = ConnectionLayer::new(transport);
        let forwarded = layer.forwarded_channels();
        Self {
            layer,
            forwarded: Arc::new(tokio::sync::Mutex::new(forwarded)),
        }
    }
}

#[async_trait]
impl Transport for ProxyTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::ControlMaster
    }

    async fn new_session(&self, options: SessionOptions) -> Result<Arc<dyn RemoteSession>> {
        let channel = self.layer.open_session().await?;
        let handle = channel.handle().clone();
        if let Some(pty) = &options.pty {
            handle
                .request_pty(&pty.term, pty.size.cols.into(), pty.size.rows.into())
                .await?;
        }
        for (name, value) in &options.env {
            handle.set_env(name, value).await?;
        }
        Ok(Arc::new(ProxySession {
            handle,
            pending: Mutex::new(Some(channel)),
            exit: ExitCell::new(),
            started: AtomicBool::new(false),
        }))
    }

    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream> {
        let channel = self.layer.open_direct_tcpip(host, port.into()).await?;
        Ok(Box::new(bridge(channel)))
    }

    async fn listen(&self, addr: ListenAddr) -> Result<Box<dyn RemoteListener>> {
        match &addr {
            ListenAddr::Tcp { host, port } => {
                self.layer.tcpip_forward(host, (*port).into()).await?;
            }
            ListenAddr::Unix(path) => {
                self.layer
                    .streamlocal_forward(&path.display().to_string())
                    .await?;
            }
        }
        Ok(Box::new(ProxyListener {
            forwarded: self.forwarded.clone(),
        }))
    }

    async fn wait(&self) {
        self.layer.closed().await;
    }

    async fn close(&self) -> Result<()> {
        self.layer.close().await
    }
}

struct ProxyListener {
    forwarded: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<ForwardedChannel>>>,
}

#[async_trait]
impl RemoteListener for ProxyListener {
    async fn accept(&mut self) -> Result<BoxedStream> {
        let fwd = self
            .forwarded
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::ConnectionClosed)?;
        trace!(kind = %fwd.kind, address = %fwd.address, "forwarded connection");
        Ok(Box::new(bridge(fwd.channel)))
    }
}

/// Join a channel to one end of an in-memory pipe.
fn bridge(channel: Channel) -> DuplexStream {
    let (user, ours) = tokio::io::duplex(IO_BUFFER_SIZE * 4);
    let (mut ours_read, mut ours_write) = tokio::io::split(ours);
    let (handle, mut events) = channel.split();

    let sender = handle.clone();
    tokio::spawn(async move {
        pump_stdin(&sender, &mut ours_read).await;
    });
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Data(data) => {
                    if ours_write.write_all(&data).await.is_err() {
                        break;
                    }
                }
                ChannelEvent::Eof | ChannelEvent::Close => break,
                _ => {}
            }
        }
        let _ = ours_write.shutdown().await;
        let _ = handle.close().await;
    });
    user
}

/// Copy from `reader` to the channel, then send EOF.
async fn pump_stdin<R: tokio::io::AsyncRead + Unpin>(handle: &ChannelHandle, reader: &mut R) {
    let mut buf = vec![0u8; IO_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Err(e) = handle.data(&buf[..n]).await {
                    trace!(channel = handle.id(), error = %e, "channel write failed");
                    return;
                }
            }
        }
    }
    let _ = handle.eof().await;
}

/// A session channel on the master connection.
struct ProxySession {
    handle: ChannelHandle,
    pending: Mutex<Option<Channel>>,
    exit: ExitCell,
    started: AtomicBool,
}

#[async_trait]
impl RemoteSession for ProxySession {
    async fn start(&self, request: StartRequest) -> Result<SessionIo> {
        let channel = self
            .pending
            .lock()
            .ok()
            .and_then(|mut p| p.take())
            .ok_or_else(|| Error::Protocol {
                message: "session already started".into(),
            })?;
        let res = match &request {
            StartRequest::Shell => self.handle.request_shell().await,
            StartRequest::Exec(command) => self.handle.exec(command).await,
            StartRequest::Subsystem(name) => self.handle.request_subsystem(name).await,
        };
        if let Err(e) = res {
            let _ = self.handle.close().await;
            self.exit.set(RemoteExit::Lost);
            return Err(e);
        }
        self.started.store(true, Ordering::SeqCst);

        let (io, ends) = session_pipes();
        let mut stdin = ends.stdin;
        let handle = self.handle.clone();
        tokio::spawn(async move {
            pump_stdin(&handle, &mut stdin).await;
        });
        let (_, events) = channel.split();
        tokio::spawn(pump_events(events, ends.sinks, self.exit.clone()));
        Ok(io)
    }

    async fn window_change(&self, size: TermSize) -> Result<()> {
        self.handle
            .window_change(size.cols.into(), size.rows.into())
            .await
    }

    async fn wait(&self) -> RemoteExit {
        self.exit.wait().await
    }

    async fn close(&self) -> Result<()> {
        if !self.started.load(Ordering::SeqCst) {
            self.exit.set(RemoteExit::Lost);
        }
        self.handle.close().await
    }
}

/// Route channel events into the session pipes and record the exit.
async fn pump_events(
    mut events: ChannelEvents,
    mut sinks: OutputSinks,
    exit: ExitCell,
) {
    let mut status = None;
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Data(data) => sinks.stdout(&data).await,
            ChannelEvent::ExtendedData { code: 1, data } => sinks.stderr(&data).await,
            ChannelEvent::ExtendedData { code, .. } => {
                warn!(code, "ignoring unknown extended data");
            }
            ChannelEvent::Eof => sinks.eof().await,
            ChannelEvent::ExitStatus(code) => status = Some(RemoteExit::Status(code as i32)),
            ChannelEvent::ExitSignal { signal, message } => {
                status = Some(RemoteExit::Signal { signal, message });
            }
            ChannelEvent::Close => break,
        }
    }
    sinks.eof().await;
    exit.set(status.unwrap_or(RemoteExit::Lost));
}
