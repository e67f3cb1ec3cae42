//! Datagram tunnel transport.
//!
//! A KCP session carries an AES-CFB encrypted byte stream, which the tunnel
//! mux splits into logical streams. The first stream is the bus; every
//! other stream is a session, a session's stderr, a remote dial, or a
//! remote listener. Keep-alives and exit notices travel on the bus.

mod session;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_kcp::{KcpConfig, KcpNoDelayConfig, KcpStream};
use tracing::{debug, info, trace, warn};

use resh_core::constants::{ALIVE_MISSES_BEFORE_LOST, STREAM_DIAL_TIMEOUT, TUNNEL_KEY_LEN};
use resh_core::tunnel::codec::{
    decode_body, read_bus, read_message, read_reply, write_bus, write_command, write_message,
};
use resh_core::tunnel::messages::{
    AcceptMessage, AliveMessage, DialMessage, ErrorMessage, ExitMessage, ListenMessage,
};
use resh_core::tunnel::{BusCommand, CipherStream, Mux, MuxRole, MuxStream, StreamKind};
use resh_core::{Error, Result};

use super::channel_io::ExitCell;
use super::{
    BoxedStream, ListenAddr, RemoteExit, RemoteListener, RemoteSession, SessionOptions, Transport,
    TransportEvent, TransportKind,
};
pub use session::DatagramSession;

struct Inner {
    mux: Mux,
    bus: tokio::sync::Mutex<WriteHalf<MuxStream>>,
    sessions: Mutex<HashMap<u64, ExitCell>>,
    next_id: AtomicU64,
    active: watch::Sender<usize>,
    last_alive: Mutex<Instant>,
    alive_timeout: Duration,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    closed: AtomicBool,
    lost: AtomicBool,
}

impl Inner {
    /// Send one bus command. Command and body are never interleaved with
    /// another writer's.
    async fn send_bus<T: Serialize>(&self, cmd: BusCommand, body: &T) -> Result<()> {
        let mut bus = self.bus.lock().await;
        let res = write_bus(&mut *bus, cmd, body).await;
        if let Err(e) = &res {
            self.report_lost(e);
        }
        res
    }

    /// Open a logical stream and complete its tag handshake.
    async fn open_stream(&self, kind: StreamKind) -> Result<MuxStream> {
        let opened = tokio::time::timeout(STREAM_DIAL_TIMEOUT, async {
            let mut stream = self.mux.open().await?;
            write_command(&mut stream, kind.as_str()).await?;
            read_reply(&mut stream).await?;
            Ok::<_, Error>(stream)
        })
        .await
        .map_err(|_| Error::Timeout)?;
        if let Err(e) = &opened {
            self.report_lost(e);
        }
        trace!(kind = kind.as_str(), ok = opened.is_ok(), "tunnel stream opened");
        opened
    }

    fn report_lost(&self, err: &Error) {
        if !matches!(err.root(), Error::Io(_) | Error::ConnectionClosed) {
            return;
        }
        self.mark_lost(err.to_string());
    }

    /// Flag the tunnel as lost. Only the first call per outage emits.
    fn mark_lost(&self, reason: String) {
        if self.closed.load(Ordering::SeqCst) || self.lost.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(%reason, "tunnel connection lost");
        let _ = self.events_tx.send(TransportEvent::ConnectionLost(reason));
    }

    fn register_session(&self) -> (u64, ExitCell) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let exit = ExitCell::new();
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.insert(id, exit.clone());
        }
        self.active.send_modify(|n| *n += 1);
        debug!(id, "tunnel session registered");
        (id, exit)
    }

    /// Remove a session and resolve its waiters. Unknown ids are ignored.
    fn finish_session(&self, id: u64, exit: RemoteExit) {
        let slot = self.sessions.lock().ok().and_then(|mut s| s.remove(&id));
        let Some(cell) = slot else {
            debug!(id, "exit for unknown session");
            return;
        };
        debug!(id, ?exit, "tunnel session finished");
        cell.set(exit);
        self.active.send_modify(|n| *n = n.saturating_sub(1));
    }

    /// Record an `alive` reply. The first one after an outage reports the
    /// tunnel as back.
    fn mark_alive(&self) {
        if let Ok(mut last) = self.last_alive.lock() {
            *last = Instant::now();
        }
        if self.lost.swap(false, Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst) {
            info!("tunnel connection restored");
            let _ = self.events_tx.send(TransportEvent::Reconnected);
        }
    }

    fn since_alive(&self) -> Duration {
        self.last_alive
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }
}

/// Transport over the datagram tunnel.
#[derive(Clone)]
pub struct DatagramTransport {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DatagramTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramTransport")
            .field("alive_timeout", &self.inner.alive_timeout)
            .finish_non_exhaustive()
    }
}

impl DatagramTransport {
    /// Dial the tunnel server over KCP and set up encryption.
    pub async fn connect(
        addr: SocketAddr,
        key: &[u8; TUNNEL_KEY_LEN],
        alive_timeout: Duration,
    ) -> Result<Self> {
        let config = KcpConfig {
            nodelay: KcpNoDelayConfig::fastest(),
            stream: true,
            ..Default::default()
        };
        info!(%addr, "dialing datagram tunnel");
        let stream = tokio::time::timeout(STREAM_DIAL_TIMEOUT, KcpStream::connect(&config, addr))
            .await
            .map_err(|_| Error::TransportHandshake {
                message: format!("dial {} timed out", addr),
            })?
            .map_err(|e| Error::TransportHandshake {
                message: format!("dial {} failed: {}", addr, e),
            })?;
        let conn = tokio::time::timeout(STREAM_DIAL_TIMEOUT, CipherStream::establish(stream, key))
            .await
            .map_err(|_| Error::TransportHandshake {
                message: "tunnel key exchange timed out".into(),
            })??;
        Self::from_stream(conn, alive_timeout).await
    }

    /// Run the tunnel protocol over an established byte stream.
    pub async fn from_stream<S>(conn: S, alive_timeout: Duration) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mux = Mux::new(conn, MuxRole::Client);
        let bus = tokio::time::timeout(STREAM_DIAL_TIMEOUT, async {
            let mut bus = mux.open().await?;
            write_command(&mut bus, StreamKind::Bus.as_str()).await?;
            read_reply(&mut bus).await?;
            Ok::<_, Error>(bus)
        })
        .await
        .map_err(|_| Error::TransportHandshake {
            message: "bus handshake timed out".into(),
        })?
        .map_err(|e| match e {
            Error::RemoteExec { message } => Error::TransportHandshake { message },
            other => other,
        })?;
        let (reader, writer) = tokio::io::split(bus);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (active, _) = watch::channel(0);
        let inner = Arc::new(Inner {
            mux,
            bus: tokio::sync::Mutex::new(writer),
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            active,
            last_alive: Mutex::new(Instant::now()),
            alive_timeout,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            closed: AtomicBool::new(false),
            lost: AtomicBool::new(false),
        });

        tokio::spawn(bus_reader(inner.clone(), reader));
        tokio::spawn(keep_alive(inner.clone()));
        debug!(?alive_timeout, "datagram tunnel ready");
        Ok(Self { inner })
    }

    /// Number of sessions that have not exited yet.
    pub fn active_sessions(&self) -> usize {
        *self.inner.active.borrow()
    }
}

async fn bus_reader(inner: Arc<Inner>, mut reader: ReadHalf<MuxStream>) {
    loop {
        let (cmd, body) = match read_bus(&mut reader).await {
            Ok(item) => item,
            Err(e) => {
                inner.report_lost(&e);
                break;
            }
        };
        match cmd {
            BusCommand::Alive => {
                trace!("alive received");
                inner.mark_alive();
            }
            BusCommand::Exit => match decode_body::<ExitMessage>(&body) {
                Ok(msg) => inner.finish_session(msg.id, RemoteExit::Status(msg.code)),
                Err(e) => warn!(error = %e, "bad exit message"),
            },
            BusCommand::Error => match decode_body::<ErrorMessage>(&body) {
                Ok(msg) => warn!(message = %msg.msg, "tunnel server error"),
                Err(e) => warn!(error = %e, "bad error message"),
            },
            BusCommand::Close | BusCommand::Resize => {
                debug!(cmd = cmd.as_str(), "ignoring client-only bus command");
            }
        }
    }
    debug!("bus reader finished");
}

/// Send `alive` every tenth of the timeout, outages included, so a
/// returning link is noticed by its first reply.
async fn keep_alive(inner: Arc<Inner>) {
    let tick = (inner.alive_timeout / 10).max(Duration::from_millis(10));
    let lost_after = tick * ALIVE_MISSES_BEFORE_LOST;
    loop {
        tokio::time::sleep(tick).await;
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        let silent = inner.since_alive();
        if silent > inner.alive_timeout {
            warn!(timeout = ?inner.alive_timeout, "no alive from tunnel server");
            let _ = inner.events_tx.send(TransportEvent::AliveTimeout);
            break;
        }
        let was_lost = inner.lost.load(Ordering::SeqCst);
        if !was_lost && silent > lost_after {
            inner.mark_lost(format!("no reply from tunnel server for {} ms", silent.as_millis()));
        }

        let time = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        let sent = inner.send_bus(BusCommand::Alive, &AliveMessage { time }).await;
        if let Err(e) = &sent {
            debug!(error = %e, "sending alive failed");
        }

        // each unanswered interval of an outage is one failed attempt
        if was_lost && inner.lost.load(Ordering::SeqCst) {
            let error = match sent {
                Err(e) => e.to_string(),
                Ok(()) => format!("still no reply after {} s", silent.as_secs()),
            };
            let _ = inner.events_tx.send(TransportEvent::ReconnectError(error));
        }
    }
    debug!("keep-alive finished");
}

fn format_addr(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[async_trait]
impl Transport for DatagramTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }

    async fn new_session(&self, options: SessionOptions) -> Result<Arc<dyn RemoteSession>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        let (id, exit) = self.inner.register_session();
        Ok(Arc::new(DatagramSession::new(
            self.inner.clone(),
            id,
            options,
            exit,
        )))
    }

    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream> {
        let mut stream = self.inner.open_stream(StreamKind::Dial).await?;
        let msg = DialMessage {
            network: "tcp".into(),
            addr: format_addr(host, port),
            timeout: STREAM_DIAL_TIMEOUT.as_millis() as u64,
        };
        write_message(&mut stream, &msg).await?;
        read_reply(&mut stream).await?;
        debug!(addr = %msg.addr, "remote dial established");
        Ok(Box::new(stream))
    }

    async fn listen(&self, addr: ListenAddr) -> Result<Box<dyn RemoteListener>> {
        let mut stream = self.inner.open_stream(StreamKind::Listen).await?;
        write_message(
            &mut stream,
            &ListenMessage {
                network: addr.network().into(),
                addr: addr.address(),
            },
        )
        .await?;
        read_reply(&mut stream).await?;
        debug!(addr = %addr.address(), "remote listener open");
        Ok(Box::new(DatagramListener {
            inner: self.inner.clone(),
            announcements: stream,
        }))
    }

    async fn wait(&self) {
        let mut rx = self.inner.active.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("closing datagram tunnel");
        self.inner.mux.close();
        Ok(())
    }

    fn events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.inner.events_rx.lock().ok().and_then(|mut rx| rx.take())
    }
}

/// Remote listener whose connections are claimed on `accept` streams.
struct DatagramListener {
    inner: Arc<Inner>,
    announcements: MuxStream,
}

#[async_trait]
impl RemoteListener for DatagramListener {
    async fn accept(&mut self) -> Result<BoxedStream> {
        let announced: AcceptMessage = read_message(&mut self.announcements).await?;
        let mut stream = self.inner.open_stream(StreamKind::Accept).await?;
        write_message(&mut stream, &announced).await?;
        read_reply(&mut stream).await?;
        trace!(id = announced.id, "remote connection accepted");
        Ok(Box::new(stream))
    }
}
