//! Scripted datagram tunnel server.
//!
//! Runs the server side of the stream multiplexer over any byte stream
//! (normally one end of `tokio::io::duplex`) and answers the stream
//! handshakes the way a real remote would, recording what it saw.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

use resh_core::error::Result;
use resh_core::tunnel::codec::{
    decode_body, read_bus, read_command, read_message, write_bus, write_message,
};
use resh_core::tunnel::messages::{
    AcceptMessage, AliveMessage, CloseMessage, DialMessage, ExitMessage, ListenMessage,
    ResizeMessage, StartMessage, StderrMessage,
};
use resh_core::tunnel::{BusCommand, Mux, MuxRole, MuxStream, Reply, StreamKind};

/// How the mock answers.
#[derive(Debug, Clone)]
pub struct MockTunnelConfig {
    /// Reply to every `StartMessage`.
    pub start_reply: Reply,
    /// Reply to every `DialMessage`; dialed streams echo.
    pub dial_reply: Reply,
    /// Echo `alive` back on the bus. Can be flipped later with
    /// [`MockTunnel::set_answer_alive`].
    pub answer_alive: bool,
    /// Written to a session's stdout right after a successful start.
    pub greeting: Vec<u8>,
    /// Echo session stdin to stdout.
    pub echo: bool,
    /// Exit code reported once the session's stdin reaches EOF.
    pub exit_code: i32,
}

impl Default for MockTunnelConfig {
    fn default() -> Self {
        Self {
            start_reply: Reply::Ok,
            dial_reply: Reply::Ok,
            answer_alive: true,
            greeting: Vec::new(),
            echo: true,
            exit_code: 0,
        }
    }
}

#[derive(Debug, Default)]
struct LogInner {
    starts: Vec<StartMessage>,
    resizes: Vec<ResizeMessage>,
    closes: Vec<u64>,
    dials: Vec<DialMessage>,
    listens: Vec<ListenMessage>,
    alive_received: usize,
}

/// What the mock has observed. Clones share the log.
#[derive(Debug, Clone, Default)]
pub struct MockTunnelLog {
    inner: Arc<Mutex<LogInner>>,
}

impl MockTunnelLog {
    fn with<R>(&self, f: impl FnOnce(&mut LogInner) -> R) -> R {
        let mut guard = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn starts(&self) -> Vec<StartMessage> {
        self.with(|l| l.starts.clone())
    }

    pub fn resizes(&self) -> Vec<ResizeMessage> {
        self.with(|l| l.resizes.clone())
    }

    pub fn closes(&self) -> Vec<u64> {
        self.with(|l| l.closes.clone())
    }

    pub fn dials(&self) -> Vec<DialMessage> {
        self.with(|l| l.dials.clone())
    }

    pub fn listens(&self) -> Vec<ListenMessage> {
        self.with(|l| l.listens.clone())
    }

    pub fn alive_received(&self) -> usize {
        self.with(|l| l.alive_received)
    }
}

type BusItem = (BusCommand, serde_json::Value);

/// A running mock server.
pub struct MockTunnel {
    pub log: MockTunnelLog,
    bus_tx: mpsc::UnboundedSender<BusItem>,
    mux: Mux,
    answer_alive: Arc<AtomicBool>,
}

impl MockTunnel {
    /// Serve the tunnel protocol on `conn`.
    pub fn spawn<S>(conn: S, config: MockTunnelConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mux = Mux::new(conn, MuxRole::Server);
        let log = MockTunnelLog::default();
        let (bus_tx, bus_rx) = mpsc::unbounded_channel();
        let bus_rx = Arc::new(Mutex::new(Some(bus_rx)));
        let answer_alive = Arc::new(AtomicBool::new(config.answer_alive));

        let server = Server {
            config: Arc::new(config),
            log: log.clone(),
            bus_tx: bus_tx.clone(),
            bus_rx,
            answer_alive: answer_alive.clone(),
        };
        let accept_mux = mux.clone();
        tokio::spawn(async move {
            while let Ok(stream) = accept_mux.accept().await {
                let server = server.clone();
                tokio::spawn(async move {
                    if let Err(e) = server.handle(stream).await {
                        debug!(error = %e, "mock tunnel stream ended");
                    }
                });
            }
        });

        Self {
            log,
            bus_tx,
            mux,
            answer_alive,
        }
    }

    /// Stop or resume answering keep-alives, as a silent outage would.
    pub fn set_answer_alive(&self, answer: bool) {
        self.answer_alive.store(answer, Ordering::SeqCst);
    }

    /// Push a bus message to the client.
    pub fn send_bus<T: Serialize>(&self, cmd: BusCommand, body: &T) {
        if let Ok(value) = serde_json::to_value(body) {
            let _ = self.bus_tx.send((cmd, value));
        }
    }

    /// Drop the whole tunnel, as a network loss would.
    pub fn close(&self) {
        self.mux.close();
    }
}

#[derive(Clone)]
struct Server {
    config: Arc<MockTunnelConfig>,
    log: MockTunnelLog,
    bus_tx: mpsc::UnboundedSender<BusItem>,
    bus_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<BusItem>>>>,
    answer_alive: Arc<AtomicBool>,
}

impl Server {
    async fn handle(&self, mut stream: MuxStream) -> Result<()> {
        let kind: StreamKind = read_command(&mut stream).await?.parse()?;
        write_message(&mut stream, &Reply::Ok).await?;
        match kind {
            StreamKind::Bus => self.bus(stream).await,
            StreamKind::Session => self.session(stream).await,
            StreamKind::Stderr => {
                let _msg: StderrMessage = read_message(&mut stream).await?;
                write_message(&mut stream, &Reply::Ok).await?;
                stream.shutdown().await?;
                Ok(())
            }
            StreamKind::Dial => {
                let msg: DialMessage = read_message(&mut stream).await?;
                self.log.with(|l| l.dials.push(msg));
                write_message(&mut stream, &self.config.dial_reply).await?;
                if self.config.dial_reply == Reply::Ok {
                    echo(stream).await?;
                }
                Ok(())
            }
            StreamKind::Listen => {
                let msg: ListenMessage = read_message(&mut stream).await?;
                self.log.with(|l| l.listens.push(msg));
                write_message(&mut stream, &Reply::Ok).await?;
                write_message(&mut stream, &AcceptMessage { id: 1 }).await?;
                let mut sink = Vec::new();
                let _ = stream.read_to_end(&mut sink).await;
                Ok(())
            }
            StreamKind::Accept => {
                let _msg: AcceptMessage = read_message(&mut stream).await?;
                write_message(&mut stream, &Reply::Ok).await?;
                echo(stream).await
            }
        }
    }

    async fn bus(&self, stream: MuxStream) -> Result<()> {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let rx = self.bus_rx.lock().ok().and_then(|mut g| g.take());
        if let Some(mut rx) = rx {
            tokio::spawn(async move {
                while let Some((cmd, body)) = rx.recv().await {
                    if write_bus(&mut writer, cmd, &body).await.is_err() {
                        break;
                    }
                }
            });
        }

        loop {
            let (cmd, body) = read_bus(&mut reader).await?;
            match cmd {
                BusCommand::Alive => {
                    let alive: AliveMessage = decode_body(&body)?;
                    self.log.with(|l| l.alive_received += 1);
                    if self.answer_alive.load(Ordering::SeqCst)
                        && let Ok(value) = serde_json::to_value(alive)
                    {
                        let _ = self.bus_tx.send((BusCommand::Alive, value));
                    }
                }
                BusCommand::Resize => {
                    let msg: ResizeMessage = decode_body(&body)?;
                    self.log.with(|l| l.resizes.push(msg));
                }
                BusCommand::Close => {
                    let msg: CloseMessage = decode_body(&body)?;
                    self.log.with(|l| l.closes.push(msg.id));
                    if let Ok(value) = serde_json::to_value(ExitMessage {
                        id: msg.id,
                        code: 255,
                    }) {
                        let _ = self.bus_tx.send((BusCommand::Exit, value));
                    }
                }
                BusCommand::Exit | BusCommand::Error => {}
            }
        }
    }

    async fn session(&self, mut stream: MuxStream) -> Result<()> {
        let start: StartMessage = read_message(&mut stream).await?;
        let id = start.id;
        self.log.with(|l| l.starts.push(start));
        write_message(&mut stream, &self.config.start_reply).await?;
        if self.config.start_reply != Reply::Ok {
            return Ok(());
        }
        if !self.config.greeting.is_empty() {
            stream.write_all(&self.config.greeting).await?;
        }

        let mut buf = [0u8; 4096];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            if self.config.echo {
                stream.write_all(&buf[..n]).await?;
            }
        }
        stream.shutdown().await?;
        if let Ok(value) = serde_json::to_value(ExitMessage {
            id,
            code: self.config.exit_code,
        }) {
            let _ = self.bus_tx.send((BusCommand::Exit, value));
        }
        Ok(())
    }
}

async fn echo(stream: MuxStream) -> Result<()> {
    let (mut r, mut w) = tokio::io::split(stream);
    tokio::io::copy(&mut r, &mut w).await?;
    w.shutdown().await?;
    Ok(())
}
