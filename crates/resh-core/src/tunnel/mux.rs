//! Stream multiplexer for the tunnel.
//!
//! Frames are `ver u8 | cmd u8 | len u16 LE | sid u32 LE | payload`.
//! The client allocates odd stream ids and the server even ones. Each
//! logical stream is handed to the caller as one end of an in-memory
//! duplex pipe; two pump tasks move bytes between the pipe and the
//! shared connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::constants::MAX_MUX_FRAME;
use crate::error::{Error, Result};

/// Protocol version byte.
pub const MUX_VERSION: u8 = 1;

/// Frame header length.
pub const MUX_HEADER_LEN: usize = 8;

/// Capacity of each stream's in-memory pipe.
const STREAM_PIPE_SIZE: usize = 256 * 1024;

/// A logical stream as seen by the caller.
pub type MuxStream = DuplexStream;

/// Frame command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cmd {
    Syn = 0,
    Fin = 1,
    Psh = 2,
    Nop = 3,
}

impl TryFrom<u8> for Cmd {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Cmd::Syn),
            1 => Ok(Cmd::Fin),
            2 => Ok(Cmd::Psh),
            3 => Ok(Cmd::Nop),
            other => Err(Error::Codec {
                message: format!("unknown mux command {}", other),
            }),
        }
    }
}

/// One mux frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub cmd: Cmd,
    pub sid: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(cmd: Cmd, sid: u32) -> Self {
        Self {
            cmd,
            sid,
            payload: Bytes::new(),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(MUX_HEADER_LEN + self.payload.len());
        buf.put_u8(MUX_VERSION);
        buf.put_u8(self.cmd as u8);
        buf.put_u16_le(self.payload.len() as u16);
        buf.put_u32_le(self.sid);
        buf.put_slice(&self.payload);
    }

    /// Decode one frame; `Ok(None)` if more bytes are needed.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>> {
        if buf.len() < MUX_HEADER_LEN {
            return Ok(None);
        }
        if buf[0] != MUX_VERSION {
            return Err(Error::Codec {
                message: format!("unsupported mux version {}", buf[0]),
            });
        }
        let cmd = Cmd::try_from(buf[1])?;
        let len = u16::from_le_bytes([buf[2], buf[3]]) as usize;
        if buf.len() < MUX_HEADER_LEN + len {
            return Ok(None);
        }
        let sid = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        buf.advance(MUX_HEADER_LEN);
        let payload = buf.split_to(len).freeze();
        Ok(Some(Self { cmd, sid, payload }))
    }
}

/// Which side of the tunnel this mux runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxRole {
    Client,
    Server,
}

struct Shared {
    out_tx: mpsc::Sender<Frame>,
    streams: Mutex<HashMap<u32, mpsc::UnboundedSender<Bytes>>>,
    next_id: AtomicU32,
    accept_tx: mpsc::UnboundedSender<MuxStream>,
    closed: watch::Sender<bool>,
}

impl Shared {
    fn close(&self) {
        let _ = self.closed.send(true);
        if let Ok(mut streams) = self.streams.lock() {
            streams.clear();
        }
    }
}

/// Multiplexed connection. Cloning shares the connection.
#[derive(Clone)]
pub struct Mux {
    shared: Arc<Shared>,
    accept_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<MuxStream>>>,
}

impl std::fmt::Debug for Mux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mux")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Mux {
    /// Run the mux over `conn`, spawning its reader and writer tasks.
    pub fn new<S>(conn: S, role: MuxRole) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(conn);
        let (out_tx, out_rx) = mpsc::channel(256);
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let first_id = match role {
            MuxRole::Client => 1,
            MuxRole::Server => 2,
        };
        let shared = Arc::new(Shared {
            out_tx,
            streams: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(first_id),
            accept_tx,
            closed,
        });

        tokio::spawn(write_loop(shared.clone(), write_half, out_rx));
        tokio::spawn(read_loop(shared.clone(), read_half));

        Self {
            shared,
            accept_rx: Arc::new(tokio::sync::Mutex::new(accept_rx)),
        }
    }

    /// Open a new logical stream.
    pub async fn open(&self) -> Result<MuxStream> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let sid = self.shared.next_id.fetch_add(2, Ordering::Relaxed);
        let stream = attach_stream(&self.shared, sid);
        self.shared
            .out_tx
            .send(Frame::new(Cmd::Syn, sid))
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        trace!(sid, "mux stream opened");
        Ok(stream)
    }

    /// Wait for a stream opened by the peer.
    pub async fn accept(&self) -> Result<MuxStream> {
        self.accept_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::ConnectionClosed)
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Resolves once the underlying connection failed or was closed.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Tear down every stream.
    pub fn close(&self) {
        self.shared.close();
    }
}

/// Register `sid` and start the pumps for it.
fn attach_stream(shared: &Arc<Shared>, sid: u32) -> MuxStream {
    let (user_side, mux_side) = tokio::io::duplex(STREAM_PIPE_SIZE);
    let (in_tx, mut in_rx) = mpsc::unbounded_channel::<Bytes>();
    if let Ok(mut streams) = shared.streams.lock() {
        streams.insert(sid, in_tx);
    }
    let (mut pipe_read, mut pipe_write) = tokio::io::split(mux_side);

    // peer -> caller
    tokio::spawn(async move {
        while let Some(data) = in_rx.recv().await {
            if pipe_write.write_all(&data).await.is_err() {
                break;
            }
        }
        let _ = pipe_write.shutdown().await;
    });

    // caller -> peer
    let out = shared.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_MUX_FRAME];
        let mut closed_rx = out.closed.subscribe();
        loop {
            let n = tokio::select! {
                r = pipe_read.read(&mut buf) => match r {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                },
                _ = closed_rx.wait_for(|c| *c) => return,
            };
            let frame = Frame {
                cmd: Cmd::Psh,
                sid,
                payload: Bytes::copy_from_slice(&buf[..n]),
            };
            if out.out_tx.send(frame).await.is_err() {
                return;
            }
        }
        let _ = out.out_tx.send(Frame::new(Cmd::Fin, sid)).await;
        trace!(sid, "mux stream write side finished");
    });

    user_side
}

async fn write_loop<W: AsyncWrite + Unpin>(
    shared: Arc<Shared>,
    mut w: W,
    mut out_rx: mpsc::Receiver<Frame>,
) {
    let mut buf = BytesMut::with_capacity(64 * 1024);
    let mut closed_rx = shared.closed.subscribe();
    loop {
        let frame = tokio::select! {
            f = out_rx.recv() => match f {
                Some(f) => f,
                None => break,
            },
            _ = closed_rx.wait_for(|c| *c) => break,
        };
        buf.clear();
        frame.encode(&mut buf);
        while let Ok(next) = out_rx.try_recv() {
            next.encode(&mut buf);
            if buf.len() >= 64 * 1024 {
                break;
            }
        }
        if let Err(e) = async {
            w.write_all(&buf).await?;
            w.flush().await
        }
        .await
        {
            debug!(error = %e, "mux write failed");
            break;
        }
    }
    let _ = w.shutdown().await;
    shared.close();
}

async fn read_loop<R: AsyncRead + Unpin>(shared: Arc<Shared>, mut r: R) {
    let mut buf = BytesMut::with_capacity(64 * 1024);
    'outer: loop {
        loop {
            match Frame::decode(&mut buf) {
                Ok(Some(frame)) => handle_frame(&shared, frame),
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "mux decode failed");
                    break 'outer;
                }
            }
        }
        match r.read_buf(&mut buf).await {
            Ok(0) => {
                debug!("mux connection closed by peer");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "mux read failed");
                break;
            }
        }
    }
    shared.close();
}

fn handle_frame(shared: &Arc<Shared>, frame: Frame) {
    match frame.cmd {
        Cmd::Syn => {
            let stream = attach_stream(shared, frame.sid);
            trace!(sid = frame.sid, "mux stream accepted");
            let _ = shared.accept_tx.send(stream);
        }
        Cmd::Psh => {
            let tx = shared
                .streams
                .lock()
                .ok()
                .and_then(|s| s.get(&frame.sid).cloned());
            if let Some(tx) = tx
                && tx.send(frame.payload).is_err()
                && let Ok(mut streams) = shared.streams.lock()
            {
                streams.remove(&frame.sid);
            }
        }
        Cmd::Fin => {
            if let Ok(mut streams) = shared.streams.lock() {
                streams.remove(&frame.sid);
            }
        }
        Cmd::Nop => {}
    }
}
