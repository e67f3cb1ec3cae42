//! SSH connection protocol over a [`PacketTransport`].
//!
//! Implements the channel layer of RFC 4254 for a client that is already
//! authenticated: session channels with their requests, direct and
//! forwarded TCP/streamlocal channels, global requests, and per-channel
//! flow control. Key exchange and user authentication are not handled
//! here; the packet transport hands over plaintext packets.

pub mod wire;


use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::packet::PacketTransport;
use wire::*;

/// Receive window we advertise per channel.
const LOCAL_WINDOW: u32 = 2 * 1024 * 1024;

/// Largest data packet we accept.
const LOCAL_MAX_PACKET: u32 = 32 * 1024;

/// Something that happened on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Data(Bytes),
    ExtendedData { code: u32, data: Bytes },
    Eof,
    ExitStatus(u32),
    ExitSignal { signal: String, message: String },
    Close,
}

/// Send-side state shared between the reader task and channel handles.
#[derive(Debug, Default)]
struct SendState {
    window: Mutex<u32>,
    notify: Notify,
    closed: AtomicBool,
    close_sent: AtomicBool,
}

impl SendState {
    fn add_window(&self, n: u32) {
        if let Ok(mut w) = self.window.lock() {
            *w = w.saturating_add(n);
        }
        self.notify.notify_waiters();
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

struct OpenConfirm {
    remote_id: u32,
    window: u32,
    max_packet: u32,
}

struct ChannelSlot {
    remote_id: u32,
    open_tx: Option<oneshot::Sender<Result<OpenConfirm>>>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    replies: VecDeque<oneshot::Sender<bool>>,
    send: Arc<SendState>,
}

/// A channel opened by the server in response to a remote forward.
pub struct ForwardedChannel {
    pub channel: Channel,
    /// `forwarded-tcpip` or `forwarded-streamlocal@openssh.com`.
    pub kind: String,
    /// Listening address or socket path the connection arrived on.
    pub address: String,
    pub port: u32,
    pub originator: String,
    pub originator_port: u32,
}

struct Shared {
    transport: Arc<dyn PacketTransport>,
    write_lock: tokio::sync::Mutex<()>,
    channels: Mutex<HashMap<u32, ChannelSlot>>,
    next_id: AtomicU32,
    global_replies: Mutex<VecDeque<oneshot::Sender<Option<Bytes>>>>,
    forwarded: Mutex<Option<mpsc::UnboundedSender<ForwardedChannel>>>,
    closed: watch::Sender<bool>,
}

impl Shared {
    async fn send(&self, packet: Bytes) -> Result<()> {
        if *self.closed.borrow() {
            return Err(Error::ConnectionClosed);
        }
        let _guard = self.write_lock.lock().await;
        self.transport.write_packet(&packet).await
    }

    fn alloc_slot(
        &self,
        remote_id: u32,
        open_tx: Option<oneshot::Sender<Result<OpenConfirm>>>,
        initial_window: u32,
    ) -> (u32, Arc<SendState>, mpsc::UnboundedReceiver<ChannelEvent>) {
        let local_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let send = Arc::new(SendState {
            window: Mutex::new(initial_window),
            ..Default::default()
        });
        let slot = ChannelSlot {
            remote_id,
            open_tx,
            events: events_tx,
            replies: VecDeque::new(),
            send: send.clone(),
        };
        if let Ok(mut channels) = self.channels.lock() {
            channels.insert(local_id, slot);
        }
        (local_id, send, events_rx)
    }

    fn remove_slot(&self, local_id: u32) -> Option<ChannelSlot> {
        self.channels.lock().ok()?.remove(&local_id)
    }

    fn with_slot<T>(&self, local_id: u32, f: impl FnOnce(&mut ChannelSlot) -> T) -> Option<T> {
        let mut channels = self.channels.lock().ok()?;
        channels.get_mut(&local_id).map(f)
    }

    fn teardown(&self) {
        let _ = self.closed.send(true);
        let slots: Vec<ChannelSlot> = match self.channels.lock() {
            Ok(mut channels) => channels.drain().map(|(_, s)| s).collect(),
            Err(_) => Vec::new(),
        };
        for mut slot in slots {
            if let Some(tx) = slot.open_tx.take() {
                let _ = tx.send(Err(Error::ConnectionClosed));
            }
            slot.send.mark_closed();
            let _ = slot.events.send(ChannelEvent::Close);
        }
        if let Ok(mut replies) = self.global_replies.lock() {
            replies.clear();
        }
        if let Ok(mut fwd) = self.forwarded.lock() {
            fwd.take();
        }
    }
}

/// Client side of the SSH connection protocol. Cloning is cheap.
#[derive(Clone)]
pub struct ConnectionLayer {
    shared: Arc<Shared>,
}

impl ConnectionLayer {
    /// Start the layer; spawns the packet reader task.
    pub fn new(transport: Arc<dyn PacketTransport>) -> Self {
        let (closed, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            transport,
            write_lock: tokio::sync::Mutex::new(()),
            channels: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(0),
            global_replies: Mutex::new(VecDeque::new()),
            forwarded: Mutex::new(None),
            closed,
        });
        tokio::spawn(read_loop(shared.clone()));
        Self { shared }
    }

    /// Open a `session` channel.
    pub async fn open_session(&self) -> Result<Channel> {
        self.open_channel("session", &[]).await
    }

    /// Open a `direct-tcpip` channel to `host:port` as seen from the server.
    pub async fn open_direct_tcpip(&self, host: &str, port: u32) -> Result<Channel> {
        let extra = PacketWriter::new(0)
            .string(host)
            .u32(port)
            .string("127.0.0.1")
            .u32(0)
            .finish();
        self.open_channel("direct-tcpip", &extra[1..]).await
    }

    /// Open a `direct-streamlocal@openssh.com` channel to a remote UNIX socket.
    pub async fn open_direct_streamlocal(&self, path: &str) -> Result<Channel> {
        let extra = PacketWriter::new(0).string(path).string("").u32(0).finish();
        self.open_channel("direct-streamlocal@openssh.com", &extra[1..])
            .await
    }

    async fn open_channel(&self, kind: &str, extra: &[u8]) -> Result<Channel> {
        let (open_tx, open_rx) = oneshot::channel();
        let (local_id, send, events) = self.shared.alloc_slot(0, Some(open_tx), 0);

        let packet = PacketWriter::new(MSG_CHANNEL_OPEN)
            .string(kind)
            .u32(local_id)
            .u32(LOCAL_WINDOW)
            .u32(LOCAL_MAX_PACKET)
            .raw(extra)
            .finish();
        if let Err(e) = self.shared.send(packet).await {
            self.shared.remove_slot(local_id);
            return Err(e);
        }

        let confirm = match open_rx.await {
            Ok(Ok(confirm)) => confirm,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(Error::ConnectionClosed),
        };
        send.add_window(confirm.window);
        debug!(kind, local_id, remote_id = confirm.remote_id, "channel open");

        Ok(Channel::new(
            ChannelHandle {
                local_id,
                remote_id: confirm.remote_id,
                max_packet: confirm.max_packet.max(1),
                send,
                shared: self.shared.clone(),
            },
            events,
        ))
    }

    async fn global_request(&self, name: &str, payload: &[u8]) -> Result<Option<Bytes>> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut replies) = self.shared.global_replies.lock() {
            replies.push_back(tx);
        }
        let packet = PacketWriter::new(MSG_GLOBAL_REQUEST)
            .string(name)
            .bool(true)
            .raw(payload)
            .finish();
        self.shared.send(packet).await?;
        rx.await.map_err(|_| Error::ConnectionClosed)
    }

    /// Ask the server to listen on `address:port`. Returns the bound port.
    pub async fn tcpip_forward(&self, address: &str, port: u32) -> Result<u32> {
        let payload = PacketWriter::new(0).string(address).u32(port).finish();
        match self.global_request("tcpip-forward", &payload[1..]).await? {
            Some(rest) if port == 0 && rest.len() >= 4 => {
                Ok(u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]))
            }
            Some(_) => Ok(port),
            None => Err(Error::RemoteExec {
                message: format!("remote port forwarding failed for {}:{}", address, port),
            }),
        }
    }

    /// Ask the server to listen on a UNIX socket path.
    pub async fn streamlocal_forward(&self, path: &str) -> Result<()> {
        let payload = PacketWriter::new(0).string(path).finish();
        match self
            .global_request("streamlocal-forward@openssh.com", &payload[1..])
            .await?
        {
            Some(_) => Ok(()),
            None => Err(Error::RemoteExec {
                message: format!("remote socket forwarding failed for {}", path),
            }),
        }
    }

    /// Receiver for channels the server opens for remote forwards.
    ///
    /// Calling this again replaces the previous receiver.
    pub fn forwarded_channels(&self) -> mpsc::UnboundedReceiver<ForwardedChannel> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut fwd) = self.shared.forwarded.lock() {
            *fwd = Some(tx);
        }
        rx
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Resolves once the packet transport is gone.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Close the underlying transport.
    pub async fn close(&self) -> Result<()> {
        self.shared.transport.close().await
    }
}

/// Send side of a channel. Cloning is cheap.
#[derive(Clone)]
pub struct ChannelHandle {
    local_id: u32,
    remote_id: u32,
    max_packet: u32,
    send: Arc<SendState>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("local_id", &self.local_id)
            .field("remote_id", &self.remote_id)
            .finish()
    }
}

impl ChannelHandle {
    pub fn id(&self) -> u32 {
        self.local_id
    }

    async fn request(&self, name: &str, want_reply: bool, payload: &[u8]) -> Result<bool> {
        let reply_rx = if want_reply {
            let (tx, rx) = oneshot::channel();
            self.shared
                .with_slot(self.local_id, |slot| slot.replies.push_back(tx))
                .ok_or(Error::ConnectionClosed)?;
            Some(rx)
        } else {
            None
        };

        let packet = PacketWriter::new(MSG_CHANNEL_REQUEST)
            .u32(self.remote_id)
            .string(name)
            .bool(want_reply)
            .raw(payload)
            .finish();
        self.shared.send(packet).await?;

        match reply_rx {
            Some(rx) => rx.await.map_err(|_| Error::ConnectionClosed),
            None => Ok(true),
        }
    }

    async fn request_or_refuse(&self, name: &str, payload: &[u8], what: &str) -> Result<()> {
        if self.request(name, true, payload).await? {
            Ok(())
        } else {
            Err(Error::RemoteExec {
                message: format!("{} request refused", what),
            })
        }
    }

    pub async fn request_pty(&self, term: &str, cols: u32, rows: u32) -> Result<()> {
        let payload = PacketWriter::new(0)
            .string(term)
            .u32(cols)
            .u32(rows)
            .u32(0)
            .u32(0)
            .string(empty_terminal_modes())
            .finish();
        self.request_or_refuse("pty-req", &payload[1..], "pty").await
    }

    pub async fn set_env(&self, name: &str, value: &str) -> Result<()> {
        let payload = PacketWriter::new(0).string(name).string(value).finish();
        self.request("env", false, &payload[1..]).await.map(|_| ())
    }

    pub async fn request_shell(&self) -> Result<()> {
        self.request_or_refuse("shell", &[], "shell").await
    }

    pub async fn exec(&self, command: &str) -> Result<()> {
        let payload = PacketWriter::new(0).string(command).finish();
        self.request_or_refuse("exec", &payload[1..], "exec").await
    }

    pub async fn request_subsystem(&self, name: &str) -> Result<()> {
        let payload = PacketWriter::new(0).string(name).finish();
        self.request_or_refuse("subsystem", &payload[1..], "subsystem")
            .await
    }

    pub async fn window_change(&self, cols: u32, rows: u32) -> Result<()> {
        let payload = PacketWriter::new(0)
            .u32(cols)
            .u32(rows)
            .u32(0)
            .u32(0)
            .finish();
        self.request("window-change", false, &payload[1..])
            .await
            .map(|_| ())
    }

    /// Send data, waiting for remote window as needed.
    pub async fn data(&self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let n = self.reserve(data.len()).await?;
            let packet = PacketWriter::new(MSG_CHANNEL_DATA)
                .u32(self.remote_id)
                .string(&data[..n])
                .finish();
            self.shared.send(packet).await?;
            data = &data[n..];
        }
        Ok(())
    }

    async fn reserve(&self, wanted: usize) -> Result<usize> {
        loop {
            let notified = self.send.notify.notified();
            if self.send.closed.load(Ordering::SeqCst)
                || self.send.close_sent.load(Ordering::SeqCst)
            {
                return Err(Error::ConnectionClosed);
            }
            if let Ok(mut window) = self.send.window.lock()
                && *window > 0
            {
                let n = (*window as usize).min(self.max_packet as usize).min(wanted);
                *window -= n as u32;
                return Ok(n);
            }
            trace!(channel = self.local_id, "waiting for remote window");
            notified.await;
        }
    }

    async fn adjust_window(&self, n: u32) -> Result<()> {
        if self.send.close_sent.load(Ordering::SeqCst) {
            return Ok(());
        }
        trace!(channel = self.local_id, n, "window adjust");
        let packet = PacketWriter::new(MSG_CHANNEL_WINDOW_ADJUST)
            .u32(self.remote_id)
            .u32(n)
            .finish();
        self.shared.send(packet).await
    }

    pub async fn eof(&self) -> Result<()> {
        let packet = PacketWriter::new(MSG_CHANNEL_EOF)
            .u32(self.remote_id)
            .finish();
        self.shared.send(packet).await
    }

    pub async fn close(&self) -> Result<()> {
        if self.send.close_sent.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.send.notify.notify_waiters();
        let packet = PacketWriter::new(MSG_CHANNEL_CLOSE)
            .u32(self.remote_id)
            .finish();
        self.shared.send(packet).await
    }
}

/// An open channel: send handle plus its event stream.
pub struct Channel {
    events: ChannelEvents,
}

impl Channel {
    fn new(handle: ChannelHandle, rx: mpsc::UnboundedReceiver<ChannelEvent>) -> Self {
        Self {
            events: ChannelEvents {
                rx,
                handle,
                consumed: 0,
            },
        }
    }

    pub fn handle(&self) -> &ChannelHandle {
        &self.events.handle
    }

    /// Next event; `None` after the channel is gone.
    pub async fn wait(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    pub fn split(self) -> (ChannelHandle, ChannelEvents) {
        (self.events.handle.clone(), self.events)
    }
}

/// Receive side of a channel.
///
/// The peer's window only grows back as data is taken from here, so a
/// slow reader holds the peer at [`LOCAL_WINDOW`] unread bytes.
pub struct ChannelEvents {
    rx: mpsc::UnboundedReceiver<ChannelEvent>,
    handle: ChannelHandle,
    consumed: u32,
}

impl ChannelEvents {
    /// Next event; `None` after the channel is gone.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        let event = self.rx.recv().await?;
        if let ChannelEvent::Data(data) | ChannelEvent::ExtendedData { data, .. } = &event {
            self.consumed = self.consumed.saturating_add(data.len() as u32);
            if self.consumed >= LOCAL_WINDOW / 2 {
                let n = std::mem::take(&mut self.consumed);
                if let Err(e) = self.handle.adjust_window(n).await {
                    debug!(channel = self.handle.local_id, error = %e, "window adjust failed");
                }
            }
        }
        Some(event)
    }
}

async fn read_loop(shared: Arc<Shared>) {
    loop {
        let packet = match shared.transport.read_packet().await {
            Ok(Some(p)) => p,
            Ok(None) => {
                debug!("packet transport closed");
                break;
            }
            Err(e) => {
                debug!(error = %e, "packet transport read failed");
                break;
            }
        };
        match dispatch(&shared, packet).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => warn!(error = %e, "malformed packet from server"),
        }
    }
    shared.teardown();
}

/// Handle one packet. Returns `Ok(false)` when the connection should end.
async fn dispatch(shared: &Arc<Shared>, packet: Bytes) -> Result<bool> {
    let (msg, mut r) = PacketReader::new(packet)?;
    match msg {
        MSG_DISCONNECT => {
            let code = r.u32().unwrap_or(0);
            let reason = r.utf8().unwrap_or_default();
            debug!(code, reason, "server disconnected");
            return Ok(false);
        }
        MSG_IGNORE | MSG_DEBUG | MSG_UNIMPLEMENTED => {}
        MSG_GLOBAL_REQUEST => {
            let name = r.utf8()?;
            let want_reply = r.bool()?;
            trace!(name, "global request from server");
            if want_reply {
                shared
                    .send(PacketWriter::new(MSG_REQUEST_FAILURE).finish())
                    .await?;
            }
        }
        MSG_REQUEST_SUCCESS | MSG_REQUEST_FAILURE => {
            let tx = shared.global_replies.lock().ok().and_then(|mut q| q.pop_front());
            if let Some(tx) = tx {
                let reply = (msg == MSG_REQUEST_SUCCESS).then(|| r.rest());
                let _ = tx.send(reply);
            }
        }
        MSG_CHANNEL_OPEN => handle_channel_open(shared, &mut r).await?,
        MSG_CHANNEL_OPEN_CONFIRMATION => {
            let local = r.u32()?;
            let confirm = OpenConfirm {
                remote_id: r.u32()?,
                window: r.u32()?,
                max_packet: r.u32()?,
            };
            shared.with_slot(local, |slot| {
                slot.remote_id = confirm.remote_id;
                if let Some(tx) = slot.open_tx.take() {
                    let _ = tx.send(Ok(confirm));
                }
            });
        }
        MSG_CHANNEL_OPEN_FAILURE => {
            let local = r.u32()?;
            let code = r.u32()?;
            let description = r.utf8().unwrap_or_default();
            if let Some(mut slot) = shared.remove_slot(local)
                && let Some(tx) = slot.open_tx.take()
            {
                let _ = tx.send(Err(Error::RemoteExec {
                    message: format!("channel open failed ({}): {}", code, description),
                }));
            }
        }
        MSG_CHANNEL_WINDOW_ADJUST => {
            let local = r.u32()?;
            let bytes = r.u32()?;
            shared.with_slot(local, |slot| slot.send.add_window(bytes));
        }
        MSG_CHANNEL_DATA | MSG_CHANNEL_EXTENDED_DATA => {
            let local = r.u32()?;
            let code = if msg == MSG_CHANNEL_EXTENDED_DATA {
                Some(r.u32()?)
            } else {
                None
            };
            let data = r.string()?;
            let event = match code {
                Some(code) => ChannelEvent::ExtendedData { code, data },
                None => ChannelEvent::Data(data),
            };
            shared.with_slot(local, |slot| {
                let _ = slot.events.send(event);
            });
        }
        MSG_CHANNEL_EOF => {
            let local = r.u32()?;
            shared.with_slot(local, |slot| {
                let _ = slot.events.send(ChannelEvent::Eof);
            });
        }
        MSG_CHANNEL_CLOSE => {
            let local = r.u32()?;
            if let Some(slot) = shared.remove_slot(local) {
                slot.send.mark_closed();
                let _ = slot.events.send(ChannelEvent::Close);
                if !slot.send.close_sent.swap(true, Ordering::SeqCst) {
                    let packet = PacketWriter::new(MSG_CHANNEL_CLOSE)
                        .u32(slot.remote_id)
                        .finish();
                    shared.send(packet).await?;
                }
            }
        }
        MSG_CHANNEL_REQUEST => {
            let local = r.u32()?;
            let name = r.utf8()?;
            let want_reply = r.bool()?;
            let event = match name.as_str() {
                "exit-status" => Some(ChannelEvent::ExitStatus(r.u32()?)),
                "exit-signal" => {
                    let signal = r.utf8()?;
                    let _core = r.bool()?;
                    let message = r.utf8().unwrap_or_default();
                    Some(ChannelEvent::ExitSignal { signal, message })
                }
                _ => None,
            };
            let remote = shared.with_slot(local, |slot| {
                if let Some(event) = event {
                    let _ = slot.events.send(event);
                }
                slot.remote_id
            });
            if want_reply && let Some(remote) = remote {
                let packet = PacketWriter::new(MSG_CHANNEL_FAILURE).u32(remote).finish();
                shared.send(packet).await?;
            }
        }
        MSG_CHANNEL_SUCCESS | MSG_CHANNEL_FAILURE => {
            let local = r.u32()?;
            let tx = shared
                .with_slot(local, |slot| slot.replies.pop_front())
                .flatten();
            if let Some(tx) = tx {
                let _ = tx.send(msg == MSG_CHANNEL_SUCCESS);
            }
        }
        other => {
            debug!(msg = other, "ignoring unexpected message");
        }
    }
    Ok(true)
}

async fn handle_channel_open(shared: &Arc<Shared>, r: &mut PacketReader) -> Result<()> {
    let kind = r.utf8()?;
    let sender = r.u32()?;
    let window = r.u32()?;
    let max_packet = r.u32()?;

    let (address, port, originator, originator_port) = match kind.as_str() {
        "forwarded-tcpip" => (r.utf8()?, r.u32()?, r.utf8()?, r.u32()?),
        "forwarded-streamlocal@openssh.com" => (r.utf8()?, 0, String::new(), 0),
        _ => (String::new(), 0, String::new(), 0),
    };

    let forwarded = shared.forwarded.lock().ok().and_then(|f| f.clone());
    let accepted = matches!(
        kind.as_str(),
        "forwarded-tcpip" | "forwarded-streamlocal@openssh.com"
    );
    let Some(forwarded) = forwarded.filter(|_| accepted) else {
        debug!(kind, "refusing server channel open");
        let packet = PacketWriter::new(MSG_CHANNEL_OPEN_FAILURE)
            .u32(sender)
            .u32(OPEN_ADMINISTRATIVELY_PROHIBITED)
            .string("open refused")
            .string("")
            .finish();
        return shared.send(packet).await;
    };

    let (local_id, send, events) = shared.alloc_slot(sender, None, window);
    let packet = PacketWriter::new(MSG_CHANNEL_OPEN_CONFIRMATION)
        .u32(sender)
        .u32(local_id)
        .u32(LOCAL_WINDOW)
        .u32(LOCAL_MAX_PACKET)
        .finish();
    shared.send(packet).await?;

    let channel = Channel::new(
        ChannelHandle {
            local_id,
            remote_id: sender,
            max_packet: max_packet.max(1),
            send,
            shared: shared.clone(),
        },
        events,
    );
    let _ = forwarded.send(ForwardedChannel {
        channel,
        kind,
        address,
        port,
        originator,
        originator_port,
    });
    Ok(())
}
