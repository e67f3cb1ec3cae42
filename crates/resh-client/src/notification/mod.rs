//! Connection-loss notification and terminal interception.
//!
//! Active on the datagram transport with a local terminal and a remote pty.
//! When the connection drops the interceptor takes over the terminal:
//! stdin stops reaching the remote, remote output is cached, and a status
//! notice is drawn every render tick. After a reconnect the remote is asked
//! to redraw and the cache is released in order.
//!
//! The transitions live in one task fed by a single event queue:
//!
//! ```text
//! Idle --lost--> Intercept --reconnected--> Redraw --> Idle
//!                Intercept --Ctrl+C | tmux detach | window expired--> Exit
//! ```

mod cache;
mod format;
mod render;
mod tmux;

#[cfg(test)]
mod tests;

use std::ffi::OsString;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use resh_core::constants::{
    CURSOR_REPORT_TIMEOUT, ENV_TMUX, INPUT_QUEUE_CAPACITY, NOTIFICATION_RENDER_INTERVAL,
};
use resh_core::{ExitCode, Result, SshOptions};

pub use cache::OutputCache;
pub use render::{NoticeStatus, Placement, compact_lines, full_lines};
pub use tmux::{ControlInput, TmuxTracker};

use crate::pipeline::OutputSink;
use crate::terminal::{TermSize, get_terminal_size};
use crate::transport::SessionHandle;

/// Events driving the interceptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoticeEvent {
    ConnectionLost(String),
    ReconnectError(String),
    Reconnected,
    UserAbort,
    TmuxDetach,
}

/// Interceptor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Intercept,
    Redraw,
    Exit,
}

/// Notice settings.
#[derive(Debug, Clone)]
pub struct NotificationConfig {
    /// Draw at the top of the screen instead of in place.
    pub on_top: bool,
    /// Start with the full box instead of the banner.
    pub show_full: bool,
    pub reconnect_window: Duration,
    /// Assume tmux control mode from the start.
    pub tmux: bool,
    pub term_size: fn() -> TermSize,
}

/// Whether a `TMUX` value means we run inside tmux.
fn tmux_from_env(value: Option<OsString>) -> bool {
    value.is_some_and(|v| !v.is_empty())
}

impl NotificationConfig {
    /// Settings from `-o` options. tmux is assumed when `TMUX` is set; a
    /// control-mode start seen in remote output turns it on later too.
    pub fn from_options(opts: &SshOptions) -> Result<Self> {
        Ok(Self {
            on_top: opts.show_notification_on_top()?,
            show_full: opts.show_full_notifications()?,
            reconnect_window: opts.udp_reconnect_timeout()?,
            tmux: tmux_from_env(std::env::var_os(ENV_TMUX)),
            term_size: get_terminal_size,
        })
    }
}

/// How an intercept ended.
enum InterceptEnd {
    Reconnected,
    Exit(ExitCode, String),
}

struct Shared {
    show_full: bool,
    tmux: TmuxTracker,
    cursor: Option<(u16, u16)>,
}

/// Sits inline in both pipeline halves and owns the notice.
pub struct Interceptor {
    config: NotificationConfig,
    sink: Arc<OutputSink>,
    handle: SessionHandle,
    events: mpsc::UnboundedSender<NoticeEvent>,
    pending: mpsc::Sender<Vec<u8>>,
    /// Server-in queue; input still pending when an episode ends goes here.
    forward: Mutex<Option<mpsc::WeakSender<Vec<u8>>>>,
    shared: Mutex<Shared>,
    phase: watch::Sender<Phase>,
}

impl std::fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interceptor")
            .field("phase", &self.phase())
            .field("intercepting", &self.is_intercepting())
            .finish_non_exhaustive()
    }
}

/// Parse a cursor position report `ESC [ row ; col R`.
fn parse_cursor_report(input: &[u8]) -> Option<(u16, u16)> {
    if input.len() < 6 {
        return None;
    }
    let body = input.strip_prefix(b"\x1b[")?.strip_suffix(b"R")?;
    let body = std::str::from_utf8(body).ok()?;
    let (row, col) = body.split_once(';')?;
    Some((row.parse().ok()?, col.parse().ok()?))
}

impl Interceptor {
    /// Create the interceptor and start its state machine.
    pub fn spawn(
        config: NotificationConfig,
        sink: Arc<OutputSink>,
        handle: SessionHandle,
    ) -> Arc<Self> {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (pending, pending_rx) = mpsc::channel(INPUT_QUEUE_CAPACITY);
        let (phase, _) = watch::channel(Phase::Idle);
        let this = Arc::new(Self {
            shared: Mutex::new(Shared {
                show_full: config.show_full,
                tmux: TmuxTracker::new(config.tmux),
                cursor: None,
            }),
            config,
            sink,
            handle,
            events,
            pending,
            forward: Mutex::new(None),
            phase,
        });
        tokio::spawn(this.clone().run(events_rx, pending_rx));
        this
    }

    pub fn notify(&self, event: NoticeEvent) {
        let _ = self.events.send(event);
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn phases(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    pub fn is_intercepting(&self) -> bool {
        self.sink.is_intercepting()
    }

    pub fn show_full(&self) -> bool {
        self.shared.lock().map(|s| s.show_full).unwrap_or(false)
    }

    pub fn tmux_active(&self) -> bool {
        self.shared.lock().map(|s| s.tmux.is_active()).unwrap_or(false)
    }

    /// Take a stdin chunk while intercepting. Never blocks; a full queue
    /// drops the chunk.
    pub fn handle_input(&self, chunk: Vec<u8>) {
        if let Err(e) = self.pending.try_send(chunk) {
            debug!(error = %e, "dropping input while intercepting");
        }
    }

    /// Route input left over after a reconnect to the server-in queue.
    pub fn attach_input(&self, queue: &mpsc::Sender<Vec<u8>>) {
        if let Ok(mut forward) = self.forward.lock() {
            *forward = Some(queue.downgrade());
        }
    }

    /// Called for stdin forwarded to the remote.
    pub async fn user_input(&self, chunk: &[u8]) {
        if let Ok(mut shared) = self.shared.lock() {
            shared.tmux.observe_input(chunk);
        }
        self.sink.user_input_seen().await;
    }

    /// Called for every chunk of remote output.
    pub fn observe_output(&self, chunk: &[u8]) {
        if let Ok(mut shared) = self.shared.lock() {
            shared.tmux.observe_output(chunk);
        }
    }

    fn set_phase(&self, phase: Phase) {
        debug!(?phase, "notification phase");
        self.phase.send_replace(phase);
    }

    fn width(&self) -> u16 {
        let tmux_cols = self
            .shared
            .lock()
            .ok()
            .filter(|s| s.tmux.is_active())
            .and_then(|s| s.tmux.columns());
        tmux_cols.unwrap_or_else(|| (self.config.term_size)().cols)
    }

    async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<NoticeEvent>,
        mut pending: mpsc::Receiver<Vec<u8>>,
    ) {
        let mut placement = Placement::new(self.config.on_top);
        while let Some(event) = events.recv().await {
            let reason = match event {
                NoticeEvent::ConnectionLost(reason) => reason,
                other => {
                    trace!(event = ?other, "ignored while idle");
                    continue;
                }
            };
            let end = self
                .intercept(&reason, &mut events, &mut pending, &mut placement)
                .await;
            match end {
                InterceptEnd::Reconnected => {
                    self.redraw(&mut placement, &mut pending).await;
                    self.set_phase(Phase::Idle);
                }
                InterceptEnd::Exit(code, reason) => {
                    self.set_phase(Phase::Exit);
                    self.write(placement.clear().as_bytes()).await;
                    self.handle.force_exit(code, reason);
                    return;
                }
            }
        }
    }

    async fn intercept(
        &self,
        reason: &str,
        events: &mut mpsc::UnboundedReceiver<NoticeEvent>,
        pending: &mut mpsc::Receiver<Vec<u8>>,
        placement: &mut Placement,
    ) -> InterceptEnd {
        info!(reason, "connection lost, holding the terminal");
        self.sink.begin_intercept().await;
        self.set_phase(Phase::Intercept);

        let since = Instant::now();
        let window = self.config.reconnect_window;
        let deadline = since + window;

        if !self.tmux_active() && self.config.on_top {
            if let Some(end) = self.request_cursor(pending).await {
                return end;
            }
            placement.cursor = self.shared.lock().ok().and_then(|s| s.cursor);
        }

        let mut last_error = None;
        let mut tick = tokio::time::interval(NOTIFICATION_RENDER_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let expired = tokio::time::sleep_until(deadline);
        tokio::pin!(expired);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let now = Instant::now();
                    let status = NoticeStatus {
                        lost_for: now - since,
                        remaining: deadline.saturating_duration_since(now),
                        last_error: last_error.clone(),
                        reconnected: false,
                    };
                    self.render(placement, &status).await;
                }
                _ = &mut expired => {
                    return InterceptEnd::Exit(
                        ExitCode::UdpReconnectTimeout,
                        format!("reconnect timeout after {} seconds", window.as_secs()),
                    );
                }
                event = events.recv() => match event {
                    Some(NoticeEvent::Reconnected) => return InterceptEnd::Reconnected,
                    Some(NoticeEvent::ReconnectError(e)) => {
                        debug!(error = %e, "reconnect attempt failed");
                        last_error = Some(e);
                    }
                    Some(NoticeEvent::ConnectionLost(_)) => {}
                    Some(NoticeEvent::UserAbort) => return ctrl_c(),
                    Some(NoticeEvent::TmuxDetach) => return tmux_detach(),
                    None => return InterceptEnd::Exit(
                        ExitCode::UdpReconnectTimeout,
                        "notification events closed".to_string(),
                    ),
                },
                Some(chunk) = pending.recv() => {
                    if let Some(end) = self.on_input(&chunk).await {
                        return end;
                    }
                }
            }
        }
    }

    /// Ask the terminal where the cursor is, waiting briefly for the answer.
    async fn request_cursor(&self, pending: &mut mpsc::Receiver<Vec<u8>>) -> Option<InterceptEnd> {
        if let Ok(mut shared) = self.shared.lock() {
            shared.cursor = None;
        }
        self.write(b"\x1b[6n").await;
        let wait = tokio::time::sleep(CURSOR_REPORT_TIMEOUT);
        tokio::pin!(wait);
        loop {
            tokio::select! {
                _ = &mut wait => {
                    debug!("no cursor position report");
                    return None;
                }
                Some(chunk) = pending.recv() => {
                    if let Some(end) = self.on_input(&chunk).await {
                        return Some(end);
                    }
                    if self.shared.lock().is_ok_and(|s| s.cursor.is_some()) {
                        return None;
                    }
                }
            }
        }
    }

    async fn on_input(&self, chunk: &[u8]) -> Option<InterceptEnd> {
        if let Some(pos) = parse_cursor_report(chunk) {
            trace!(row = pos.0, col = pos.1, "cursor position report");
            if let Ok(mut shared) = self.shared.lock() {
                shared.cursor = Some(pos);
            }
            return None;
        }

        if self.tmux_active() {
            let parsed = match self.shared.lock() {
                Ok(mut shared) => shared.tmux.parse_input(chunk),
                Err(_) => return None,
            };
            // replies go to the terminal as is, not into the pane
            if parsed.acks > 0
                && let Err(e) = self
                    .sink
                    .write_overlay(tmux::acknowledgements(parsed.acks).as_bytes())
                    .await
            {
                debug!(error = %e, "tmux acknowledgement failed");
            }
            if parsed.detach {
                return Some(tmux_detach());
            }
            return self.on_keys(&parsed.keys);
        }
        self.on_keys(chunk)
    }

    fn on_keys(&self, keys: &[u8]) -> Option<InterceptEnd> {
        match keys {
            [0x01] => {
                if let Ok(mut shared) = self.shared.lock() {
                    shared.show_full = !shared.show_full;
                }
                None
            }
            [0x03] => Some(ctrl_c()),
            [] => None,
            _ => {
                trace!(len = keys.len(), "discarding input while intercepting");
                None
            }
        }
    }

    async fn render(&self, placement: &mut Placement, status: &NoticeStatus) {
        let width = self.width();
        let lines = if self.show_full() {
            full_lines(status, width)
        } else {
            compact_lines(status, width)
        };
        if self.width() != width {
            trace!("terminal width changed, skipping frame");
            return;
        }
        let frame = placement.frame(&lines);
        self.write(frame.as_bytes()).await;
    }

    async fn redraw(&self, placement: &mut Placement, pending: &mut mpsc::Receiver<Vec<u8>>) {
        self.set_phase(Phase::Redraw);
        info!("reconnected, redrawing");
        self.render(placement, &NoticeStatus::reconnected()).await;
        self.write(b"\x1b[J").await;
        match tokio::time::timeout(self.config.reconnect_window, self.handle.redraw()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "redraw request failed"),
            Err(_) => debug!("redraw timed out"),
        }
        self.write(placement.clear().as_bytes()).await;
        self.release_pending(pending).await;
        if let Err(e) = self.sink.end_intercept().await {
            debug!(error = %e, "releasing output cache failed");
        }
        // chunks diverted while the flag was being cleared
        self.release_pending(pending).await;
    }

    /// Forward input typed during the redraw, oldest first.
    async fn release_pending(&self, pending: &mut mpsc::Receiver<Vec<u8>>) {
        let queue = self
            .forward
            .lock()
            .ok()
            .and_then(|f| f.as_ref().and_then(mpsc::WeakSender::upgrade));
        while let Ok(chunk) = pending.try_recv() {
            let Some(queue) = &queue else {
                trace!(len = chunk.len(), "no input queue, dropping");
                continue;
            };
            self.user_input(&chunk).await;
            if queue.send(chunk).await.is_err() {
                debug!("server input closed, dropping pending input");
                return;
            }
        }
    }

    /// Draw on stderr, through tmux when control mode is active. Errors
    /// are only logged; the terminal may be gone.
    async fn write(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let pane = self
            .shared
            .lock()
            .ok()
            .filter(|s| s.tmux.is_active())
            .and_then(|s| s.tmux.pane().map(String::from));
        let result = match pane {
            Some(pane) => self.sink.write_overlay(&tmux::output_line(&pane, bytes)).await,
            None => self.sink.write_overlay(bytes).await,
        };
        if let Err(e) = result {
            debug!(error = %e, "notification write failed");
        }
    }
}

fn ctrl_c() -> InterceptEnd {
    InterceptEnd::Exit(
        ExitCode::UdpCtrlC,
        "interrupted while reconnecting".to_string(),
    )
}

fn tmux_detach() -> InterceptEnd {
    InterceptEnd::Exit(ExitCode::TmuxDetach, "detached from tmux".to_string())
}
