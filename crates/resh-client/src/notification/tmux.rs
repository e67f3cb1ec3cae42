//! tmux control-mode (`tmux -CC`) integration.
//!
//! When the remote runs tmux in control mode the local terminal speaks a
//! line protocol with it. The interceptor has to answer that protocol
//! itself while the connection is down, and draws its notice through
//! `%output` lines for the active pane.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, trace};

/// DCS sequence tmux prints when control mode starts.
pub const CONTROL_MODE_START: &[u8] = b"\x1bP1000p";

/// Only the head of an output line is needed to track panes.
const LINE_PREFIX_LIMIT: usize = 256;

/// Upper bound on buffered partial control-mode input.
const PARTIAL_INPUT_LIMIT: usize = 64 * 1024;

/// Result of feeding control-mode input while intercepting.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ControlInput {
    /// Commands that need a `%begin`/`%end` reply.
    pub acks: usize,
    pub detach: bool,
    /// Key bytes decoded from `send` commands.
    pub keys: Vec<u8>,
}

/// Tracks control-mode state from both directions of the session.
#[derive(Debug, Default)]
pub struct TmuxTracker {
    active: bool,
    pane: Option<String>,
    columns: Option<u16>,
    out_line: Vec<u8>,
    partial_input: Vec<u8>,
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// `%<digits>`, optionally quoted.
fn pane_id(token: &str) -> Option<String> {
    let token = unquote(token);
    let digits = token.strip_prefix('%')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(token.to_string())
}

fn unquote(token: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = token
            .strip_prefix(quote)
            .and_then(|t| t.strip_suffix(quote))
        {
            return inner;
        }
    }
    token
}

/// Columns from a tmux layout string such as `b25f,80x24,0,0,1`.
fn layout_columns(layout: &str) -> Option<u16> {
    let size = layout.split(',').nth(1)?;
    let (cols, _) = size.split_once('x')?;
    cols.parse().ok()
}

impl TmuxTracker {
    pub fn new(active: bool) -> Self {
        Self {
            active,
            ..Default::default()
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn pane(&self) -> Option<&str> {
        self.pane.as_deref()
    }

    pub fn columns(&self) -> Option<u16> {
        self.columns
    }

    /// Watch remote output for control-mode start, exit and pane changes.
    pub fn observe_output(&mut self, mut chunk: &[u8]) {
        if let Some(pos) = find(chunk, CONTROL_MODE_START) {
            debug!("tmux control mode started");
            self.active = true;
            self.out_line.clear();
            chunk = &chunk[pos + CONTROL_MODE_START.len()..];
        }
        if !self.active {
            return;
        }
        for &b in chunk {
            if b == b'\n' {
                let line = std::mem::take(&mut self.out_line);
                self.output_line(&line);
            } else if self.out_line.len() < LINE_PREFIX_LIMIT {
                self.out_line.push(b);
            }
        }
    }

    fn output_line(&mut self, line: &[u8]) {
        let line = String::from_utf8_lossy(line);
        let mut tokens = line.trim_end_matches('\r').split(' ');
        match tokens.next() {
            Some("%exit") => {
                debug!("tmux control mode exited");
                self.active = false;
                self.pane = None;
                self.columns = None;
            }
            Some("%output") => {
                if let Some(pane) = tokens.next().and_then(pane_id) {
                    self.pane = Some(pane);
                }
            }
            Some("%layout-change") => {
                if let Some(cols) = tokens.nth(1).and_then(layout_columns) {
                    trace!(cols, "tmux layout changed");
                    self.columns = Some(cols);
                }
            }
            _ => {}
        }
    }

    /// Watch local input for `refresh-client -C <cols>,<rows>`.
    pub fn observe_input(&mut self, chunk: &[u8]) {
        if !self.active {
            return;
        }
        let text = String::from_utf8_lossy(chunk);
        let Some(at) = text.find("refresh-client -C ") else {
            return;
        };
        let size = &text[at + "refresh-client -C ".len()..];
        let cols = size
            .split(|c: char| c == ',' || c == 'x')
            .next()
            .map(unquote)
            .and_then(|c| c.parse::<u16>().ok());
        if let Some(cols) = cols {
            trace!(cols, "tmux client resized");
            self.columns = Some(cols);
        }
    }

    /// Decode control-mode commands typed while intercepting.
    ///
    /// Commands end at `;`, `\r` or `\n`; an unterminated tail is kept for
    /// the next call.
    pub fn parse_input(&mut self, chunk: &[u8]) -> ControlInput {
        self.partial_input.extend_from_slice(chunk);
        let mut result = ControlInput::default();

        let Some(last) = self
            .partial_input
            .iter()
            .rposition(|&b| matches!(b, b';' | b'\r' | b'\n'))
        else {
            if self.partial_input.len() > PARTIAL_INPUT_LIMIT {
                self.partial_input.clear();
            }
            return result;
        };
        let complete: Vec<u8> = self.partial_input.drain(..=last).collect();
        let complete = String::from_utf8_lossy(&complete);

        for command in complete.split([';', '\r', '\n']) {
            let command = command.trim();
            if command.is_empty() {
                continue;
            }
            result.acks += 1;
            self.command(command, &mut result);
        }
        result
    }

    fn command(&mut self, command: &str, result: &mut ControlInput) {
        let tokens: Vec<&str> = command.split_whitespace().collect();
        match tokens.as_slice() {
            ["detach" | "detach-client", ..] => result.detach = true,
            ["send" | "send-keys", "-lt", pane, text @ ..] => {
                if let Some(pane) = pane_id(pane) {
                    self.pane = Some(pane);
                    let text = text.join(" ");
                    result.keys.extend_from_slice(unquote(&text).as_bytes());
                }
            }
            ["send" | "send-keys", "-t", pane, keys @ ..] => {
                if let Some(pane) = pane_id(pane) {
                    self.pane = Some(pane);
                    for key in keys {
                        let hex = key.trim_start_matches("0x");
                        if let Ok(b) = u8::from_str_radix(hex, 16) {
                            result.keys.push(b);
                        }
                    }
                }
            }
            ["select-pane" | "display-message", "-t", pane, ..] => {
                if let Some(pane) = pane_id(pane) {
                    self.pane = Some(pane);
                }
            }
            _ => trace!(command, "tmux command ignored"),
        }
    }
}

/// The reply for `count` acknowledged commands.
pub fn acknowledgements(count: usize) -> String {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    format!("%begin {ts} 1 1\r\n%end {ts} 1 1\r\n").repeat(count)
}

/// Wrap bytes as a `%output` line for `pane`, octal-escaping control bytes.
pub fn output_line(pane: &str, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + pane.len() + 12);
    out.extend_from_slice(b"%output ");
    out.extend_from_slice(pane.as_bytes());
    out.push(b' ');
    for &b in data {
        if b < b' ' || b == b'\\' {
            out.extend_from_slice(format!("\\{:03o}", b).as_bytes());
        } else {
            out.push(b);
        }
    }
    out.extend_from_slice(b"\r\n");
    out
}
