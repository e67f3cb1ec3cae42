//! Protocol and configuration constants for resh.

use std::time::Duration;

// =============================================================================
// Escape Console
// =============================================================================

/// Default escape character.
pub const DEFAULT_ESCAPE_CHAR: u8 = b'~';

/// Default window between `\r` and the escape character.
pub const DEFAULT_CONSOLE_ESCAPE_TIME: Duration = Duration::from_secs(1);

// =============================================================================
// Pipeline
// =============================================================================

/// Capacity of the queue feeding the server input writer.
pub const INPUT_QUEUE_CAPACITY: usize = 10;

/// Poll tick used while the input queue is full or output is paused.
pub const PIPELINE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Read buffer size for terminal and server streams.
pub const IO_BUFFER_SIZE: usize = 32 * 1024;

/// Minimum capacity of one output cache chunk (64 KiB).
pub const OUTPUT_CACHE_CHUNK: usize = 64 * 1024;

// =============================================================================
// Notification Interceptor
// =============================================================================

/// Notification render tick.
pub const NOTIFICATION_RENDER_INTERVAL: Duration = Duration::from_millis(200);

/// Wait for a cursor position report after `ESC[6n`.
pub const CURSOR_REPORT_TIMEOUT: Duration = Duration::from_millis(500);

/// Upper bound for the post-reconnect `ESC[6n` filter.
pub const CPR_FILTER_MAX: Duration = Duration::from_secs(3);

/// How long a partial `ESC[6n` at the end of a read is held back when no
/// more output follows.
pub const CPR_HOLD_TIMEOUT: Duration = Duration::from_millis(50);

/// Default reconnect window before the interceptor gives up.
pub const DEFAULT_RECONNECT_WINDOW: Duration = Duration::from_secs(600);

// =============================================================================
// Transports
// =============================================================================

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Dial timeout for the ControlMaster UNIX socket.
pub const CONTROL_DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// Grace period between interrupting and killing a spawned control master.
pub const CONTROL_SPAWN_GRACE: Duration = Duration::from_millis(200);

/// How long to wait for a spawned control master to create its socket.
/// Covers interactive password entry.
pub const CONTROL_SPAWN_TIMEOUT: Duration = Duration::from_secs(60);

/// Poll interval while waiting for a control socket to appear.
pub const CONTROL_SOCKET_POLL: Duration = Duration::from_millis(100);

/// OpenSSH mux protocol version.
pub const MUX_PROTOCOL_VERSION: u32 = 4;

/// Dial timeout for logical streams on the datagram tunnel.
pub const STREAM_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default keep-alive timeout on the datagram tunnel.
pub const DEFAULT_UDP_ALIVE_TIMEOUT: Duration = Duration::from_secs(100);

/// Keep-alive intervals without a reply before the tunnel counts as lost.
pub const ALIVE_MISSES_BEFORE_LOST: u32 = 2;

/// TCP SSH connect timeout.
pub const SSH_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default remote path of the datagram server.
pub const DEFAULT_TSSHD_PATH: &str = "tsshd";

// =============================================================================
// Tunnel Crypto
// =============================================================================

/// PBKDF2 iteration count for the tunnel key.
pub const TUNNEL_KDF_ITERATIONS: u32 = 4096;

/// Tunnel key length (AES-256).
pub const TUNNEL_KEY_LEN: usize = 32;

/// Cipher IV length, sent in clear at the start of each direction.
pub const TUNNEL_IV_LEN: usize = 16;

// =============================================================================
// Wire Limits
// =============================================================================

/// Maximum tunnel record size (16 MiB).
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

/// Maximum SSH packet accepted from a packet transport (256 KiB).
pub const MAX_PACKET_SIZE: usize = 256 * 1024;

/// Maximum mux frame payload.
pub const MAX_MUX_FRAME: usize = u16::MAX as usize;

// =============================================================================
// Environment
// =============================================================================

/// Set in the re-executed child when backgrounding with `-f`.
pub const ENV_BACKGROUND: &str = "TRZSZ-SSH-BACKGROUND";

/// Set in the re-executed child so it reports login success to the parent.
pub const ENV_BG_MONITOR: &str = "TRZSZ-SSH-BG-MONITOR";

/// Set by tmux in every client it runs.
pub const ENV_TMUX: &str = "TMUX";

/// Sentinel written to stderr by a background child after login.
pub const BG_LOGIN_SENTINEL: &str = "\x1b]resh:login-ok\x07";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tunnel_key_is_aes256() {
        assert_eq!(TUNNEL_KEY_LEN, 32);
        assert_eq!(TUNNEL_IV_LEN, 16);
    }

    #[test]
    fn poll_interval_shorter_than_render_tick() {
        assert!(PIPELINE_POLL_INTERVAL < NOTIFICATION_RENDER_INTERVAL);
        assert!(NOTIFICATION_RENDER_INTERVAL < CURSOR_REPORT_TIMEOUT);
    }
}
