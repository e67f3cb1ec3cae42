//! Terminal handling for raw mode I/O.
//!
//! Provides:
//! - Raw terminal mode setup/restore
//! - Terminal size detection and resize notification
//! - An async stdin reader
//! - Password prompts on the controlling terminal

use std::io::{self, BufRead, IsTerminal, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use resh_core::error::{Error, Result};

/// Original terminal settings to restore on exit.
static ORIGINAL_TERMIOS: Mutex<Option<libc::termios>> = Mutex::new(None);

/// Flag indicating if we're in raw mode.
static RAW_MODE_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Terminal dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TermSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Guard that restores terminal settings on drop.
pub struct RawModeGuard {
    fd: RawFd,
}

impl RawModeGuard {
    /// Enter raw terminal mode.
    ///
    /// Returns a guard that restores normal mode on drop.
    pub fn enter() -> Result<Self> {
        let fd = io::stdin().as_raw_fd();

        let mut termios = std::mem::MaybeUninit::<libc::termios>::uninit();
        let result = unsafe { libc::tcgetattr(fd, termios.as_mut_ptr()) };
        if result != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        let original = unsafe { termios.assume_init() };

        if let Ok(mut guard) = ORIGINAL_TERMIOS.lock() {
            *guard = Some(original);
        }

        let mut raw = original;
        unsafe { libc::cfmakeraw(&mut raw) };
        raw.c_cc[libc::VMIN] = 1;
        raw.c_cc[libc::VTIME] = 0;

        let result = unsafe { libc::tcsetattr(fd, libc::TCSAFLUSH, &raw) };
        if result != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        RAW_MODE_ACTIVE.store(true, Ordering::SeqCst);
        debug!("Entered raw terminal mode");

        Ok(Self { fd })
    }

    /// Check if raw mode is currently active.
    pub fn is_active() -> bool {
        RAW_MODE_ACTIVE.load(Ordering::SeqCst)
    }

    fn restore(&self) {
        if let Ok(guard) = ORIGINAL_TERMIOS.lock()
            && let Some(original) = guard.as_ref()
        {
            let result = unsafe { libc::tcsetattr(self.fd, libc::TCSAFLUSH, original) };
            if result != 0 {
                warn!("Failed to restore terminal settings");
            } else {
                debug!("Restored terminal settings");
            }
        }
        RAW_MODE_ACTIVE.store(false, Ordering::SeqCst);
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        self.restore();
    }
}

/// Restore terminal settings (cleanup hooks, suspend).
pub fn restore_terminal() {
    let fd = io::stdin().as_raw_fd();
    if let Ok(guard) = ORIGINAL_TERMIOS.lock()
        && let Some(ref original) = *guard
    {
        unsafe {
            libc::tcsetattr(fd, libc::TCSAFLUSH, original);
        }
    }
    RAW_MODE_ACTIVE.store(false, Ordering::SeqCst);
}

/// Re-apply raw mode after a suspend, if it was active before.
pub fn reenter_raw_mode() {
    let fd = io::stdin().as_raw_fd();
    if let Ok(guard) = ORIGINAL_TERMIOS.lock()
        && let Some(original) = guard.as_ref()
    {
        let mut raw = *original;
        unsafe {
            libc::cfmakeraw(&mut raw);
            libc::tcsetattr(fd, libc::TCSAFLUSH, &raw);
        }
        RAW_MODE_ACTIVE.store(true, Ordering::SeqCst);
    }
}

pub fn stdin_is_terminal() -> bool {
    io::stdin().is_terminal()
}

pub fn stdout_is_terminal() -> bool {
    io::stdout().is_terminal()
}

pub fn stderr_is_terminal() -> bool {
    io::stderr().is_terminal()
}

/// Get the current terminal size, 80x24 when unknown.
pub fn get_terminal_size() -> TermSize {
    for fd in [
        io::stdout().as_raw_fd(),
        io::stdin().as_raw_fd(),
        io::stderr().as_raw_fd(),
    ] {
        let mut winsize = std::mem::MaybeUninit::<libc::winsize>::uninit();
        let result = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, winsize.as_mut_ptr()) };
        if result == 0 {
            let winsize = unsafe { winsize.assume_init() };
            if winsize.ws_col > 0 && winsize.ws_row > 0 {
                return TermSize {
                    cols: winsize.ws_col,
                    rows: winsize.ws_row,
                };
            }
        }
    }
    TermSize::default()
}

/// Stream of terminal size changes (SIGWINCH).
pub fn resize_events() -> Result<mpsc::UnboundedReceiver<TermSize>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut winch = signal(SignalKind::window_change())?;
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while winch.recv().await.is_some() {
            if tx.send(get_terminal_size()).is_err() {
                break;
            }
        }
    });
    Ok(rx)
}

/// Async stdin reader.
///
/// Spawns a blocking thread to read from stdin and sends
/// data through an unbounded channel to never block on stdin reads.
pub struct StdinReader {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl StdinReader {
    pub fn new() -> Self {
        Self::spawn(false)
    }

    /// Reader for an interactive console, where EOF is a key press (Ctrl+Z
    /// on Windows) rather than the end of input. Each EOF arrives as an
    /// empty chunk and reading continues.
    pub fn console() -> Self {
        Self::spawn(true)
    }

    fn spawn(eof_is_key: bool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        std::thread::spawn(move || {
            let stdin = io::stdin();
            let mut stdin_lock = stdin.lock();
            let mut buf = [0u8; 4096];

            loop {
                match stdin_lock.read(&mut buf) {
                    Ok(0) if eof_is_key => {
                        tracing::debug!("console EOF");
                        if tx.send(Vec::new()).is_err() {
                            break;
                        }
                    }
                    Ok(0) => {
                        tracing::debug!("stdin EOF");
                        break;
                    }
                    Ok(n) => {
                        tracing::trace!(len = n, "stdin read");
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::error!(error = %e, "stdin read error");
                        break;
                    }
                }
            }
            tracing::debug!("stdin reader thread exiting");
        });

        Self { rx }
    }

    /// Build a reader over an arbitrary channel (tests, escape console).
    pub fn from_channel(rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self { rx }
    }

    /// Read the next chunk; `None` at EOF, an empty chunk for a console
    /// EOF.
    pub async fn read(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

impl Default for StdinReader {
    fn default() -> Self {
        Self::new()
    }
}

/// Prompt on the controlling terminal and read a line with echo off.
pub fn read_password(prompt: &str) -> Result<String> {
    let tty = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/tty")?;
    let fd = tty.as_raw_fd();

    let mut termios = std::mem::MaybeUninit::<libc::termios>::uninit();
    if unsafe { libc::tcgetattr(fd, termios.as_mut_ptr()) } != 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    let original = unsafe { termios.assume_init() };
    let mut silent = original;
    silent.c_lflag &= !libc::ECHO;
    silent.c_lflag |= libc::ICANON | libc::ECHONL;
    if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &silent) } != 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }

    let result = (|| -> io::Result<String> {
        let mut out = &tty;
        out.write_all(prompt.as_bytes())?;
        out.flush()?;
        let mut line = String::new();
        io::BufReader::new(&tty).read_line(&mut line)?;
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    })();

    unsafe { libc::tcsetattr(fd, libc::TCSANOW, &original) };
    Ok(result?)
}

/// Ask a yes/no question on the controlling terminal.
pub fn confirm(prompt: &str) -> Result<bool> {
    let tty = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/tty")?;
    let mut out = &tty;
    out.write_all(prompt.as_bytes())?;
    out.flush()?;
    loop {
        let mut line = String::new();
        io::BufReader::new(&tty).read_line(&mut line)?;
        match line.trim().to_ascii_lowercase().as_str() {
            "yes" => return Ok(true),
            "no" | "" => return Ok(false),
            _ => {
                out.write_all(b"Please type 'yes' or 'no': ")?;
                out.flush()?;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_size_is_never_zero() {
        let size = get_terminal_size();
        assert!(size.cols > 0);
        assert!(size.rows > 0);
    }

    #[test]
    fn raw_mode_guard_tracks_active_state() {
        assert!(!RawModeGuard::is_active());
    }

    #[tokio::test]
    async fn channel_reader_yields_chunks_then_eof() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut reader = StdinReader::from_channel(rx);
        tx.send(b"ab".to_vec()).unwrap();
        drop(tx);
        assert_eq!(reader.read().await, Some(b"ab".to_vec()));
        assert_eq!(reader.read().await, None);
    }
}
