//! `-f`: go to the background once logged in.
//!
//! The foreground process re-executes itself with [`ENV_BACKGROUND`] set
//! and relays the child's stderr until the child reports a successful
//! login with [`BG_LOGIN_SENTINEL`]. Prompts therefore still reach the
//! user. The child then detaches from the terminal and carries on.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::process::Stdio;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

use resh_core::constants::{BG_LOGIN_SENTINEL, ENV_BACKGROUND, ENV_BG_MONITOR, IO_BUFFER_SIZE};
use resh_core::{Error, Result};

/// Whether this process is the re-executed background child.
pub fn is_child() -> bool {
    std::env::var(ENV_BACKGROUND).is_ok_and(|v| v == "TRUE")
}

/// Finds the login sentinel in a byte stream, passing everything else on.
#[derive(Debug)]
pub struct SentinelScanner {
    sentinel: &'static [u8],
    held: Vec<u8>,
}

impl SentinelScanner {
    pub fn new(sentinel: &'static [u8]) -> Self {
        Self {
            sentinel,
            held: Vec::new(),
        }
    }

    /// Returns the bytes that can be passed on, and whether the sentinel
    /// was seen. Anything after the sentinel is dropped.
    pub fn feed(&mut self, chunk: &[u8]) -> (Vec<u8>, bool) {
        self.held.extend_from_slice(chunk);
        if let Some(pos) = self
            .held
            .windows(self.sentinel.len())
            .position(|w| w == self.sentinel)
        {
            let out = self.held[..pos].to_vec();
            self.held.clear();
            return (out, true);
        }
        // a sentinel split across reads
        let keep = (1..self.sentinel.len())
            .rev()
            .find(|&n| self.held.ends_with(&self.sentinel[..n]))
            .unwrap_or(0);
        let split = self.held.len() - keep;
        (self.held.drain(..split).collect(), false)
    }

    /// Bytes still held back at end of stream.
    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.held)
    }
}

/// Foreground half: spawn the child and wait for its login.
pub async fn run_parent() -> Result<i32> {
    let exe = std::env::current_exe()?;
    let mut child = Command::new(exe)
        .args(std::env::args_os().skip(1))
        .env(ENV_BACKGROUND, "TRUE")
        .env(ENV_BG_MONITOR, "TRUE")
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::piped())
        .spawn()?;
    let mut child_err = child.stderr.take().ok_or_else(|| Error::Configuration {
        message: "background child has no stderr".into(),
    })?;

    let mut stderr = tokio::io::stderr();
    let mut scanner = SentinelScanner::new(BG_LOGIN_SENTINEL.as_bytes());
    let mut buf = vec![0u8; IO_BUFFER_SIZE];
    loop {
        let n = child_err.read(&mut buf).await?;
        if n == 0 {
            stderr.write_all(&scanner.finish()).await?;
            break;
        }
        let (out, found) = scanner.feed(&buf[..n]);
        stderr.write_all(&out).await?;
        stderr.flush().await?;
        if found {
            debug!(pid = child.id(), "background child logged in");
            return Ok(0);
        }
    }

    let status = child.wait().await?;
    debug!(?status, "background child exited before login");
    Ok(status.code().unwrap_or(255))
}

/// Background half: tell the parent login worked, then leave the terminal.
pub fn detach() -> Result<()> {
    use std::io::Write;

    if std::env::var(ENV_BG_MONITOR).is_ok_and(|v| v == "TRUE") {
        let mut stderr = std::io::stderr();
        stderr.write_all(BG_LOGIN_SENTINEL.as_bytes())?;
        stderr.flush()?;
    }

    nix::unistd::setsid().map_err(|e| Error::Configuration {
        message: format!("setsid failed: {}", e),
    })?;
    let devnull = File::options().read(true).write(true).open("/dev/null")?;
    for fd in 0..=2 {
        nix::unistd::dup2(devnull.as_raw_fd(), fd).map_err(|e| Error::Configuration {
            message: format!("redirecting fd {} failed: {}", fd, e),
        })?;
    }
    debug!("detached from terminal");
    Ok(())
}
