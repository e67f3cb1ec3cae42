//! Spawning and reusing an OpenSSH control master.
//!
//! When the socket already answers HELLO it is reused. Otherwise
//! `ssh -M -N -f` is started with the same destination and options, and
//! we wait for it to authenticate and create the socket.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use resh_core::constants::{CONTROL_SOCKET_POLL, CONTROL_SPAWN_GRACE, CONTROL_SPAWN_TIMEOUT};
use resh_core::options::ControlMaster;

use crate::client::is_alive;
use crate::error::{MuxError, MuxResult};

/// What the master process needs to reach the destination.
#[derive(Debug, Clone, Default)]
pub struct MasterSpec {
    /// Program to run, normally `ssh`.
    pub program: String,
    pub destination: String,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub identity_files: Vec<PathBuf>,
    pub config_file: Option<PathBuf>,
    pub proxy_jump: Option<String>,
    pub control_persist: Option<String>,
}

impl MasterSpec {
    /// Arguments for `ssh` to become a backgrounded master on `socket`.
    pub fn command_args(&self, mode: ControlMaster, socket: &Path) -> Vec<String> {
        let mut args = vec!["-M".to_string(), "-N".to_string(), "-f".to_string()];
        let master = if mode.asks() { "ask" } else { "yes" };
        args.push("-o".into());
        args.push(format!("ControlMaster={}", master));
        args.push("-o".into());
        args.push(format!("ControlPath={}", socket.display()));
        if let Some(persist) = &self.control_persist {
            args.push("-o".into());
            args.push(format!("ControlPersist={}", persist));
        }
        if let Some(port) = self.port {
            args.push("-p".into());
            args.push(port.to_string());
        }
        if let Some(user) = &self.user {
            args.push("-l".into());
            args.push(user.clone());
        }
        for identity in &self.identity_files {
            args.push("-i".into());
            args.push(identity.display().to_string());
        }
        if let Some(cfg) = &self.config_file {
            args.push("-F".into());
            args.push(cfg.display().to_string());
        }
        if let Some(jump) = &self.proxy_jump {
            args.push("-J".into());
            args.push(jump.clone());
        }
        args.push(self.destination.clone());
        args
    }
}

/// Return a usable control socket, starting a master if needed.
///
/// `Ok(None)` means the configuration does not allow proxying and the
/// caller should dial directly.
pub async fn ensure_master(
    mode: ControlMaster,
    socket: &Path,
    spec: &MasterSpec,
) -> MuxResult<Option<PathBuf>> {
    if !mode.accepts_proxy() {
        return Ok(None);
    }
    if is_alive(socket).await {
        debug!(socket = %socket.display(), "reusing control master");
        return Ok(Some(socket.to_path_buf()));
    }

    if let Some(parent) = socket.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    // A stale socket file makes ssh refuse to bind.
    if socket.exists() {
        let _ = std::fs::remove_file(socket);
    }

    info!(socket = %socket.display(), "starting control master");
    let child = Command::new(&spec.program)
        .args(spec.command_args(mode, socket))
        .stdin(Stdio::inherit())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .kill_on_drop(false)
        .spawn()
        .map_err(|e| MuxError::Spawn(format!("{}: {}", spec.program, e)))?;

    wait_for_socket(child, socket).await?;
    Ok(Some(socket.to_path_buf()))
}

async fn wait_for_socket(mut child: Child, socket: &Path) -> MuxResult<()> {
    let deadline = tokio::time::Instant::now() + CONTROL_SPAWN_TIMEOUT;
    let mut exited: Option<ExitStatus> = None;
    loop {
        if is_alive(socket).await {
            return Ok(());
        }
        if let Some(status) = exited
            && !status.success()
        {
            return Err(MuxError::Spawn(format!("master exited with {}", status)));
        }
        if tokio::time::Instant::now() >= deadline {
            interrupt(&mut child).await;
            return Err(MuxError::Timeout);
        }
        if exited.is_none() {
            tokio::select! {
                status = child.wait() => exited = Some(status?),
                _ = tokio::time::sleep(CONTROL_SOCKET_POLL) => {}
            }
        } else {
            tokio::time::sleep(CONTROL_SOCKET_POLL).await;
        }
    }
}

/// SIGINT, then SIGKILL after the grace period.
async fn interrupt(child: &mut Child) {
    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGINT);
    }
    match tokio::time::timeout(CONTROL_SPAWN_GRACE, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!("control master did not stop on interrupt, killing");
            let _ = child.kill().await;
        }
    }
}
