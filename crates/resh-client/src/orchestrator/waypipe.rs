//! Wayland forwarding through waypipe.
//!
//! The local `waypipe client` listens on a private socket; the remote
//! command is wrapped in `waypipe server`, whose socket is a remote
//! listener whose connections are relayed back to the local one.

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UnixStream;
use tokio::process::Command;
use tracing::{debug, info, warn};

use resh_core::constants::CONTROL_SOCKET_POLL;
use resh_core::options::WaypipeOptions;
use resh_core::{CleanupPhase, Error, ProcessContext, Result};

use crate::transport::{ListenAddr, RemoteListener, Transport};

/// How long the local client gets to create its socket.
const CLIENT_SOCKET_TIMEOUT: Duration = Duration::from_secs(5);

/// A running local waypipe client plus the remote socket relay.
#[derive(Debug)]
pub struct WaypipeBridge {
    options: WaypipeOptions,
    remote_socket: String,
}

impl WaypipeBridge {
    /// Start forwarding. `None` when there is no Wayland display to forward.
    pub async fn start(
        transport: Arc<dyn Transport>,
        options: &WaypipeOptions,
        ctx: &ProcessContext,
    ) -> Result<Option<Self>> {
        if std::env::var_os("WAYLAND_DISPLAY").is_none() {
            debug!("WAYLAND_DISPLAY not set, not starting waypipe");
            return Ok(None);
        }

        let dir = std::env::temp_dir().join(format!("resh-waypipe-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await?;
        let local_socket = dir.join("client.sock");
        let mut child = Command::new(&options.client_path)
            .args(&options.client_args)
            .arg("--socket")
            .arg(&local_socket)
            .arg("client")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Configuration {
                message: format!("cannot run {}: {}", options.client_path, e),
            })?;
        wait_for_socket(&local_socket).await?;

        let remote_socket = format!("/tmp/resh-waypipe-{:016x}.sock", rand::random::<u64>());
        let listener = transport
            .listen(ListenAddr::Unix(PathBuf::from(&remote_socket)))
            .await?;
        info!(socket = %remote_socket, "waypipe forwarding");
        let relay = tokio::spawn(relay(listener, local_socket));

        ctx.register(CleanupPhase::OnExit, move || async move {
            relay.abort();
            if let Err(e) = child.kill().await {
                debug!(error = %e, "stopping waypipe client failed");
            }
            let _ = tokio::fs::remove_dir_all(&dir).await;
        });

        Ok(Some(Self {
            options: options.clone(),
            remote_socket,
        }))
    }

    pub fn options(&self) -> &WaypipeOptions {
        &self.options
    }

    pub fn remote_socket(&self) -> &str {
        &self.remote_socket
    }
}

async fn wait_for_socket(path: &Path) -> Result<()> {
    let deadline = tokio::time::Instant::now() + CLIENT_SOCKET_TIMEOUT;
    while !path.exists() {
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::Timeout);
        }
        tokio::time::sleep(CONTROL_SOCKET_POLL).await;
    }
    Ok(())
}

async fn relay(mut listener: Box<dyn RemoteListener>, local_socket: PathBuf) {
    loop {
        let mut remote = match listener.accept().await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(error = %e, "waypipe listener closed");
                return;
            }
        };
        let path = local_socket.clone();
        tokio::spawn(async move {
            let mut local = match UnixStream::connect(&path).await {
                Ok(local) => local,
                Err(e) => {
                    warn!(error = %e, "cannot reach local waypipe client");
                    return;
                }
            };
            if let Err(e) = tokio::io::copy_bidirectional(&mut remote, &mut local).await {
                debug!(error = %e, "waypipe relay ended");
            }
        });
    }
}

/// Wrap `command` (or the login shell) in `waypipe server`.
pub fn wrap_remote_command(
    options: &WaypipeOptions,
    socket: &str,
    command: Option<&str>,
) -> String {
    let quote = |s: &str| shell_escape::escape(Cow::Borrowed(s)).into_owned();
    let mut parts = vec![quote(&options.server_path)];
    parts.extend(options.server_args.iter().map(|a| quote(a)));
    parts.extend([
        "--socket".to_string(),
        quote(socket),
        "--unlink-socket".to_string(),
        "server".to_string(),
    ]);
    if let Some(command) = command {
        parts.push("--".to_string());
        parts.push(command.to_string());
    }
    parts.join(" ")
}
