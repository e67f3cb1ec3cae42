//! Direct TCP transport on russh.
//!
//! Handles key exchange, host key verification, authentication (identity
//! files, ssh-agent, password) and an optional single ProxyJump hop.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Msg};
use russh::{ChannelMsg, Disconnect};
use russh_keys::PublicKeyBase64;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use resh_core::constants::{DEFAULT_SSH_PORT, IO_BUFFER_SIZE, SSH_CONNECT_TIMEOUT};
use resh_core::{Error, Result};

use super::channel_io::{ExitCell, OutputSinks, session_pipes};
use super::hostkey::HostKeyVerifier;
use super::{
    BoxedStream, ListenAddr, RemoteExit, RemoteListener, RemoteSession, SessionIo, SessionOptions,
    StartRequest, Transport, TransportKind,
};
use crate::terminal::{TermSize, read_password};

/// Password attempts before giving up.
const PASSWORD_ATTEMPTS: usize = 3;

/// Keys tried when no `-i` is given.
const DEFAULT_IDENTITIES: &[&str] = &["id_ed25519", "id_ecdsa", "id_rsa"];

/// Where and as whom to log in.
#[derive(Debug, Clone)]
pub struct TcpTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub identity_files: Vec<PathBuf>,
    /// `[user@]host[:port]` of a jump host.
    pub proxy_jump: Option<String>,
}

impl TcpTarget {
    /// Parse a ProxyJump hop, inheriting identities and defaulting the user.
    fn jump_host(&self, spec: &str) -> Result<TcpTarget> {
        let first = spec.split(',').next().unwrap_or(spec).trim();
        let (user, hostport) = match first.rsplit_once('@') {
            Some((u, h)) => (u.to_string(), h),
            None => (self.user.clone(), first),
        };
        let (host, port) = split_host_port(hostport)?;
        if host.is_empty() {
            return Err(Error::Configuration {
                message: format!("invalid ProxyJump: {}", spec),
            });
        }
        Ok(TcpTarget {
            host,
            port: port.unwrap_or(DEFAULT_SSH_PORT),
            user,
            identity_files: self.identity_files.clone(),
            proxy_jump: None,
        })
    }
}

fn split_host_port(s: &str) -> Result<(String, Option<u16>)> {
    let invalid = || Error::Configuration {
        message: format!("invalid host: {}", s),
    };
    if let Some(rest) = s.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or_else(invalid)?;
        let port = match after.strip_prefix(':') {
            Some(p) => Some(p.parse().map_err(|_| invalid())?),
            None if after.is_empty() => None,
            None => return Err(invalid()),
        };
        return Ok((host.to_string(), port));
    }
    match s.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            Ok((host.to_string(), Some(port.parse().map_err(|_| invalid())?)))
        }
        _ => Ok((s.to_string(), None)),
    }
}

fn ssh_error(context: &str) -> impl Fn(russh::Error) -> Error + '_ {
    move |e| Error::Transport {
        message: format!("{}: {}", context, e),
    }
}

/// russh callbacks: host key check and forwarded connections.
struct ClientHandler {
    host: String,
    port: u16,
    verifier: HostKeyVerifier,
    rejection: Arc<Mutex<Option<Error>>>,
    forwarded: mpsc::UnboundedSender<russh::Channel<Msg>>,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh_keys::key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let openssh = format!(
            "{} {}",
            server_public_key.name(),
            server_public_key.public_key_base64()
        );
        let verdict = ssh_key::PublicKey::from_openssh(&openssh)
            .map_err(|e| Error::Protocol {
                message: format!("unsupported host key: {}", e),
            })
            .and_then(|key| self.verifier.verify(&self.host, self.port, &key));
        match verdict {
            Ok(()) => Ok(true),
            Err(e) => {
                debug!(error = %e, "host key rejected");
                if let Ok(mut slot) = self.rejection.lock() {
                    *slot = Some(e);
                }
                Ok(false)
            }
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: russh::Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        trace!(
            connected_address,
            connected_port,
            originator_address,
            originator_port,
            "forwarded connection"
        );
        let _ = self.forwarded.send(channel);
        Ok(())
    }
}

type SshHandle = client::Handle<ClientHandler>;

/// Transport over a direct SSH connection.
#[derive(Clone)]
pub struct TcpTransport {
    handle: Arc<tokio::sync::Mutex<SshHandle>>,
    /// Jump host connection, kept alive for the lifetime of this one.
    jump: Option<Arc<TcpTransport>>,
    forwarded: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<russh::Channel<Msg>>>>,
    closed: Arc<watch::Sender<bool>>,
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("jump", &self.jump.is_some())
            .finish_non_exhaustive()
    }
}

fn client_config() -> Arc<client::Config> {
    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    })
}

impl TcpTransport {
    /// Connect, verify the host and authenticate.
    pub async fn connect(target: &TcpTarget, verifier: HostKeyVerifier) -> Result<Self> {
        let jump = match &target.proxy_jump {
            Some(spec) if !spec.eq_ignore_ascii_case("none") => {
                let hop = target.jump_host(spec)?;
                info!(jump = %hop.host, "connecting through jump host");
                Some(Arc::new(Box::pin(Self::connect(&hop, verifier.clone())).await?))
            }
            _ => None,
        };

        let rejection = Arc::new(Mutex::new(None));
        let (fwd_tx, fwd_rx) = mpsc::unbounded_channel();
        let handler = ClientHandler {
            host: target.host.clone(),
            port: target.port,
            verifier,
            rejection: rejection.clone(),
            forwarded: fwd_tx,
        };

        let config = client_config();
        let connecting = async {
            let connected = match &jump {
                Some(hop) => {
                    let channel = hop
                        .handle
                        .lock()
                        .await
                        .channel_open_direct_tcpip(
                            target.host.clone(),
                            target.port.into(),
                            "127.0.0.1",
                            0,
                        )
                        .await
                        .map_err(ssh_error("jump host forward failed"))?;
                    client::connect_stream(config, channel.into_stream(), handler).await
                }
                None => {
                    client::connect(config, (target.host.as_str(), target.port), handler).await
                }
            };
            connected.map_err(|e| {
                let rejected = rejection.lock().ok().and_then(|mut r| r.take());
                rejected.unwrap_or_else(|| Error::Transport {
                    message: format!(
                        "connect to {} port {} failed: {}",
                        target.host, target.port, e
                    ),
                })
            })
        };
        let mut handle = tokio::time::timeout(SSH_CONNECT_TIMEOUT, connecting)
            .await
            .map_err(|_| Error::Timeout)??;
        debug!(host = %target.host, port = target.port, "ssh transport established");

        authenticate(&mut handle, target).await?;
        info!(user = %target.user, host = %target.host, "ssh authentication succeeded");

        let (closed, _) = watch::channel(false);
        Ok(Self {
            handle: Arc::new(tokio::sync::Mutex::new(handle)),
            jump,
            forwarded: Arc::new(tokio::sync::Mutex::new(fwd_rx)),
            closed: Arc::new(closed),
        })
    }
}

async fn authenticate(handle: &mut SshHandle, target: &TcpTarget) -> Result<()> {
    let user = target.user.as_str();

    for path in identity_candidates(&target.identity_files) {
        let key = match load_key(&path) {
            Ok(Some(key)) => key,
            Ok(None) => continue,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping identity");
                continue;
            }
        };
        debug!(path = %path.display(), "trying public key");
        if handle
            .authenticate_publickey(user, Arc::new(key))
            .await
            .map_err(ssh_error("public key authentication"))?
        {
            return Ok(());
        }
    }

    if try_agent(handle, user).await? {
        return Ok(());
    }

    for attempt in 0..PASSWORD_ATTEMPTS {
        let password = read_password(&format!("{}@{}'s password: ", user, target.host))?;
        if handle
            .authenticate_password(user, password)
            .await
            .map_err(ssh_error("password authentication"))?
        {
            return Ok(());
        }
        if attempt + 1 < PASSWORD_ATTEMPTS {
            eprint!("Permission denied, please try again.\r\n");
        }
    }

    Err(Error::AuthenticationFailed {
        message: format!("{}@{}: permission denied", user, target.host),
    })
}

fn identity_candidates(explicit: &[PathBuf]) -> Vec<PathBuf> {
    if !explicit.is_empty() {
        return explicit.to_vec();
    }
    let Some(home) = std::env::var_os("HOME") else {
        return Vec::new();
    };
    DEFAULT_IDENTITIES
        .iter()
        .map(|name| PathBuf::from(&home).join(".ssh").join(name))
        .collect()
}

/// Load a private key, asking for its passphrase if needed.
fn load_key(path: &PathBuf) -> Result<Option<russh_keys::key::KeyPair>> {
    if !path.exists() {
        return Ok(None);
    }
    match russh_keys::load_secret_key(path, None) {
        Ok(key) => Ok(Some(key)),
        Err(first) => {
            debug!(path = %path.display(), error = %first, "key needs a passphrase");
            let pass = read_password(&format!("Enter passphrase for key '{}': ", path.display()))?;
            if pass.is_empty() {
                return Ok(None);
            }
            russh_keys::load_secret_key(path, Some(&pass))
                .map(Some)
                .map_err(|e| Error::Configuration {
                    message: format!("cannot load {}: {}", path.display(), e),
                })
        }
    }
}

async fn try_agent(handle: &mut SshHandle, user: &str) -> Result<bool> {
    if std::env::var_os("SSH_AUTH_SOCK").is_none() {
        return Ok(false);
    }
    let mut agent = match russh_keys::agent::client::AgentClient::connect_env().await {
        Ok(agent) => agent,
        Err(e) => {
            debug!(error = %e, "ssh-agent unavailable");
            return Ok(false);
        }
    };
    let identities = match agent.request_identities().await {
        Ok(ids) => ids,
        Err(e) => {
            debug!(error = %e, "ssh-agent listing failed");
            return Ok(false);
        }
    };
    for key in identities {
        debug!(key = %key.name(), "trying agent key");
        let (returned, result) = handle.authenticate_future(user, key, agent).await;
        agent = returned;
        match result {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            Err(e) => debug!(error = %e, "agent signing failed"),
        }
    }
    Ok(false)
}

#[async_trait]
impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    async fn new_session(&self, options: SessionOptions) -> Result<Arc<dyn RemoteSession>> {
        let channel = self
            .handle
            .lock()
            .await
            .channel_open_session()
            .await
            .map_err(ssh_error("open session"))?;
        if let Some(pty) = &options.pty {
            channel
                .request_pty(
                    false,
                    &pty.term,
                    pty.size.cols.into(),
                    pty.size.rows.into(),
                    0,
                    0,
                    &[],
                )
                .await
                .map_err(ssh_error("pty request"))?;
        }
        for (name, value) in &options.env {
            channel
                .set_env(false, name.clone(), value.clone())
                .await
                .map_err(ssh_error("env request"))?;
        }

        let (io, ends) = session_pipes();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let exit = ExitCell::new();
        tokio::spawn(drive_channel(
            channel,
            cmd_rx,
            ends.stdin,
            ends.sinks,
            exit.clone(),
        ));
        Ok(Arc::new(TcpSession {
            commands: cmd_tx,
            io: Mutex::new(Some(io)),
            exit,
        }))
    }

    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream> {
        let channel = self
            .handle
            .lock()
            .await
            .channel_open_direct_tcpip(host, port.into(), "127.0.0.1", 0)
            .await
            .map_err(ssh_error("direct-tcpip"))?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn listen(&self, addr: ListenAddr) -> Result<Box<dyn RemoteListener>> {
        match addr {
            ListenAddr::Tcp { host, port } => {
                self.handle
                    .lock()
                    .await
                    .tcpip_forward(host, port.into())
                    .await
                    .map_err(ssh_error("remote forward"))?;
                Ok(Box::new(TcpListener {
                    forwarded: self.forwarded.clone(),
                }))
            }
            ListenAddr::Unix(path) => Err(Error::RemoteExec {
                message: format!(
                    "remote socket {} needs the datagram or control master transport",
                    path.display()
                ),
            }),
        }
    }

    async fn wait(&self) {
        let mut closed = self.closed.subscribe();
        loop {
            if self.handle.lock().await.is_closed() {
                return;
            }
            tokio::select! {
                _ = closed.wait_for(|c| *c) => return,
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.send_replace(true) {
            return Ok(());
        }
        let res = self
            .handle
            .lock()
            .await
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(ssh_error("disconnect"));
        if let Some(jump) = &self.jump {
            let _ = jump.close().await;
        }
        res
    }
}

struct TcpListener {
    forwarded: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<russh::Channel<Msg>>>>,
}

#[async_trait]
impl RemoteListener for TcpListener {
    async fn accept(&mut self) -> Result<BoxedStream> {
        let channel = self
            .forwarded
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::ConnectionClosed)?;
        Ok(Box::new(channel.into_stream()))
    }
}

enum Command {
    Start(StartRequest, oneshot::Sender<Result<()>>),
    WindowChange(TermSize),
    Close,
}

/// Session whose russh channel is owned by one driver task.
struct TcpSession {
    commands: mpsc::UnboundedSender<Command>,
    io: Mutex<Option<SessionIo>>,
    exit: ExitCell,
}

impl TcpSession {
    fn send(&self, cmd: Command) -> Result<()> {
        self.commands.send(cmd).map_err(|_| Error::ConnectionClosed)
    }
}

#[async_trait]
impl RemoteSession for TcpSession {
    async fn start(&self, request: StartRequest) -> Result<SessionIo> {
        let io = self
            .io
            .lock()
            .ok()
            .and_then(|mut io| io.take())
            .ok_or_else(|| Error::Protocol {
                message: "session already started".into(),
            })?;
        let (tx, rx) = oneshot::channel();
        self.send(Command::Start(request, tx))?;
        rx.await.map_err(|_| Error::ConnectionClosed)??;
        Ok(io)
    }

    async fn window_change(&self, size: TermSize) -> Result<()> {
        self.send(Command::WindowChange(size))
    }

    async fn wait(&self) -> RemoteExit {
        self.exit.wait().await
    }

    async fn close(&self) -> Result<()> {
        if self.exit.get().is_some() {
            return Ok(());
        }
        self.send(Command::Close)
    }
}

fn refused(request: &StartRequest) -> Error {
    let what = match request {
        StartRequest::Shell => "shell",
        StartRequest::Exec(_) => "exec",
        StartRequest::Subsystem(_) => "subsystem",
    };
    Error::RemoteExec {
        message: format!("{} request refused", what),
    }
}

/// Own the channel: forward commands and stdin, route channel messages.
async fn drive_channel(
    mut channel: russh::Channel<Msg>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut stdin: DuplexStream,
    mut sinks: OutputSinks,
    exit: ExitCell,
) {
    let mut buf = vec![0u8; IO_BUFFER_SIZE];
    let mut pending: Option<(StartRequest, oneshot::Sender<Result<()>>)> = None;
    let mut started = false;
    let mut stdin_open = true;
    let mut status = None;

    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(Command::Start(request, reply)) => {
                    let sent = match &request {
                        StartRequest::Shell => channel.request_shell(true).await,
                        StartRequest::Exec(cmd) => channel.exec(true, cmd.as_str()).await,
                        StartRequest::Subsystem(name) => {
                            channel.request_subsystem(true, name.as_str()).await
                        }
                    };
                    match sent {
                        Ok(()) => pending = Some((request, reply)),
                        Err(e) => {
                            let _ = reply.send(Err(ssh_error("start")(e)));
                        }
                    }
                }
                Some(Command::WindowChange(size)) => {
                    if let Err(e) = channel
                        .window_change(size.cols.into(), size.rows.into(), 0, 0)
                        .await
                    {
                        debug!(error = %e, "window change failed");
                    }
                }
                Some(Command::Close) | None => {
                    let _ = channel.close().await;
                    break;
                }
            },
            n = stdin.read(&mut buf), if started && stdin_open => match n {
                Ok(0) | Err(_) => {
                    stdin_open = false;
                    let _ = channel.eof().await;
                }
                Ok(n) => {
                    if let Err(e) = channel.data(&buf[..n]).await {
                        debug!(error = %e, "channel write failed");
                        stdin_open = false;
                    }
                }
            },
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Success) => {
                    if let Some((_, reply)) = pending.take() {
                        started = true;
                        let _ = reply.send(Ok(()));
                    }
                }
                Some(ChannelMsg::Failure) => {
                    if let Some((request, reply)) = pending.take() {
                        let _ = reply.send(Err(refused(&request)));
                        let _ = channel.close().await;
                        break;
                    }
                }
                Some(ChannelMsg::Data { data }) => sinks.stdout(&data).await,
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => sinks.stderr(&data).await,
                Some(ChannelMsg::Eof) => sinks.eof().await,
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    status = Some(RemoteExit::Status(exit_status as i32));
                }
                Some(ChannelMsg::ExitSignal { signal_name, error_message, .. }) => {
                    status = Some(RemoteExit::Signal {
                        signal: format!("{:?}", signal_name),
                        message: error_message,
                    });
                }
                Some(ChannelMsg::Close) | None => break,
                Some(other) => trace!(?other, "ignoring channel message"),
            },
        }
    }

    if let Some((request, reply)) = pending.take() {
        let _ = reply.send(Err(refused(&request)));
    }
    sinks.eof().await;
    exit.set(status.unwrap_or(RemoteExit::Lost));
    debug!("channel driver finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> TcpTarget {
        TcpTarget {
            host: "app.internal".into(),
            port: 22,
            user: "deploy".into(),
            identity_files: vec![PathBuf::from("/tmp/id")],
            proxy_jump: Some("bastion".into()),
        }
    }

    #[test]
    fn jump_host_inherits_user_and_identity() {
        let hop = target().jump_host("bastion").unwrap();
        assert_eq!(hop.host, "bastion");
        assert_eq!(hop.port, 22);
        assert_eq!(hop.user, "deploy");
        assert_eq!(hop.identity_files, vec![PathBuf::from("/tmp/id")]);
        assert!(hop.proxy_jump.is_none());
    }

    #[test]
    fn jump_host_with_user_and_port() {
        let hop = target().jump_host("ops@[2001:db8::1]:2200,second").unwrap();
        assert_eq!(hop.user, "ops");
        assert_eq!(hop.host, "2001:db8::1");
        assert_eq!(hop.port, 2200);
    }

    #[test]
    fn host_port_splitting() {
        assert_eq!(split_host_port("h:22").unwrap(), ("h".into(), Some(22)));
        assert_eq!(split_host_port("h").unwrap(), ("h".into(), None));
        assert_eq!(split_host_port("::1").unwrap(), ("::1".into(), None));
        assert!(split_host_port("h:x").is_err());
        assert!(split_host_port("[h]x").is_err());
    }

    #[test]
    fn default_identities_under_home() {
        let explicit = identity_candidates(&[PathBuf::from("/k")]);
        assert_eq!(explicit, vec![PathBuf::from("/k")]);
        if std::env::var_os("HOME").is_some() {
            let defaults = identity_candidates(&[]);
            assert_eq!(defaults.len(), 3);
            assert!(defaults[0].ends_with(".ssh/id_ed25519"));
        }
    }

    #[test]
    fn refusal_names_the_request() {
        assert_eq!(
            refused(&StartRequest::Subsystem("sftp".into())).to_string(),
            "subsystem request refused"
        );
    }
}
