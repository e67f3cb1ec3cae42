//! Transport selection and login.
//!
//! Order: a ControlMaster socket when configured (starting a master when
//! the mode allows), else a direct russh connection. With `--udp` the
//! datagram server is launched over that first connection, which is then
//! closed in favour of the tunnel.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use resh_control::{MasterSpec, PathTokens, ensure_master, expand_control_path};
use resh_core::constants::STREAM_DIAL_TIMEOUT;
use resh_core::options::ControlMaster;
use resh_core::tunnel::{LaunchResponse, derive_key};
use resh_core::{Error, ProcessContext, Result, SshOptions};

use crate::cli::Cli;
use crate::transport::datagram::DatagramTransport;
use crate::transport::hostkey::HostKeyVerifier;
use crate::transport::proxy::ProxyTransport;
use crate::transport::tcp::{TcpTarget, TcpTransport};
use crate::transport::{SessionOptions, StartRequest, Transport};

/// Everything login needs, resolved from the command line and options.
#[derive(Debug, Clone)]
pub struct LoginPlan {
    /// Host to dial, after `HostName`.
    pub host: String,
    /// Host as typed on the command line.
    pub alias: String,
    pub port: u16,
    pub user: String,
    pub identity_files: Vec<PathBuf>,
    pub config_file: Option<PathBuf>,
    pub proxy_jump: Option<String>,
    pub control_master: ControlMaster,
    /// Expanded ControlPath.
    pub control_path: Option<PathBuf>,
    pub control_persist: Option<String>,
    /// Switch to the datagram tunnel after login.
    pub datagram: bool,
    pub tsshd_path: String,
    pub alive_timeout: Duration,
}

impl LoginPlan {
    pub fn new(cli: &Cli, opts: &SshOptions, host: String) -> Result<Self> {
        let port = cli.effective_port(opts)?;
        let user = cli.effective_user(opts);
        let alias = cli.host().unwrap_or(&host).to_string();
        let control_path = match opts.control_path() {
            Some(template) => {
                let tokens = PathTokens::with_local(&host, port, &user, &alias);
                Some(expand_control_path(template, &tokens)?)
            }
            None => None,
        };
        Ok(Self {
            port,
            alias,
            identity_files: opts.identity_files(),
            config_file: cli.config_file.clone(),
            proxy_jump: opts.proxy_jump().map(String::from),
            control_master: opts.control_master()?,
            control_path,
            control_persist: opts.control_persist().map(String::from),
            datagram: cli.udp,
            tsshd_path: opts.tsshd_path().to_string(),
            alive_timeout: opts.udp_alive_timeout()?,
            host,
            user,
        })
    }

    fn tcp_target(&self) -> TcpTarget {
        TcpTarget {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            identity_files: self.identity_files.clone(),
            proxy_jump: self.proxy_jump.clone(),
        }
    }

    fn master_spec(&self) -> MasterSpec {
        MasterSpec {
            program: "ssh".into(),
            destination: self.alias.clone(),
            port: Some(self.port),
            user: Some(self.user.clone()),
            identity_files: self.identity_files.clone(),
            config_file: self.config_file.clone(),
            proxy_jump: self.proxy_jump.clone(),
            control_persist: self.control_persist.clone(),
        }
    }
}

/// Log in and return the transport the session will run on.
pub async fn login(
    plan: &LoginPlan,
    opts: &SshOptions,
    ctx: &ProcessContext,
) -> Result<Arc<dyn Transport>> {
    let base = connect_ssh(plan, opts, ctx).await?;
    if !plan.datagram {
        return Ok(base);
    }
    let tunnel = launch_datagram(base.as_ref(), plan).await;
    if let Err(e) = base.close().await {
        debug!(error = %e, "closing bootstrap connection failed");
    }
    Ok(Arc::new(tunnel?))
}

async fn connect_ssh(
    plan: &LoginPlan,
    opts: &SshOptions,
    ctx: &ProcessContext,
) -> Result<Arc<dyn Transport>> {
    if let Some(socket) = &plan.control_path
        && plan.control_master.accepts_proxy()
    {
        match proxy_via_master(plan, socket).await {
            Ok(Some(transport)) => return Ok(Arc::new(transport)),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "control master unavailable, connecting directly"),
        }
    }

    let verifier = HostKeyVerifier::from_options(opts, ctx.clone())?;
    info!(host = %plan.host, port = plan.port, user = %plan.user, "connecting");
    let transport = TcpTransport::connect(&plan.tcp_target(), verifier).await?;
    Ok(Arc::new(transport))
}

async fn proxy_via_master(plan: &LoginPlan, socket: &Path) -> Result<Option<ProxyTransport>> {
    let Some(socket) = ensure_master(plan.control_master, socket, &plan.master_spec()).await?
    else {
        return Ok(None);
    };
    ProxyTransport::connect(&socket).await.map(Some)
}

/// Start the remote datagram server and dial it.
async fn launch_datagram(base: &dyn Transport, plan: &LoginPlan) -> Result<DatagramTransport> {
    let command = format!("{} --kcp", plan.tsshd_path);
    debug!(%command, "launching datagram server");
    let session = base.new_session(SessionOptions::default()).await?;
    let mut io = session.start(StartRequest::Exec(command)).await?;
    io.stdin.shutdown().await?;

    let (mut out, mut err) = (Vec::new(), Vec::new());
    let read = async {
        tokio::try_join!(
            io.stdout.read_to_end(&mut out),
            io.stderr.read_to_end(&mut err)
        )
    };
    tokio::time::timeout(STREAM_DIAL_TIMEOUT, read)
        .await
        .map_err(|_| Error::TransportHandshake {
            message: "datagram server did not answer".into(),
        })??;
    if let Err(e) = session.close().await {
        debug!(error = %e, "closing launch session failed");
    }

    let response = LaunchResponse::parse(&String::from_utf8_lossy(&out)).map_err(|e| {
        let stderr = String::from_utf8_lossy(&err);
        match stderr.trim() {
            "" => e,
            detail => Error::TransportHandshake {
                message: format!("{}: {}", e, detail),
            },
        }
    })?;

    let addr = tokio::net::lookup_host((plan.host.as_str(), response.port))
        .await?
        .next()
        .ok_or_else(|| Error::TransportHandshake {
            message: format!("cannot resolve {}", plan.host),
        })?;
    let key = derive_key(response.pass.as_bytes(), response.salt.as_bytes());
    DatagramTransport::connect(addr, &key, plan.alive_timeout).await
}
