//! Running the remote action once logged in.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use resh_core::options::WaypipeOptions;
use resh_core::{CleanupPhase, Error, ExitCode, ProcessContext, Result, SshOptions};

use super::waypipe::{WaypipeBridge, wrap_remote_command};
use super::{Fatal, Outcome, Stage, stdio_forward, upload_file};
use crate::cli::{Cli, RemoteAction};
use crate::notification::{Interceptor, NoticeEvent, NotificationConfig};
use crate::pipeline::{
    OutputSink, PassThrough, Pipeline, PipelineConfig, PipelineParts, spawn_resize_forwarder,
};
use crate::terminal::{RawModeGuard, StdinReader, TermSize, get_terminal_size, resize_events};
use crate::transport::{
    BoxedWriter, PtyRequest, RemoteExit, SessionHandle, SessionOptions, SessionOutcome,
    StartRequest, Transport, TransportEvent, TransportKind,
};

/// How long remote output may keep draining after the session ended.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

const DEFAULT_TERM: &str = "xterm-256color";

/// The local side of a session.
pub struct LocalIo {
    pub stdin: StdinReader,
    pub stdout: BoxedWriter,
    pub stderr: BoxedWriter,
    /// Where the escape console draws.
    pub console: BoxedWriter,
    pub resize: Option<mpsc::UnboundedReceiver<TermSize>>,
    /// Put the terminal in raw mode for the session.
    pub raw_mode: bool,
}

impl LocalIo {
    /// The process's own stdio.
    pub fn stdio(interactive: bool) -> Result<Self> {
        let resize = if interactive {
            Some(resize_events()?)
        } else {
            None
        };
        let stdin = if cfg!(windows) && interactive {
            StdinReader::console()
        } else {
            StdinReader::new()
        };
        Ok(Self {
            stdin,
            stdout: Box::new(tokio::io::stdout()),
            stderr: Box::new(tokio::io::stderr()),
            console: Box::new(tokio::io::stderr()),
            resize,
            raw_mode: interactive,
        })
    }
}

/// Session settings derived from options and the local terminal.
#[derive(Debug, Clone)]
pub struct SessionPlan {
    pub pty: Option<PtyRequest>,
    pub env: BTreeMap<String, String>,
    pub tty: bool,
    pub escape_char: Option<u8>,
    pub escape_window: Duration,
    pub notifications: Option<NotificationConfig>,
    pub uploads: Vec<PathBuf>,
    pub waypipe: Option<WaypipeOptions>,
    pub alive_timeout: Duration,
}

impl SessionPlan {
    pub fn new(
        cli: &Cli,
        opts: &SshOptions,
        kind: TransportKind,
        tty: bool,
        pty: bool,
    ) -> Result<Self> {
        let pty = pty.then(|| PtyRequest {
            term: std::env::var("TERM").unwrap_or_else(|_| DEFAULT_TERM.to_string()),
            size: get_terminal_size(),
        });
        let interactive = tty && pty.is_some();
        let escape_char = if interactive {
            opts.escape_char()?
        } else {
            None
        };
        let notifications = if interactive && kind == TransportKind::Datagram {
            Some(NotificationConfig::from_options(opts)?)
        } else {
            None
        };
        Ok(Self {
            pty,
            env: BTreeMap::new(),
            tty,
            escape_char,
            escape_window: opts.console_escape_time()?,
            notifications,
            uploads: cli.upload_file.clone(),
            waypipe: opts.waypipe()?,
            alive_timeout: opts.udp_alive_timeout()?,
        })
    }
}

/// Run the remote action and wait for it to end.
pub async fn run_session(
    transport: Arc<dyn Transport>,
    action: RemoteAction,
    plan: SessionPlan,
    local: LocalIo,
    ctx: &ProcessContext,
) -> Outcome {
    match action {
        RemoteAction::StdioForward { host, port } => {
            debug!(%host, port, "stdio forward");
            let stream = transport
                .dial(&host, port)
                .await
                .stage(ExitCode::IoFwFailed)?;
            stdio_forward(stream, local.stdin, local.stdout)
                .await
                .stage(ExitCode::IoFwFailed)?;
            Ok(0)
        }
        RemoteAction::NoCommand => wait_without_command(transport.as_ref(), &plan).await,
        RemoteAction::Subsystem(name) => {
            let request = StartRequest::Subsystem(name);
            run_interactive(transport, request, plan, local, ctx, ExitCode::SubFwFailed).await
        }
        RemoteAction::Command(command) => {
            let request = prepare(&transport, Some(&command), &plan, ctx, ExitCode::StartFailed)
                .await?;
            run_interactive(transport, request, plan, local, ctx, ExitCode::StartFailed).await
        }
        RemoteAction::Shell => {
            let request = prepare(&transport, None, &plan, ctx, ExitCode::ShellFailed).await?;
            run_interactive(transport, request, plan, local, ctx, ExitCode::ShellFailed).await
        }
    }
}

/// Upload files and set up waypipe before a command or shell starts.
async fn prepare(
    transport: &Arc<dyn Transport>,
    command: Option<&str>,
    plan: &SessionPlan,
    ctx: &ProcessContext,
    code: ExitCode,
) -> std::result::Result<StartRequest, Fatal> {
    for path in &plan.uploads {
        upload_file(transport.as_ref(), path)
            .await
            .map_err(|e| e.with_context(format!("upload {}", path.display())))
            .stage(ExitCode::UploadFailed)?;
        info!(path = %path.display(), "uploaded");
    }

    let bridge = match &plan.waypipe {
        Some(options) => WaypipeBridge::start(transport.clone(), options, ctx)
            .await
            .stage(code)?,
        None => None,
    };
    Ok(match (bridge, command) {
        (Some(bridge), command) => StartRequest::Exec(wrap_remote_command(
            bridge.options(),
            bridge.remote_socket(),
            command,
        )),
        (None, Some(command)) => StartRequest::Exec(command.to_string()),
        (None, None) => StartRequest::Shell,
    })
}

/// `-N`: keep the connection up until it drops or the user interrupts.
async fn wait_without_command(transport: &dyn Transport, plan: &SessionPlan) -> Outcome {
    let mut events = transport.events();
    // The datagram tunnel's wait ends with its last session, and -N has none.
    let closed = async {
        match transport.kind() {
            TransportKind::Datagram => std::future::pending::<()>().await,
            _ => transport.wait().await,
        }
    };
    tokio::pin!(closed);
    loop {
        tokio::select! {
            _ = &mut closed => return Ok(0),
            _ = tokio::signal::ctrl_c() => {
                debug!("interrupted");
                return Ok(0);
            }
            Some(event) = next_event(&mut events) => {
                if event == TransportEvent::AliveTimeout {
                    return Err(Fatal::new(
                        ExitCode::UdpAliveTimeout,
                        Error::ReconnectTimeout { secs: plan.alive_timeout.as_secs() },
                    ));
                }
                debug!(?event, "transport event");
            }
        }
    }
}

async fn next_event(
    events: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn run_interactive(
    transport: Arc<dyn Transport>,
    request: StartRequest,
    plan: SessionPlan,
    local: LocalIo,
    ctx: &ProcessContext,
    code: ExitCode,
) -> Outcome {
    let LocalIo {
        stdin,
        stdout,
        stderr,
        console,
        resize,
        raw_mode,
    } = local;
    let size = plan.pty.as_ref().map(|p| p.size).unwrap_or_default();
    let options = SessionOptions {
        pty: plan.pty.clone(),
        env: plan.env.clone(),
    };
    let session = transport.new_session(options).await.stage(code)?;
    let io = session.start(request).await.stage(code)?;
    let handle = SessionHandle::new(session, size);

    if raw_mode {
        let guard = RawModeGuard::enter().stage(ExitCode::SetupWinVT)?;
        ctx.register_sync(CleanupPhase::OnClose, move || drop(guard));
    }
    ctx.run_cleanup(CleanupPhase::AfterLogin).await;

    let sink = OutputSink::new(stdout, stderr);
    let interceptor = plan
        .notifications
        .clone()
        .map(|config| Interceptor::spawn(config, sink.clone(), handle.clone()));
    let watcher = transport.events().map(|events| {
        spawn_event_watcher(events, interceptor.clone(), handle.clone(), plan.alive_timeout)
    });

    let interactive = plan.tty && plan.pty.is_some();
    let config = PipelineConfig {
        escape_char: plan.escape_char,
        escape_window: plan.escape_window,
        translate_line_endings: cfg!(windows) && plan.pty.is_none(),
        inject_ctrl_z: cfg!(windows) && interactive,
    };
    let parts = PipelineParts {
        io,
        stdin,
        sink,
        console_out: console,
        filter: Arc::new(PassThrough),
        interceptor,
        handle: handle.clone(),
        ctx: ctx.clone(),
    };
    let pipeline = Pipeline::start(parts, config);
    let resizer = resize.map(|sizes| spawn_resize_forwarder(handle.clone(), sizes));

    let outcome = handle.wait().await;
    debug!(?outcome, "session ended");
    if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, pipeline.finish())
        .await
        .is_err()
    {
        debug!("remote output did not drain in time");
    }
    for task in resizer.into_iter().chain(watcher) {
        task.abort();
    }
    if let Err(e) = handle.session().close().await {
        debug!(error = %e, "closing session failed");
    }

    match outcome {
        SessionOutcome::Remote(exit) => {
            if let RemoteExit::Signal { signal, message } = &exit {
                warn!(%signal, %message, "remote process killed by signal");
            }
            Ok(exit.code())
        }
        SessionOutcome::Forced(forced) => Err(Fatal::new(
            forced.code,
            Error::UserAbort {
                reason: forced.reason,
            },
        )),
    }
}

/// Route tunnel health events to the interceptor.
pub(super) fn spawn_event_watcher(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    interceptor: Option<Arc<Interceptor>>,
    handle: SessionHandle,
    alive_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let notice = match event {
                TransportEvent::ConnectionLost(reason) => {
                    warn!(%reason, "connection lost");
                    NoticeEvent::ConnectionLost(reason)
                }
                TransportEvent::ReconnectError(error) => {
                    debug!(%error, "reconnect failed");
                    NoticeEvent::ReconnectError(error)
                }
                TransportEvent::Reconnected => NoticeEvent::Reconnected,
                TransportEvent::AliveTimeout => {
                    handle.force_exit(
                        ExitCode::UdpAliveTimeout,
                        format!("alive timeout after {} seconds", alive_timeout.as_secs()),
                    );
                    break;
                }
            };
            if let Some(interceptor) = &interceptor {
                interceptor.notify(notice);
            }
        }
    })
}
