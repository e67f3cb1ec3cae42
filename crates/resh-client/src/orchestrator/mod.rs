//! Lifecycle orchestration.
//!
//! A straight line from parsed arguments to an exit code: options,
//! optional backgrounding, login, the chosen remote action, wait. Every
//! stage maps its failure to its own [`ExitCode`]. Cleanup hooks registered
//! along the way run afterwards through [`ProcessContext::shutdown`].

pub mod background;
mod forward;
mod login;
mod session;
mod upload;
mod waypipe;


use std::fmt;

use tracing::{debug, info};

use resh_core::{CleanupPhase, Error, ExitCode, ProcessContext, Result};

pub use forward::stdio_forward;
pub use login::{LoginPlan, login};
pub use session::{LocalIo, SessionPlan, run_session};
pub use upload::upload_file;
pub use waypipe::{WaypipeBridge, wrap_remote_command};

use crate::cli::Cli;
use crate::terminal::{stdin_is_terminal, stdout_is_terminal};

/// A failed stage: what to print and which code to exit with.
#[derive(Debug)]
pub struct Fatal {
    pub code: ExitCode,
    pub error: Error,
}

impl Fatal {
    pub fn new(code: ExitCode, error: Error) -> Self {
        Self { code, error }
    }
}

impl fmt::Display for Fatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            Error::Context { .. } => write!(f, "{}", self.error),
            other => write!(f, "{}: {}", self.code.stage(), other),
        }
    }
}

impl std::error::Error for Fatal {}

/// Exit status of the whole run: the remote status, or a local failure.
pub type Outcome = std::result::Result<i32, Fatal>;

/// Attach the exit code of a stage to its result.
pub trait Stage<T> {
    fn stage(self, code: ExitCode) -> std::result::Result<T, Fatal>;
}

impl<T> Stage<T> for Result<T> {
    fn stage(self, code: ExitCode) -> std::result::Result<T, Fatal> {
        self.map_err(|error| Fatal::new(code, error))
    }
}

/// Exit code for a login failure.
fn login_code(error: &Error) -> ExitCode {
    match error.root() {
        Error::HostKey { .. } => ExitCode::HostKeyFailed,
        _ => ExitCode::LoginFailed,
    }
}

/// Run the client for one invocation.
pub async fn run(cli: &Cli, ctx: &ProcessContext) -> Outcome {
    cli.validate()
        .map_err(|message| Fatal::new(ExitCode::ArgsInvalid, Error::Configuration { message }))?;
    let opts = cli.ssh_options().stage(ExitCode::UserConfig)?;
    let host = cli.effective_host(&opts).stage(ExitCode::NoDestHost)?;

    if cli.background && !background::is_child() {
        return background::run_parent().await.stage(ExitCode::Background);
    }

    let plan = LoginPlan::new(cli, &opts, host).stage(ExitCode::UserConfig)?;
    let transport = login(&plan, &opts, ctx)
        .await
        .map_err(|e| Fatal::new(login_code(&e), e))?;
    info!(
        kind = transport.kind().as_str(),
        host = %plan.host,
        "logged in"
    );
    {
        let transport = transport.clone();
        ctx.register(CleanupPhase::OnExit, move || async move {
            if let Err(e) = transport.close().await {
                debug!(error = %e, "closing transport failed");
            }
        });
    }

    if background::is_child() {
        background::detach().stage(ExitCode::Background)?;
    }

    let tty = stdin_is_terminal() && stdout_is_terminal();
    let pty = cli.should_allocate_pty(stdin_is_terminal());
    let session_plan =
        SessionPlan::new(cli, &opts, transport.kind(), tty, pty).stage(ExitCode::UserConfig)?;
    let local = LocalIo::stdio(session_plan.pty.is_some() && tty).stage(ExitCode::SetupWinVT)?;
    run_session(transport, cli.remote_action(), session_plan, local, ctx).await
}
