//! Session handle shared by the pipeline tasks.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{debug, warn};

use resh_core::{ExitCode, Result};

use super::{RemoteExit, RemoteSession};
use crate::terminal::TermSize;

/// A locally decided end of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForcedExit {
    pub code: ExitCode,
    pub reason: String,
}

/// How [`SessionHandle::wait`] finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Remote(RemoteExit),
    Forced(ForcedExit),
}

/// Cloneable handle around a started session.
///
/// Besides forwarding to the session it records the terminal size (for
/// redraw) and the first `force_exit` request.
#[derive(Clone)]
pub struct SessionHandle {
    session: Arc<dyn RemoteSession>,
    forced: Arc<watch::Sender<Option<ForcedExit>>>,
    size: Arc<Mutex<TermSize>>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("forced", &self.forced_exit())
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    pub fn new(session: Arc<dyn RemoteSession>, size: TermSize) -> Self {
        let (forced, _) = watch::channel(None);
        Self {
            session,
            forced: Arc::new(forced),
            size: Arc::new(Mutex::new(size)),
        }
    }

    pub fn session(&self) -> &Arc<dyn RemoteSession> {
        &self.session
    }

    /// End the session locally. Only the first call counts; the session is
    /// closed so every I/O task unblocks.
    pub fn force_exit(&self, code: ExitCode, reason: impl Into<String>) {
        let reason = reason.into();
        let first = self.forced.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(ForcedExit {
                code,
                reason: reason.clone(),
            });
            true
        });
        if !first {
            debug!(?code, "force_exit already requested");
            return;
        }
        debug!(?code, reason = %reason, "forcing session exit");
        let session = self.session.clone();
        tokio::spawn(async move {
            if let Err(e) = session.close().await {
                warn!(error = %e, "closing session failed");
            }
        });
    }

    pub fn forced_exit(&self) -> Option<ForcedExit> {
        self.forced.borrow().clone()
    }

    /// Wait for the remote exit or a forced exit, whichever comes first.
    pub async fn wait(&self) -> SessionOutcome {
        let mut forced = self.forced.subscribe();
        tokio::select! {
            exit = self.session.wait() => match self.forced_exit() {
                Some(f) => SessionOutcome::Forced(f),
                None => SessionOutcome::Remote(exit),
            },
            res = forced.wait_for(Option::is_some) => match res {
                Ok(f) => SessionOutcome::Forced(f.clone().unwrap_or(ForcedExit {
                    code: ExitCode::ConsoleKill,
                    reason: String::new(),
                })),
                Err(_) => SessionOutcome::Remote(self.session.wait().await),
            },
        }
    }

    pub fn size(&self) -> TermSize {
        self.size.lock().map(|s| *s).unwrap_or_default()
    }

    pub async fn window_change(&self, size: TermSize) -> Result<()> {
        if let Ok(mut s) = self.size.lock() {
            *s = size;
        }
        self.session.window_change(size).await
    }

    /// Ask the remote program to repaint at the current size.
    pub async fn redraw(&self) -> Result<()> {
        self.session.redraw(self.size()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::RecordingSession;

    #[tokio::test]
    async fn first_force_exit_wins_and_closes() {
        let session = RecordingSession::new();
        let handle = SessionHandle::new(session.clone(), TermSize::default());
        handle.force_exit(ExitCode::ConsoleKill, "killed by ^~.");
        handle.force_exit(ExitCode::UdpCtrlC, "second");

        let outcome = handle.wait().await;
        assert_eq!(
            outcome,
            SessionOutcome::Forced(ForcedExit {
                code: ExitCode::ConsoleKill,
                reason: "killed by ^~.".into()
            })
        );
        tokio::task::yield_now().await;
        assert!(*session.closed.lock().unwrap());
    }

    #[tokio::test]
    async fn remote_exit_passes_through() {
        let session = RecordingSession::new();
        let handle = SessionHandle::new(session.clone(), TermSize::default());
        session.exit(RemoteExit::Status(3));
        assert_eq!(handle.wait().await, SessionOutcome::Remote(RemoteExit::Status(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn redraw_jiggles_rows() {
        let session = RecordingSession::new();
        let handle = SessionHandle::new(session.clone(), TermSize { cols: 100, rows: 30 });
        handle.redraw().await.unwrap();
        assert_eq!(
            session.resizes(),
            vec![
                TermSize { cols: 100, rows: 29 },
                TermSize { cols: 100, rows: 30 }
            ]
        );
    }
}
