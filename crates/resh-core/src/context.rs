//! Process context threaded through the client lifecycle.
//!
//! Holds the three cleanup hook lists, the output pause flag, and the host
//! key lines accepted during this run. Each piece has its own lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, join_all};
use tracing::{debug, warn};

/// Cleanup phase, run in this order on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupPhase {
    /// Session is closing: restore terminal modes, stop forwarders.
    OnClose,
    /// Login finished and the shell is up: release login-time resources.
    AfterLogin,
    /// Last-ditch process-wide cleanup.
    OnExit,
}

type Hook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

#[derive(Default)]
struct Inner {
    on_close: Mutex<Vec<Hook>>,
    after_login: Mutex<Vec<Hook>>,
    on_exit: Mutex<Vec<Hook>>,
    pause_output: AtomicBool,
    accepted_host_keys: Mutex<Vec<String>>,
}

/// Shared process-wide state. Cloning is cheap.
#[derive(Clone, Default)]
pub struct ProcessContext {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ProcessContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessContext")
            .field("pause_output", &self.is_output_paused())
            .finish_non_exhaustive()
    }
}

impl ProcessContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn hooks(&self, phase: CleanupPhase) -> &Mutex<Vec<Hook>> {
        match phase {
            CleanupPhase::OnClose => &self.inner.on_close,
            CleanupPhase::AfterLogin => &self.inner.after_login,
            CleanupPhase::OnExit => &self.inner.on_exit,
        }
    }

    /// Register an async cleanup hook.
    pub fn register<F, Fut>(&self, phase: CleanupPhase, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hook: Hook = Box::new(move || hook().boxed());
        if let Ok(mut hooks) = self.hooks(phase).lock() {
            hooks.push(hook);
        }
    }

    /// Register a synchronous cleanup hook.
    pub fn register_sync<F>(&self, phase: CleanupPhase, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.register(phase, move || async move { hook() });
    }

    /// Run and drain the hooks of one phase.
    ///
    /// Hooks are started newest first and run concurrently; this returns once
    /// all of them finished. A panicking hook is logged and does not stop
    /// the others.
    pub async fn run_cleanup(&self, phase: CleanupPhase) {
        let hooks: Vec<Hook> = match self.hooks(phase).lock() {
            Ok(mut hooks) => hooks.drain(..).rev().collect(),
            Err(_) => return,
        };
        if hooks.is_empty() {
            return;
        }
        debug!(?phase, count = hooks.len(), "running cleanup hooks");
        let handles: Vec<_> = hooks.into_iter().map(|h| tokio::spawn(h())).collect();
        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!(?phase, error = %e, "cleanup hook failed");
            }
        }
    }

    /// Run every phase in order.
    pub async fn shutdown(&self) {
        self.run_cleanup(CleanupPhase::OnClose).await;
        self.run_cleanup(CleanupPhase::AfterLogin).await;
        self.run_cleanup(CleanupPhase::OnExit).await;
    }

    pub fn set_output_paused(&self, paused: bool) {
        self.inner.pause_output.store(paused, Ordering::SeqCst);
    }

    pub fn is_output_paused(&self) -> bool {
        self.inner.pause_output.load(Ordering::SeqCst)
    }

    /// Remember a host key line accepted in this process.
    pub fn accept_host_key(&self, line: String) {
        if let Ok(mut keys) = self.inner.accepted_host_keys.lock()
            && !keys.contains(&line)
        {
            keys.push(line);
        }
    }

    /// Host key lines accepted so far, in insertion order.
    pub fn accepted_host_keys(&self) -> Vec<String> {
        self.inner
            .accepted_host_keys
            .lock()
            .map(|k| k.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn hooks_start_lifo_and_all_finish() {
        let ctx = ProcessContext::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            ctx.register_sync(CleanupPhase::OnClose, move || {
                order.lock().unwrap().push(i);
            });
        }
        ctx.run_cleanup(CleanupPhase::OnClose).await;
        let mut seen = order.lock().unwrap().clone();
        assert_eq!(seen.len(), 3);
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2]);

        // drained
        ctx.run_cleanup(CleanupPhase::OnClose).await;
        assert_eq!(order.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn hooks_run_concurrently() {
        let ctx = ProcessContext::new();
        for _ in 0..4 {
            ctx.register(CleanupPhase::OnExit, || async {
                tokio::time::sleep(Duration::from_secs(1)).await;
            });
        }
        let start = tokio::time::Instant::now();
        ctx.run_cleanup(CleanupPhase::OnExit).await;
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn panicking_hook_does_not_abort_others() {
        let ctx = ProcessContext::new();
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        ctx.register_sync(CleanupPhase::AfterLogin, move || {
            flag.store(true, Ordering::SeqCst);
        });
        ctx.register_sync(CleanupPhase::AfterLogin, || panic!("boom"));
        ctx.run_cleanup(CleanupPhase::AfterLogin).await;
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn pause_flag_and_accepted_keys() {
        let ctx = ProcessContext::new();
        assert!(!ctx.is_output_paused());
        ctx.set_output_paused(true);
        assert!(ctx.clone().is_output_paused());

        ctx.accept_host_key("a ssh-ed25519 X".into());
        ctx.accept_host_key("b ssh-ed25519 Y".into());
        ctx.accept_host_key("a ssh-ed25519 X".into());
        assert_eq!(ctx.accepted_host_keys(), vec!["a ssh-ed25519 X", "b ssh-ed25519 Y"]);
    }
}
