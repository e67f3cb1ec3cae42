//! Host key verification against known_hosts.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use ssh_key::PublicKey;
use tracing::{debug, info, warn};

use resh_core::known_hosts::{
    HostStatus, KnownHosts, append_line, canonicalize_host, format_host_line, key_fingerprint,
};
use resh_core::options::StrictHostKeyChecking;
use resh_core::{Error, HostKeyProblem, ProcessContext, Result, SshOptions};

/// Asks the user a yes/no question.
pub type Confirm = Arc<dyn Fn(&str) -> Result<bool> + Send + Sync>;

/// Checks server keys following `StrictHostKeyChecking`.
#[derive(Clone)]
pub struct HostKeyVerifier {
    policy: StrictHostKeyChecking,
    user_files: Vec<PathBuf>,
    global_files: Vec<PathBuf>,
    ctx: ProcessContext,
    confirm: Confirm,
}

impl std::fmt::Debug for HostKeyVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostKeyVerifier")
            .field("policy", &self.policy)
            .field("user_files", &self.user_files)
            .finish_non_exhaustive()
    }
}

impl HostKeyVerifier {
    pub fn new(
        policy: StrictHostKeyChecking,
        user_files: Vec<PathBuf>,
        global_files: Vec<PathBuf>,
        ctx: ProcessContext,
        confirm: Confirm,
    ) -> Self {
        Self {
            policy,
            user_files,
            global_files,
            ctx,
            confirm,
        }
    }

    /// Build from the option set, prompting on the controlling terminal.
    pub fn from_options(opts: &SshOptions, ctx: ProcessContext) -> Result<Self> {
        Ok(Self::new(
            opts.strict_host_key_checking()?,
            opts.user_known_hosts_files(),
            opts.global_known_hosts_files(),
            ctx,
            Arc::new(crate::terminal::confirm),
        ))
    }

    fn database(&self) -> Result<KnownHosts> {
        let files: Vec<&PathBuf> = self
            .user_files
            .iter()
            .chain(self.global_files.iter())
            .filter(|p| p.exists())
            .collect();
        let mut db = KnownHosts::load(&files)?;
        for line in self.ctx.accepted_host_keys() {
            if let Err(e) = db.add_line(&line) {
                debug!(error = %e, "skipping accepted host key line");
            }
        }
        Ok(db)
    }

    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> Result<()> {
        let status = self.database()?.verify_host(host, port, key);
        debug!(host, port, ?status, "host key lookup");
        match status {
            HostStatus::Known => Ok(()),
            HostStatus::Revoked => {
                eprint!(
                    "Host key {} for {} is marked as revoked.\r\n",
                    key_fingerprint(key),
                    canonicalize_host(host, port)
                );
                Err(Error::HostKey {
                    host: host.to_string(),
                    kind: HostKeyProblem::Revoked,
                })
            }
            HostStatus::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                print_changed_warning(host, port, &expected_fingerprint, &actual_fingerprint);
                Err(Error::HostKey {
                    host: host.to_string(),
                    kind: HostKeyProblem::Changed,
                })
            }
            HostStatus::Unknown => self.handle_unknown(host, port, key),
        }
    }

    fn handle_unknown(&self, host: &str, port: u16, key: &PublicKey) -> Result<()> {
        let unknown = || Error::HostKey {
            host: host.to_string(),
            kind: HostKeyProblem::Unknown,
        };
        match self.policy {
            StrictHostKeyChecking::Yes => {
                eprint!(
                    "No {} host key is known for {} and you have requested strict checking.\r\n",
                    key.algorithm(),
                    canonicalize_host(host, port)
                );
                return Err(unknown());
            }
            StrictHostKeyChecking::Ask => {
                let prompt = format!(
                    "The authenticity of host '{}' can't be established.\r\n\
                     {} key fingerprint is {}.\r\n\
                     Are you sure you want to continue connecting (yes/no)? ",
                    canonicalize_host(host, port),
                    key.algorithm(),
                    key_fingerprint(key)
                );
                if !(self.confirm)(&prompt)? {
                    return Err(unknown());
                }
            }
            StrictHostKeyChecking::AcceptNew | StrictHostKeyChecking::No => {}
        }
        self.remember(host, port, key)
    }

    fn remember(&self, host: &str, port: u16, key: &PublicKey) -> Result<()> {
        let line = format_host_line(host, port, key, false)?;
        self.ctx.accept_host_key(line.clone());
        let Some(path) = self.user_files.first() else {
            return Ok(());
        };
        match append_line(path, &line) {
            Ok(()) => {
                info!(path = %path.display(), host, "added host key");
                eprint!(
                    "Warning: Permanently added '{}' ({}) to the list of known hosts.\r\n",
                    canonicalize_host(host, port),
                    key.algorithm()
                );
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to add host key");
                eprint!("Failed to add the host to the list of known hosts ({}).\r\n", e);
            }
        }
        Ok(())
    }
}

fn print_changed_warning(host: &str, port: u16, expected: &str, actual: &str) {
    let red = "\x1b[0;31m";
    let reset = "\x1b[0m";
    let bar = "@".repeat(59);
    let mut err = std::io::stderr().lock();
    let _ = write!(
        err,
        "{red}{bar}\r\n\
         @    WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED!     @\r\n\
         {bar}{reset}\r\n\
         IT IS POSSIBLE THAT SOMEONE IS DOING SOMETHING NASTY!\r\n\
         Someone could be eavesdropping on you right now (man-in-the-middle attack)!\r\n\
         It is also possible that a host key has just been changed.\r\n\
         The fingerprint for the key sent by {} is\r\n{}.\r\n\
         The known key has fingerprint\r\n{}.\r\n\
         Host key verification failed.\r\n",
        canonicalize_host(host, port),
        actual,
        expected,
    );
    let _ = err.flush();
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    const KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl";
    const OTHER: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIBJJr8YZIyGXQbdA9YyxHnfNm6B4sfo6v8Rax3hgUrXA";

    fn key(s: &str) -> PublicKey {
        PublicKey::from_openssh(s).unwrap()
    }

    fn verifier(
        policy: StrictHostKeyChecking,
        dir: &tempfile::TempDir,
        answer: bool,
    ) -> (HostKeyVerifier, Arc<AtomicUsize>) {
        let asked = Arc::new(AtomicUsize::new(0));
        let counter = asked.clone();
        let v = HostKeyVerifier::new(
            policy,
            vec![dir.path().join("known_hosts")],
            vec![dir.path().join("global")],
            ProcessContext::new(),
            Arc::new(move |_: &str| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(answer)
            }),
        );
        (v, asked)
    }

    #[test]
    fn accept_new_appends_and_then_knows() {
        let dir = tempfile::tempdir().unwrap();
        let (v, asked) = verifier(StrictHostKeyChecking::AcceptNew, &dir, false);
        v.verify("example.com", 22, &key(KEY)).unwrap();
        assert_eq!(asked.load(Ordering::SeqCst), 0);

        let content = std::fs::read_to_string(dir.path().join("known_hosts")).unwrap();
        assert!(content.starts_with("example.com ssh-ed25519 "));
        assert!(content.ends_with('\n') && !content.ends_with("\n\n"));

        v.verify("example.com", 22, &key(KEY)).unwrap();
    }

    #[test]
    fn strict_yes_refuses_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let (v, _) = verifier(StrictHostKeyChecking::Yes, &dir, true);
        let err = v.verify("example.com", 22, &key(KEY)).unwrap_err();
        assert!(matches!(
            err,
            Error::HostKey {
                kind: HostKeyProblem::Unknown,
                ..
            }
        ));
        assert!(!dir.path().join("known_hosts").exists());
    }

    #[test]
    fn ask_declined_is_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let (v, asked) = verifier(StrictHostKeyChecking::Ask, &dir, false);
        assert!(v.verify("example.com", 2222, &key(KEY)).is_err());
        assert_eq!(asked.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn changed_key_is_fatal_even_with_no() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("known_hosts"), format!("example.com {}\n", OTHER)).unwrap();
        let (v, _) = verifier(StrictHostKeyChecking::No, &dir, true);
        let err = v.verify("example.com", 22, &key(KEY)).unwrap_err();
        assert!(matches!(
            err,
            Error::HostKey {
                kind: HostKeyProblem::Changed,
                ..
            }
        ));
    }

    #[test]
    fn accepted_in_process_without_writable_file() {
        let ctx = ProcessContext::new();
        let v = HostKeyVerifier::new(
            StrictHostKeyChecking::Ask,
            Vec::new(),
            Vec::new(),
            ctx.clone(),
            Arc::new(|_: &str| Ok(true)),
        );
        v.verify("localhost", 22, &key(KEY)).unwrap();
        assert_eq!(ctx.accepted_host_keys().len(), 1);

        let strict = HostKeyVerifier::new(
            StrictHostKeyChecking::Yes,
            Vec::new(),
            Vec::new(),
            ctx,
            Arc::new(|_: &str| Ok(false)),
        );
        strict.verify("localhost", 22, &key(KEY)).unwrap();
    }
}
