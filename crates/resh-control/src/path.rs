//! ControlPath token expansion.

use std::path::PathBuf;

use sha1::{Digest, Sha1};

use resh_core::options::expand_tilde;
use resh_core::{Error, Result};

/// Values substituted into a ControlPath template.
#[derive(Debug, Clone, Default)]
pub struct PathTokens {
    /// Remote host name after HostName resolution (`%h`).
    pub host: String,
    /// Remote port (`%p`).
    pub port: u16,
    /// Remote user (`%r`).
    pub remote_user: String,
    /// Local user (`%u`).
    pub local_user: String,
    /// Local host name, fully qualified (`%l`).
    pub local_host: String,
    /// Host alias as typed on the command line (`%n`).
    pub alias: String,
    /// Local uid (`%i`).
    pub uid: u32,
}

impl PathTokens {
    /// Fill the local side from the running process.
    pub fn with_local(host: &str, port: u16, remote_user: &str, alias: &str) -> Self {
        let uid = nix::unistd::getuid();
        let local_user = nix::unistd::User::from_uid(uid)
            .ok()
            .flatten()
            .map(|u| u.name)
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_default();
        let local_host = nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_default();
        Self {
            host: host.to_string(),
            port,
            remote_user: remote_user.to_string(),
            local_user,
            local_host,
            alias: alias.to_string(),
            uid: uid.as_raw(),
        }
    }

    /// `%C`: SHA-1 of `%l%h%p%r`, lowercase hex.
    pub fn connection_hash(&self) -> String {
        let mut hasher = Sha1::new();
        hasher.update(self.local_host.as_bytes());
        hasher.update(self.host.as_bytes());
        hasher.update(self.port.to_string().as_bytes());
        hasher.update(self.remote_user.as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

/// Expand `~` and `%` tokens in a ControlPath.
pub fn expand_control_path(template: &str, tokens: &PathTokens) -> Result<PathBuf> {
    let mut out = String::with_capacity(template.len() + 32);
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some('h') => out.push_str(&tokens.host),
            Some('p') => out.push_str(&tokens.port.to_string()),
            Some('r') => out.push_str(&tokens.remote_user),
            Some('u') => out.push_str(&tokens.local_user),
            Some('l') => out.push_str(&tokens.local_host),
            Some('L') => out.push_str(
                tokens
                    .local_host
                    .split('.')
                    .next()
                    .unwrap_or(&tokens.local_host),
            ),
            Some('n') => out.push_str(&tokens.alias),
            Some('C') => out.push_str(&tokens.connection_hash()),
            Some('i') => out.push_str(&tokens.uid.to_string()),
            Some(other) => {
                return Err(Error::Configuration {
                    message: format!("unknown ControlPath token %{} in {:?}", other, template),
                });
            }
            None => {
                return Err(Error::Configuration {
                    message: format!("ControlPath ends with a bare %: {:?}", template),
                });
            }
        }
    }
    Ok(expand_tilde(&out))
}
