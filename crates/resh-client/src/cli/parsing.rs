//! CLI parsing functions and methods.

use std::borrow::Cow;
use std::path::Path;

use resh_core::constants::DEFAULT_SSH_PORT;
use resh_core::options::expand_tilde;
use resh_core::{Error, Result, SshOptions};

use super::types::{Cli, RemoteAction};

impl Cli {
    /// Check flag combinations clap cannot express.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.subsystem && self.command.len() != 1 {
            return Err("-s requires exactly one subsystem name after the destination".into());
        }
        if self.stdio_forward.is_some() && !self.command.is_empty() {
            return Err("-W cannot be combined with a remote command".into());
        }
        if self.no_command && !self.command.is_empty() {
            return Err("-N cannot be combined with a remote command".into());
        }
        if self.no_command && !self.upload_file.is_empty() {
            return Err("--upload-file needs a shell or command session".into());
        }
        Ok(())
    }

    /// Parse the destination into user and host components.
    ///
    /// Accepts `host`, `user@host` and `ssh://[user@]host[:port]`.
    pub fn parse_destination(&self) -> Option<(Option<&str>, &str)> {
        let dest = self.destination.as_deref()?;
        let dest = dest.strip_prefix("ssh://").unwrap_or(dest);
        match dest.rfind('@') {
            Some(at) => Some((Some(&dest[..at]), &dest[at + 1..])),
            None => Some((None, dest)),
        }
    }

    /// Host alias as typed, without user or URI port.
    pub fn host(&self) -> Option<&str> {
        let (_, host) = self.parse_destination()?;
        if self.destination.as_deref()?.starts_with("ssh://")
            && let Some((h, p)) = host.rsplit_once(':')
            && p.parse::<u16>().is_ok()
        {
            return Some(h);
        }
        Some(host)
    }

    /// Port embedded in an `ssh://` destination.
    fn uri_port(&self) -> Option<u16> {
        if !self.destination.as_deref()?.starts_with("ssh://") {
            return None;
        }
        let (_, host) = self.parse_destination()?;
        host.rsplit_once(':').and_then(|(_, p)| p.parse().ok())
    }

    /// Build the option set: `-o` first, then the flags, then the config file.
    pub fn ssh_options(&self) -> Result<SshOptions> {
        let mut opts = SshOptions::from_cli(&self.ssh_option)?;
        if let Some(port) = self.port.or_else(|| self.uri_port()) {
            opts.insert("Port", &port.to_string());
        }
        if let Some(user) = self.effective_cli_user() {
            opts.insert("User", user);
        }
        for identity in &self.identity {
            opts.insert("IdentityFile", &identity.display().to_string());
        }
        if let Some(jump) = &self.proxy_jump {
            opts.insert("ProxyJump", jump);
        }
        let host = self.host().unwrap_or_default();
        match &self.config_file {
            Some(path) => opts.merge_config_file(path, host)?,
            None => {
                let default = expand_tilde("~/.ssh/config");
                if Path::new(&default).exists() {
                    opts.merge_config_file(&default, host)?;
                }
            }
        }
        Ok(opts)
    }

    /// User from `-l` or the destination, not yet merged with config.
    fn effective_cli_user(&self) -> Option<&str> {
        if let Some(login) = &self.login {
            return Some(login.as_str());
        }
        self.parse_destination()?.0
    }

    /// Remote user after all sources are merged; falls back to the local user.
    pub fn effective_user(&self, opts: &SshOptions) -> String {
        opts.user()
            .map(String::from)
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "root".to_string())
    }

    /// Host to dial, honoring `HostName`.
    pub fn effective_host(&self, opts: &SshOptions) -> Result<String> {
        let alias = self.host().filter(|h| !h.is_empty()).ok_or_else(|| {
            Error::Configuration {
                message: "no destination host".into(),
            }
        })?;
        Ok(opts
            .hostname()
            .map(|h| h.replace("%h", alias))
            .unwrap_or_else(|| alias.to_string()))
    }

    pub fn effective_port(&self, opts: &SshOptions) -> Result<u16> {
        Ok(opts.port()?.unwrap_or(DEFAULT_SSH_PORT))
    }

    /// Get the command to execute, if any, shell-escaped for remote execution.
    pub fn command_string(&self) -> Option<String> {
        match self.command.as_slice() {
            [] => None,
            // A single argument is passed as typed, like ssh does.
            [single] => Some(single.clone()),
            args => Some(
                args.iter()
                    .map(|arg| shell_escape::escape(Cow::Borrowed(arg.as_str())).into_owned())
                    .collect::<Vec<_>>()
                    .join(" "),
            ),
        }
    }

    /// What the session should do after login.
    pub fn remote_action(&self) -> RemoteAction {
        if let Some((host, port)) = &self.stdio_forward {
            return RemoteAction::StdioForward {
                host: host.clone(),
                port: *port,
            };
        }
        if self.subsystem
            && let Some(name) = self.command.first()
        {
            return RemoteAction::Subsystem(name.clone());
        }
        if self.no_command {
            return RemoteAction::NoCommand;
        }
        match self.command_string() {
            Some(cmd) => RemoteAction::Command(cmd),
            None => RemoteAction::Shell,
        }
    }

    /// Determine if a PTY should be allocated.
    ///
    /// Follows SSH semantics:
    /// - `-t` forces a PTY
    /// - `-T`, `-N`, `-W` and `-s` never get one
    /// - otherwise only an interactive shell on a terminal gets one
    pub fn should_allocate_pty(&self, stdin_is_tty: bool) -> bool {
        if self.disable_pty
            || self.no_command
            || self.subsystem
            || self.stdio_forward.is_some()
        {
            return false;
        }
        if self.force_pty {
            return true;
        }
        self.command.is_empty() && stdin_is_tty
    }
}

/// Parse `-W host:port`. IPv6 hosts may be bracketed.
pub fn parse_stdio_forward(s: &str) -> std::result::Result<(String, u16), String> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| "expected HOST:PORT".to_string())?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err("host must not be empty".to_string());
    }
    let port: u16 = port.parse().map_err(|e| format!("invalid port: {}", e))?;
    if port == 0 {
        return Err("port must be greater than 0".to_string());
    }
    Ok((host.to_string(), port))
}
