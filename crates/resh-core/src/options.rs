//! SSH option layer.
//!
//! Collects `-o Key=Value` pairs and the matching blocks of an ssh_config
//! file, then exposes typed accessors for the options resh consumes.
//! Keys are case-insensitive and the first value seen for a key wins,
//! so command-line options must be inserted before the config file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::constants::{
    DEFAULT_CONSOLE_ESCAPE_TIME, DEFAULT_ESCAPE_CHAR, DEFAULT_RECONNECT_WINDOW,
    DEFAULT_TSSHD_PATH, DEFAULT_UDP_ALIVE_TIMEOUT,
};
use crate::error::{Error, Result};

/// Host key checking policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrictHostKeyChecking {
    /// Refuse unknown hosts.
    Yes,
    /// Add unknown hosts silently, refuse changed keys.
    AcceptNew,
    /// Add unknown hosts silently (`no` and `off`).
    No,
    /// Prompt for unknown hosts.
    #[default]
    Ask,
}

impl std::str::FromStr for StrictHostKeyChecking {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "yes" => Ok(Self::Yes),
            "accept-new" => Ok(Self::AcceptNew),
            "no" | "off" => Ok(Self::No),
            "ask" => Ok(Self::Ask),
            other => Err(Error::Configuration {
                message: format!("invalid StrictHostKeyChecking value: {}", other),
            }),
        }
    }
}

/// ControlMaster mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlMaster {
    #[default]
    No,
    Yes,
    Ask,
    Auto,
    AutoAsk,
}

impl ControlMaster {
    /// Whether this mode lets resh proxy through a control socket.
    pub fn accepts_proxy(self) -> bool {
        !matches!(self, ControlMaster::No)
    }

    /// Whether the spawned master should confirm with the user.
    pub fn asks(self) -> bool {
        matches!(self, ControlMaster::Ask | ControlMaster::AutoAsk)
    }
}

impl std::str::FromStr for ControlMaster {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "no" => Ok(Self::No),
            "yes" => Ok(Self::Yes),
            "ask" => Ok(Self::Ask),
            "auto" => Ok(Self::Auto),
            "autoask" => Ok(Self::AutoAsk),
            other => Err(Error::Configuration {
                message: format!("invalid ControlMaster value: {}", other),
            }),
        }
    }
}

/// Waypipe settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaypipeOptions {
    pub client_path: String,
    pub server_path: String,
    pub client_args: Vec<String>,
    pub server_args: Vec<String>,
}

/// Case-insensitive, first-wins option map.
#[derive(Debug, Clone, Default)]
pub struct SshOptions {
    values: Vec<(String, String)>,
}

impl SshOptions {
    /// Create an empty option set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `-o` arguments (`Key=Value` or `Key Value`).
    pub fn from_cli(args: &[String]) -> Result<Self> {
        let mut opts = Self::new();
        for arg in args {
            let (key, value) = split_option(arg).ok_or_else(|| Error::Configuration {
                message: format!("invalid option: {}", arg),
            })?;
            opts.insert(key, value);
        }
        Ok(opts)
    }

    /// Insert unless the key is already set. `IdentityFile` accumulates.
    pub fn insert(&mut self, key: &str, value: &str) {
        let key = key.to_ascii_lowercase();
        let multi = key == "identityfile";
        if self
            .values
            .iter()
            .any(|(k, v)| *k == key && (!multi || v == value))
        {
            return;
        }
        self.values.push((key, value.to_string()));
    }

    /// Look up a raw value.
    pub fn get(&self, key: &str) -> Option<&str> {
        let key = key.to_ascii_lowercase();
        self.values
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Merge the blocks of an ssh_config file that apply to `host`.
    pub fn merge_config_file(&mut self, path: &Path, host: &str) -> Result<()> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::Configuration {
            message: format!("cannot read {}: {}", path.display(), e),
        })?;
        self.merge_config_str(&content, host);
        debug!(path = %path.display(), host, "merged ssh config");
        Ok(())
    }

    /// Merge ssh_config text. Only `Host` blocks are understood; `Match`
    /// blocks are skipped.
    pub fn merge_config_str(&mut self, content: &str, host: &str) {
        let mut active = true;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = split_option(line) else {
                continue;
            };
            if key.eq_ignore_ascii_case("host") {
                active = host_matches(value, host);
                continue;
            }
            if key.eq_ignore_ascii_case("match") {
                active = false;
                continue;
            }
            if active {
                self.insert(key, value.trim_matches('"'));
            }
        }
    }

    fn yes_no(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => parse_yes_no(v).ok_or_else(|| Error::Configuration {
                message: format!("invalid {} value: {}", key, v),
            }),
        }
    }

    fn seconds(&self, key: &str, default: Duration) -> Result<Duration> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => v
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|s| s.is_finite() && *s >= 0.0)
                .map(Duration::from_secs_f64)
                .ok_or_else(|| Error::Configuration {
                    message: format!("invalid {} value: {}", key, v),
                }),
        }
    }

    pub fn strict_host_key_checking(&self) -> Result<StrictHostKeyChecking> {
        self.get("StrictHostKeyChecking")
            .map(str::parse)
            .unwrap_or(Ok(StrictHostKeyChecking::default()))
    }

    /// User known_hosts files; the first one is where new keys are written.
    pub fn user_known_hosts_files(&self) -> Vec<PathBuf> {
        match self.get("UserKnownHostsFile") {
            Some(v) => v.split_whitespace().map(expand_tilde).collect(),
            None => vec![expand_tilde("~/.ssh/known_hosts")],
        }
    }

    pub fn global_known_hosts_files(&self) -> Vec<PathBuf> {
        match self.get("GlobalKnownHostsFile") {
            Some(v) => v.split_whitespace().map(expand_tilde).collect(),
            None => vec![
                PathBuf::from("/etc/ssh/ssh_known_hosts"),
                PathBuf::from("/etc/ssh/ssh_known_hosts2"),
            ],
        }
    }

    pub fn control_master(&self) -> Result<ControlMaster> {
        self.get("ControlMaster")
            .map(str::parse)
            .unwrap_or(Ok(ControlMaster::default()))
    }

    /// Unexpanded ControlPath, `None` when unset or `none`.
    pub fn control_path(&self) -> Option<&str> {
        self.get("ControlPath")
            .filter(|p| !p.eq_ignore_ascii_case("none") && !p.is_empty())
    }

    pub fn control_persist(&self) -> Option<&str> {
        self.get("ControlPersist")
    }

    /// Escape character, `None` when disabled.
    pub fn escape_char(&self) -> Result<Option<u8>> {
        match self.get("EscapeChar") {
            None => Ok(Some(DEFAULT_ESCAPE_CHAR)),
            Some(v) => parse_escape_char(v),
        }
    }

    pub fn console_escape_time(&self) -> Result<Duration> {
        self.seconds("ConsoleEscapeTime", DEFAULT_CONSOLE_ESCAPE_TIME)
    }

    pub fn udp_alive_timeout(&self) -> Result<Duration> {
        self.seconds("UdpAliveTimeout", DEFAULT_UDP_ALIVE_TIMEOUT)
    }

    pub fn udp_reconnect_timeout(&self) -> Result<Duration> {
        self.seconds("UdpReconnectTimeout", DEFAULT_RECONNECT_WINDOW)
    }

    pub fn show_notification_on_top(&self) -> Result<bool> {
        self.yes_no("ShowNotificationOnTop", true)
    }

    pub fn show_full_notifications(&self) -> Result<bool> {
        self.yes_no("ShowFullNotifications", false)
    }

    pub fn tsshd_path(&self) -> &str {
        self.get("TsshdPath").unwrap_or(DEFAULT_TSSHD_PATH)
    }

    /// Waypipe settings, `None` unless `EnableWaypipe yes`.
    pub fn waypipe(&self) -> Result<Option<WaypipeOptions>> {
        if !self.yes_no("EnableWaypipe", false)? {
            return Ok(None);
        }
        let split = |key: &str| {
            self.get(key)
                .map(|v| v.split_whitespace().map(String::from).collect())
                .unwrap_or_default()
        };
        Ok(Some(WaypipeOptions {
            client_path: self.get("WaypipeClientPath").unwrap_or("waypipe").to_string(),
            server_path: self.get("WaypipeServerPath").unwrap_or("waypipe").to_string(),
            client_args: split("WaypipeClientOption"),
            server_args: split("WaypipeServerOption"),
        }))
    }

    pub fn hostname(&self) -> Option<&str> {
        self.get("HostName")
    }

    pub fn port(&self) -> Result<Option<u16>> {
        self.get("Port")
            .map(|p| {
                p.parse().map_err(|_| Error::Configuration {
                    message: format!("invalid Port value: {}", p),
                })
            })
            .transpose()
    }

    pub fn user(&self) -> Option<&str> {
        self.get("User")
    }

    pub fn identity_files(&self) -> Vec<PathBuf> {
        self.values
            .iter()
            .filter(|(k, _)| k == "identityfile")
            .map(|(_, v)| expand_tilde(v))
            .collect()
    }

    pub fn proxy_jump(&self) -> Option<&str> {
        self.get("ProxyJump").filter(|v| !v.eq_ignore_ascii_case("none"))
    }
}

fn split_option(s: &str) -> Option<(&str, &str)> {
    let s = s.trim();
    let idx = s.find(|c: char| c == '=' || c.is_whitespace())?;
    let key = &s[..idx];
    let rest = s[idx..].trim_start();
    let value = rest.strip_prefix('=').unwrap_or(rest).trim();
    if key.is_empty() || value.is_empty() {
        return None;
    }
    Some((key, value))
}

fn parse_yes_no(v: &str) -> Option<bool> {
    match v.to_ascii_lowercase().as_str() {
        "yes" | "true" | "on" => Some(true),
        "no" | "false" | "off" => Some(false),
        _ => None,
    }
}

/// Parse an `EscapeChar` value: a printable character, `^X`, or `none`.
pub fn parse_escape_char(v: &str) -> Result<Option<u8>> {
    if v.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    let bytes = v.as_bytes();
    match bytes {
        [c] if c.is_ascii_graphic() => Ok(Some(*c)),
        [b'^', c] if (b'@'..=b'_').contains(&c.to_ascii_uppercase()) => {
            Ok(Some(c.to_ascii_uppercase() & 0x1f))
        }
        _ => Err(Error::Configuration {
            message: format!("invalid EscapeChar value: {}", v),
        }),
    }
}

/// Display form of an escape character (`~`, `^]`).
pub fn escape_char_display(c: u8) -> String {
    if c < 0x20 {
        format!("^{}", (c | 0x40) as char)
    } else {
        (c as char).to_string()
    }
}

/// Whether a `Host` line's pattern list matches `host`.
pub fn host_matches(patterns: &str, host: &str) -> bool {
    let mut matched = false;
    for pattern in patterns.split_whitespace() {
        if let Some(negated) = pattern.strip_prefix('!') {
            if glob_match(negated, host) {
                return false;
            }
        } else if glob_match(pattern, host) {
            matched = true;
        }
    }
    matched
}

/// `*` and `?` globbing as used by ssh_config.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi].eq_ignore_ascii_case(&t[ti])) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}

/// Expand a leading `~` to `$HOME`.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Ok(home) = std::env::var("HOME")
    {
        return PathBuf::from(home).join(rest);
    }
    if path == "~"
        && let Ok(home) = std::env::var("HOME")
    {
        return PathBuf::from(home);
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(args: &[&str]) -> SshOptions {
        SshOptions::from_cli(&args.iter().map(|s| s.to_string()).collect::<Vec<_>>()).unwrap()
    }

    #[test]
    fn keys_are_case_insensitive_first_wins() {
        let o = opts(&["escapechar=%", "EscapeChar=~"]);
        assert_eq!(o.get("ESCAPECHAR"), Some("%"));
        assert_eq!(o.escape_char().unwrap(), Some(b'%'));
    }

    #[test]
    fn space_separated_option() {
        let o = opts(&["ConsoleEscapeTime 2.5"]);
        assert_eq!(o.console_escape_time().unwrap(), Duration::from_millis(2500));
    }

    #[test]
    fn invalid_option_rejected() {
        let err = SshOptions::from_cli(&["NoValue".to_string()]).unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn escape_char_forms() {
        assert_eq!(parse_escape_char("~").unwrap(), Some(b'~'));
        assert_eq!(parse_escape_char("^]").unwrap(), Some(0x1d));
        assert_eq!(parse_escape_char("^a").unwrap(), Some(0x01));
        assert_eq!(parse_escape_char("none").unwrap(), None);
        assert!(parse_escape_char("ab").is_err());
        assert_eq!(escape_char_display(0x1d), "^]");
        assert_eq!(escape_char_display(b'~'), "~");
    }

    #[test]
    fn defaults() {
        let o = SshOptions::new();
        assert_eq!(o.escape_char().unwrap(), Some(b'~'));
        assert_eq!(o.udp_alive_timeout().unwrap(), Duration::from_secs(100));
        assert_eq!(o.console_escape_time().unwrap(), Duration::from_secs(1));
        assert_eq!(
            o.strict_host_key_checking().unwrap(),
            StrictHostKeyChecking::Ask
        );
        assert_eq!(o.control_master().unwrap(), ControlMaster::No);
        assert!(o.waypipe().unwrap().is_none());
        assert_eq!(o.tsshd_path(), "tsshd");
    }

    #[test]
    fn strict_host_key_checking_values() {
        for (v, want) in [
            ("yes", StrictHostKeyChecking::Yes),
            ("accept-new", StrictHostKeyChecking::AcceptNew),
            ("no", StrictHostKeyChecking::No),
            ("off", StrictHostKeyChecking::No),
            ("ASK", StrictHostKeyChecking::Ask),
        ] {
            assert_eq!(v.parse::<StrictHostKeyChecking>().unwrap(), want);
        }
        assert!("maybe".parse::<StrictHostKeyChecking>().is_err());
    }

    #[test]
    fn control_master_modes() {
        assert!(!ControlMaster::No.accepts_proxy());
        assert!("autoask".parse::<ControlMaster>().unwrap().asks());
        assert!("auto".parse::<ControlMaster>().unwrap().accepts_proxy());
        assert!(opts(&["ControlPath=none"]).control_path().is_none());
    }

    #[test]
    fn config_file_host_blocks() {
        let mut o = opts(&["Port=2200"]);
        o.merge_config_str(
            "Host other\n  User nobody\n\nHost *.example.com !bad.example.com\n  User alice\n  Port 22\n  EnableWaypipe yes\n\nHost *\n  User fallback\n",
            "box.example.com",
        );
        assert_eq!(o.user(), Some("alice"));
        assert_eq!(o.port().unwrap(), Some(2200));
        assert!(o.waypipe().unwrap().is_some());

        let mut bad = SshOptions::new();
        bad.merge_config_str("Host *.example.com !bad.example.com\n  User alice\nHost *\n  User fallback\n", "bad.example.com");
        assert_eq!(bad.user(), Some("fallback"));
    }

    #[test]
    fn glob_matching() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("web?", "web1"));
        assert!(!glob_match("web?", "web12"));
        assert!(glob_match("*.example.com", "a.b.example.com"));
        assert!(!glob_match("*.example.com", "example.org"));
    }

    #[test]
    fn identity_files_accumulate() {
        let o = opts(&["IdentityFile=/a", "IdentityFile=/b", "IdentityFile=/a"]);
        assert_eq!(
            o.identity_files(),
            vec![PathBuf::from("/a"), PathBuf::from("/b")]
        );
    }
}
