//! Known hosts file parsing, verification and appending.
//!
//! Supports the OpenSSH known_hosts format:
//! - Plain host lists with `*`/`?` wildcards and `!` negation
//! - Hashed hostname entries (`|1|salt|hash`)
//! - `@revoked` markers (`@cert-authority` lines are skipped)
//! - Port-specific entries (`[host]:port`)

use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, Read, Seek, SeekFrom, Write};
use std::path::Path;

use base64::prelude::*;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use ssh_key::HashAlg;
use ssh_key::public::PublicKey;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::options::glob_match;

/// Status of a host key lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostStatus {
    /// Key is known and matches.
    Known,
    /// Host is not in known_hosts.
    Unknown,
    /// Host is known but key has changed.
    Changed {
        /// The expected key fingerprint.
        expected_fingerprint: String,
        /// The actual key fingerprint.
        actual_fingerprint: String,
    },
    /// Key is explicitly revoked.
    Revoked,
}

#[derive(Debug, Clone)]
struct KnownHostEntry {
    host_pattern: HostPattern,
    key: PublicKey,
    revoked: bool,
}

#[derive(Debug, Clone)]
enum HostPattern {
    /// Comma-separated patterns.
    Plain(Vec<String>),
    /// `|1|salt|hash`.
    Hashed { salt: Vec<u8>, hash: Vec<u8> },
}

impl HostPattern {
    fn matches(&self, hostname: &str) -> bool {
        match self {
            HostPattern::Plain(patterns) => {
                let mut matched = false;
                for p in patterns {
                    if let Some(neg) = p.strip_prefix('!') {
                        if glob_match(neg, hostname) {
                            return false;
                        }
                    } else if glob_match(p, hostname) {
                        matched = true;
                    }
                }
                matched
            }
            HostPattern::Hashed { salt, hash } => compute_host_hash(hostname, salt) == *hash,
        }
    }
}

/// HMAC-SHA1 of the hostname keyed by the salt, as OpenSSH hashes hosts.
fn compute_host_hash(hostname: &str, salt: &[u8]) -> Vec<u8> {
    Hmac::<Sha1>::new_from_slice(salt)
        .map(|mut mac| {
            mac.update(hostname.as_bytes());
            mac.finalize().into_bytes().to_vec()
        })
        .unwrap_or_default()
}

fn generate_salt() -> Vec<u8> {
    use rand::RngCore;
    let mut salt = vec![0u8; 20];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Host name as it appears in known_hosts: bare for port 22, `[host]:port` otherwise.
pub fn canonicalize_host(hostname: &str, port: u16) -> String {
    if port == 22 {
        hostname.to_string()
    } else {
        format!("[{}]:{}", hostname, port)
    }
}

/// SHA256 fingerprint in OpenSSH display form.
pub fn key_fingerprint(key: &PublicKey) -> String {
    key.fingerprint(HashAlg::Sha256).to_string()
}

/// Known hosts database.
#[derive(Debug, Default)]
pub struct KnownHosts {
    entries: Vec<KnownHostEntry>,
}

impl KnownHosts {
    /// Create an empty known hosts database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and concatenate every existing file in `paths`.
    pub fn load(paths: &[impl AsRef<Path>]) -> Result<Self> {
        let mut kh = Self::new();
        for path in paths {
            let path = path.as_ref();
            if !path.exists() {
                continue;
            }
            match Self::load_file(path) {
                Ok(loaded) => {
                    debug!(
                        path = %path.display(),
                        count = loaded.entries.len(),
                        "loaded known_hosts"
                    );
                    kh.entries.extend(loaded.entries);
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "failed to load known_hosts");
                }
            }
        }
        Ok(kh)
    }

    fn load_file(path: &Path) -> Result<Self> {
        let file = fs::File::open(path)?;
        let mut kh = Self::new();
        for (line_num, line) in io::BufReader::new(file).lines().enumerate() {
            let line = line?;
            if let Err(e) = kh.add_line(&line) {
                debug!(
                    path = %path.display(),
                    line = line_num + 1,
                    error = %e,
                    "failed to parse known_hosts entry, skipping"
                );
            }
        }
        Ok(kh)
    }

    /// Parse one known_hosts line into the in-memory set.
    pub fn add_line(&mut self, line: &str) -> Result<()> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(());
        }
        if line.starts_with("@cert-authority") {
            warn!("@cert-authority not supported, skipping");
            return Ok(());
        }
        let (revoked, key_line) = match line.strip_prefix("@revoked") {
            Some(rest) => (true, rest.trim_start()),
            None => (false, line),
        };
        let (host_pattern, key) = parse_known_hosts_line(key_line)?;
        self.entries.push(KnownHostEntry {
            host_pattern,
            key,
            revoked,
        });
        Ok(())
    }

    /// Verify a host key.
    pub fn verify_host(&self, hostname: &str, port: u16, key: &PublicKey) -> HostStatus {
        let canonical = canonicalize_host(hostname, port);

        let mut found_host = false;
        for entry in &self.entries {
            if !entry.host_pattern.matches(&canonical) {
                continue;
            }
            found_host = true;
            if entry.key.key_data() == key.key_data() {
                if entry.revoked {
                    return HostStatus::Revoked;
                }
                return HostStatus::Known;
            }
        }

        if found_host
            && let Some(entry) = self
                .entries
                .iter()
                .find(|e| !e.revoked && e.host_pattern.matches(&canonical))
        {
            return HostStatus::Changed {
                expected_fingerprint: key_fingerprint(&entry.key),
                actual_fingerprint: key_fingerprint(key),
            };
        }

        HostStatus::Unknown
    }

    /// Number of parsed entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Format a known_hosts line for `hostname:port`, hashed or plain.
pub fn format_host_line(hostname: &str, port: u16, key: &PublicKey, hashed: bool) -> Result<String> {
    let canonical = canonicalize_host(hostname, port);
    let host_part = if hashed {
        let salt = generate_salt();
        let hash = compute_host_hash(&canonical, &salt);
        format!(
            "|1|{}|{}",
            BASE64_STANDARD.encode(&salt),
            BASE64_STANDARD.encode(&hash)
        )
    } else {
        canonical
    };
    let key_openssh = key.to_openssh().map_err(|e| Error::Protocol {
        message: format!("failed to encode public key: {}", e),
    })?;
    Ok(format!("{} {}", host_part, key_openssh))
}

/// Append one line to a known_hosts file.
///
/// Afterwards the file ends with exactly one newline, even when the
/// previous content lacked a trailing newline.
pub fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?;

    let len = file.metadata()?.len();
    let mut out = String::new();
    if len > 0 {
        let mut last = [0u8; 1];
        file.seek(SeekFrom::End(-1))?;
        file.read_exact(&mut last)?;
        if last[0] != b'\n' {
            out.push('\n');
        }
    }
    out.push_str(line.trim_end_matches(['\r', '\n']));
    out.push('\n');
    file.write_all(out.as_bytes())?;
    file.flush()?;

    debug!(path = %path.display(), "appended known_hosts entry");
    Ok(())
}

fn parse_known_hosts_line(line: &str) -> Result<(HostPattern, PublicKey)> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 3 {
        return Err(Error::Protocol {
            message: "invalid known_hosts format".into(),
        });
    }

    let host_part = parts[0];
    let host_pattern = if let Some(hashed) = host_part.strip_prefix("|1|") {
        let hash_parts: Vec<&str> = hashed.split('|').collect();
        if hash_parts.len() != 2 {
            return Err(Error::Protocol {
                message: "invalid hashed hostname format".into(),
            });
        }
        let decode = |s: &str| {
            BASE64_STANDARD.decode(s).map_err(|e| Error::Protocol {
                message: format!("invalid hashed hostname encoding: {}", e),
            })
        };
        HostPattern::Hashed {
            salt: decode(hash_parts[0])?,
            hash: decode(hash_parts[1])?,
        }
    } else {
        HostPattern::Plain(host_part.split(',').map(String::from).collect())
    };

    let key = PublicKey::from_openssh(&format!("{} {}", parts[1], parts[2])).map_err(|e| {
        Error::Protocol {
            message: format!("failed to parse public key: {}", e),
        }
    })?;

    Ok((host_pattern, key))
}
