//! Reply printed by the remote datagram server when launched over SSH.
//!
//! ```json
//! {"port": 61001, "pass": "c2VjcmV0", "salt": "cGVwcGVy"}
//! ```
//! or, on failure, `{"error": "address in use"}`.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Connection parameters of a freshly launched datagram server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchResponse {
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub pass: String,
    #[serde(default)]
    pub salt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LaunchResponse {
    /// Parse the server's stdout. Lines before the JSON object (login
    /// banners, motd) are skipped.
    pub fn parse(output: &str) -> Result<Self> {
        let json = output
            .lines()
            .map(str::trim)
            .rfind(|l| l.starts_with('{'))
            .ok_or_else(|| Error::TransportHandshake {
                message: format!("no launch response in server output: {:?}", output.trim()),
            })?;
        let resp: Self = serde_json::from_str(json).map_err(|e| Error::TransportHandshake {
            message: format!("invalid launch response: {}", e),
        })?;
        if let Some(err) = &resp.error {
            return Err(Error::TransportHandshake {
                message: format!("datagram server failed: {}", err),
            });
        }
        if resp.port == 0 || resp.pass.is_empty() {
            return Err(Error::TransportHandshake {
                message: "launch response lacks port or password".into(),
            });
        }
        Ok(resp)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Protocol {
            message: format!("failed to serialize launch response: {}", e),
        })
    }
}
