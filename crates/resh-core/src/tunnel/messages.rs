//! Command tags and JSON message bodies carried on tunnel streams.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Tag sent as the first record of every logical stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// The control stream; exactly one per tunnel.
    Bus,
    /// stdin/stdout of one remote session.
    Session,
    /// stderr of a session, bound by id.
    Stderr,
    /// Remote TCP/UNIX connect.
    Dial,
    /// Remote listener.
    Listen,
    /// Claim a connection announced on a listener.
    Accept,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Bus => "bus",
            StreamKind::Session => "session",
            StreamKind::Stderr => "stderr",
            StreamKind::Dial => "dial",
            StreamKind::Listen => "listen",
            StreamKind::Accept => "accept",
        }
    }
}

impl std::str::FromStr for StreamKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bus" => Ok(StreamKind::Bus),
            "session" => Ok(StreamKind::Session),
            "stderr" => Ok(StreamKind::Stderr),
            "dial" => Ok(StreamKind::Dial),
            "listen" => Ok(StreamKind::Listen),
            "accept" => Ok(StreamKind::Accept),
            other => Err(Error::Protocol {
                message: format!("unknown stream command: {}", other),
            }),
        }
    }
}

/// Command tag of a bus record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusCommand {
    Alive,
    Exit,
    Error,
    Close,
    Resize,
}

impl BusCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            BusCommand::Alive => "alive",
            BusCommand::Exit => "exit",
            BusCommand::Error => "error",
            BusCommand::Close => "close",
            BusCommand::Resize => "resize",
        }
    }
}

impl std::str::FromStr for BusCommand {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "alive" => Ok(BusCommand::Alive),
            "exit" => Ok(BusCommand::Exit),
            "error" => Ok(BusCommand::Error),
            "close" => Ok(BusCommand::Close),
            "resize" => Ok(BusCommand::Resize),
            other => Err(Error::Protocol {
                message: format!("unknown bus command: {}", other),
            }),
        }
    }
}

/// Response to a stream's opening tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Reply {
    Ok,
    Error { msg: String },
}

impl Reply {
    pub fn error(msg: impl Into<String>) -> Self {
        Reply::Error { msg: msg.into() }
    }

    /// Turn an `Error` reply into [`Error::RemoteExec`].
    pub fn into_result(self) -> Result<()> {
        match self {
            Reply::Ok => Ok(()),
            Reply::Error { msg } => Err(Error::RemoteExec { message: msg }),
        }
    }
}

/// First message on a `session` stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartMessage {
    pub id: u64,
    pub pty: bool,
    /// Start the login shell; `name`/`args` are ignored when set.
    pub shell: bool,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub cols: u16,
    pub rows: u16,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
}

/// Server to client: a session finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitMessage {
    pub id: u64,
    pub code: i32,
}

/// Either direction: proof of life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliveMessage {
    /// Sender's clock in milliseconds since the Unix epoch.
    pub time: i64,
}

/// Client to server: a session's window size changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeMessage {
    pub id: u64,
    pub cols: u16,
    pub rows: u16,
}

/// Client to server: close a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseMessage {
    pub id: u64,
}

/// First message on a `stderr` stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StderrMessage {
    pub id: u64,
}

/// First message on a `dial` stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialMessage {
    /// `tcp` or `unix`.
    pub network: String,
    pub addr: String,
    /// Remote connect timeout in milliseconds, 0 for none.
    #[serde(default)]
    pub timeout: u64,
}

/// First message on a `listen` stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenMessage {
    pub network: String,
    pub addr: String,
}

/// Announces an incoming connection on a listener; echoed on `accept`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptMessage {
    pub id: u64,
}

/// Server to client: an error not tied to a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub msg: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_wire_form() {
        assert_eq!(serde_json::to_string(&Reply::Ok).unwrap(), r#"{"status":"ok"}"#);
        let err: Reply =
            serde_json::from_str(r#"{"status":"error","msg":"permission denied"}"#).unwrap();
        assert_eq!(err, Reply::error("permission denied"));
        let e = err.into_result().unwrap_err();
        assert_eq!(e.to_string(), "permission denied");
    }

    #[test]
    fn start_message_optional_fields() {
        let msg: StartMessage =
            serde_json::from_str(r#"{"id":3,"pty":true,"shell":true,"cols":80,"rows":24}"#)
                .unwrap();
        assert_eq!(msg.id, 3);
        assert!(msg.name.is_empty());
        assert!(msg.envs.is_empty());
    }

    #[test]
    fn tags_parse() {
        assert_eq!("stderr".parse::<StreamKind>().unwrap(), StreamKind::Stderr);
        assert!("bogus".parse::<StreamKind>().is_err());
        assert_eq!("resize".parse::<BusCommand>().unwrap(), BusCommand::Resize);
        assert_eq!(BusCommand::Alive.as_str(), "alive");
    }
}
