//! Error types for resh-core.

use thiserror::Error;

/// Why a host key was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyProblem {
    /// Host is not present in any known_hosts file.
    Unknown,
    /// Host is present with a different key.
    Changed,
    /// Key is marked `@revoked`.
    Revoked,
}

impl std::fmt::Display for HostKeyProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostKeyProblem::Unknown => write!(f, "unknown host key"),
            HostKeyProblem::Changed => write!(f, "host key changed"),
            HostKeyProblem::Revoked => write!(f, "host key revoked"),
        }
    }
}

/// Main error type for resh operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid option or unreadable configuration.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Host key verification failed.
    #[error("{kind} for {host}")]
    HostKey { host: String, kind: HostKeyProblem },

    /// ControlMaster or datagram handshake failed; the caller may fall back.
    #[error("handshake failed: {message}")]
    TransportHandshake { message: String },

    /// Remote side refused to start a command, shell or stream.
    #[error("{message}")]
    RemoteExec { message: String },

    /// Protocol violation or malformed message.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Codec error during encoding/decoding.
    #[error("codec error: {message}")]
    Codec { message: String },

    /// Authentication failed.
    #[error("authentication failed: {message}")]
    AuthenticationFailed { message: String },

    /// Connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// No keep-alive arrived within the configured window.
    #[error("alive timeout after {secs} seconds")]
    ReconnectTimeout { secs: u64 },

    /// The user aborted the session.
    #[error("{reason}")]
    UserAbort { reason: String },

    /// Transport layer error.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// Error annotated with the stage that produced it.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Returns true if this error is transient and reconnection may help.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transport { .. }
            | Error::ConnectionClosed
            | Error::Timeout
            | Error::Io(_)
            | Error::TransportHandshake { .. } => true,
            Error::Context { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Returns true if this error is fatal and reconnection won't help.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Configuration { .. }
            | Error::HostKey { .. }
            | Error::RemoteExec { .. }
            | Error::AuthenticationFailed { .. }
            | Error::ReconnectTimeout { .. }
            | Error::UserAbort { .. }
            | Error::Protocol { .. } => true,
            Error::Context { source, .. } => source.is_fatal(),
            _ => false,
        }
    }

    /// Prefix the error with the name of the failing stage.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The error without any stage annotations.
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Convenience result type for resh operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_protocol() {
        let err = Error::Protocol {
            message: "invalid message type".into(),
        };
        assert_eq!(err.to_string(), "protocol error: invalid message type");
    }

    #[test]
    fn error_display_host_key() {
        let err = Error::HostKey {
            host: "[example.com]:2222".into(),
            kind: HostKeyProblem::Changed,
        };
        assert_eq!(err.to_string(), "host key changed for [example.com]:2222");
    }

    #[test]
    fn context_prefixes_stage() {
        let err = Error::RemoteExec {
            message: "permission denied".into(),
        }
        .with_context("start shell");
        assert_eq!(err.to_string(), "start shell: permission denied");
        assert!(matches!(err.root(), Error::RemoteExec { .. }));
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn transient_errors() {
        assert!(Error::ConnectionClosed.is_transient());
        assert!(Error::Timeout.is_transient());
        assert!(
            Error::TransportHandshake {
                message: "mismatch".into()
            }
            .is_transient()
        );
        assert!(!Error::UserAbort { reason: "x".into() }.is_transient());
    }

    #[test]
    fn fatal_errors_survive_context() {
        let err = Error::Configuration {
            message: "bad option".into(),
        }
        .with_context("config");
        assert!(err.is_fatal());
        assert!(!Error::ConnectionClosed.is_fatal());
    }
}
