//! Errors of the ControlMaster client.

/// Errors that can occur while talking to a control master.
#[derive(Debug)]
pub enum MuxError {
    /// I/O error on the control socket.
    Io(std::io::Error),
    /// The master speaks a protocol version other than 4.
    ProtocolMismatch { version: u32 },
    /// A reply of an unexpected type arrived.
    UnexpectedMessage { expected: u32, got: u32 },
    /// The master refused the request.
    ServerFailure(String),
    /// Framing or payload error.
    Codec(String),
    /// The socket did not answer in time.
    Timeout,
    /// Spawning a master failed.
    Spawn(String),
}

impl std::fmt::Display for MuxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MuxError::Io(e) => write!(f, "I/O error: {}", e),
            MuxError::ProtocolMismatch { version } => {
                write!(f, "mux protocol mismatch: master speaks version {}", version)
            }
            MuxError::UnexpectedMessage { expected, got } => {
                write!(f, "unexpected mux message {:#010x}, expected {:#010x}", got, expected)
            }
            MuxError::ServerFailure(reason) => write!(f, "control master refused: {}", reason),
            MuxError::Codec(msg) => write!(f, "codec error: {}", msg),
            MuxError::Timeout => write!(f, "control socket timed out"),
            MuxError::Spawn(msg) => write!(f, "cannot start control master: {}", msg),
        }
    }
}

impl std::error::Error for MuxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MuxError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for MuxError {
    fn from(e: std::io::Error) -> Self {
        MuxError::Io(e)
    }
}

impl From<MuxError> for resh_core::Error {
    fn from(e: MuxError) -> Self {
        match e {
            MuxError::Io(io_err) => resh_core::Error::Io(io_err),
            other => resh_core::Error::TransportHandshake {
                message: other.to_string(),
            },
        }
    }
}

/// Result type for control master operations.
pub type MuxResult<T> = std::result::Result<T, MuxError>;
