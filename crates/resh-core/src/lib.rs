//! Core types and protocols for resh.
//!
//! This crate provides:
//! - Error types and exit codes
//! - Logging setup
//! - The SSH option layer and known_hosts database
//! - The process context (cleanup hooks, output pause flag)
//! - An SSH connection-protocol layer over any [`packet::PacketTransport`]
//! - Wire protocol, cipher and multiplexer of the datagram tunnel

pub mod constants;
pub mod context;
pub mod error;
pub mod exit;
pub mod known_hosts;
pub mod logging;
pub mod options;
pub mod packet;
pub mod sshconn;
pub mod tunnel;

pub use context::{CleanupPhase, ProcessContext};
pub use error::{Error, HostKeyProblem, Result};
pub use exit::ExitCode;
pub use options::SshOptions;
pub use packet::PacketTransport;
