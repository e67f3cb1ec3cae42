//! resh-client: Client library for the resh SSH client.
//!
//! Provides:
//! - CLI argument parsing
//! - Raw terminal mode handling
//! - Transport adapters (russh over TCP, OpenSSH ControlMaster proxy,
//!   reconnectable datagram tunnel)
//! - The I/O pipeline between the terminal and a remote session
//! - The `~` escape console
//! - Reconnect notifications over an intercepted terminal
//! - The login-to-exit orchestration used by the `resh` binary

pub mod cli;
pub mod escape;
pub mod notification;
pub mod orchestrator;
pub mod pipeline;
pub mod terminal;
pub mod transport;

pub use cli::{Cli, RemoteAction};
pub use escape::{EscapeConsole, EscapeDetector, EscapeResult};
pub use notification::{Interceptor, NoticeEvent, NotificationConfig, Phase};
pub use orchestrator::{Fatal, Outcome, run};
pub use pipeline::{OutputSink, Pipeline, PipelineConfig, PipelineParts, TransferFilter};
pub use terminal::{RawModeGuard, StdinReader, TermSize, get_terminal_size, restore_terminal};
pub use transport::{
    RemoteExit, RemoteSession, SessionHandle, Transport, TransportEvent, TransportKind,
};
