//! OpenSSH ControlMaster client for resh.
//!
//! Speaks the OpenSSH mux protocol (version 4) in proxy mode: after HELLO
//! and a PROXY request the control socket carries raw, unencrypted SSH
//! packets for a new connection that shares the master's authentication.
//!
//! # Wire Format
//!
//! Mux messages are framed as:
//! - 4 bytes: u32 big-endian length prefix
//! - N bytes: u32 message type followed by its fields
//!
//! Proxied SSH packets are framed as `u32 length || u8 padding length ||
//! packet || padding`; see [`transport`].

pub mod client;
pub mod error;
pub mod master;
pub mod path;
pub mod protocol;
pub mod transport;

pub use client::{connect_proxy, handshake, is_alive};
pub use error::{MuxError, MuxResult};
pub use master::{MasterSpec, ensure_master};
pub use path::{PathTokens, expand_control_path};
pub use protocol::MuxMessage;
pub use transport::MuxPacketTransport;
