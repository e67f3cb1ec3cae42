//! Reliable-datagram tunnel building blocks.
//!
//! The client dials the remote datagram server over KCP, wraps the byte
//! stream in [`cipher::CipherStream`], and runs [`mux::Mux`] on top. Every
//! logical stream starts with a command tag ([`messages::StreamKind`])
//! answered by a [`messages::Reply`].

pub mod cipher;
pub mod codec;
pub mod launch;
pub mod messages;
pub mod mux;

pub use cipher::{CipherStream, derive_key};
pub use launch::LaunchResponse;
pub use messages::{BusCommand, Reply, StreamKind};
pub use mux::{Mux, MuxRole, MuxStream};
