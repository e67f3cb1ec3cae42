//! Packet transport capability.
//!
//! The SSH connection layer only needs to move whole, already-decrypted
//! SSH packets. Anything that can do that (an in-memory pair, a
//! ControlMaster proxy socket) plugs in here.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// A bidirectional channel of SSH packets.
///
/// `read_packet` is only ever called from one task at a time, and so is
/// `write_packet`; implementations may rely on that.
#[async_trait]
pub trait PacketTransport: Send + Sync {
    /// Send one packet (message type byte first).
    async fn write_packet(&self, packet: &[u8]) -> Result<()>;

    /// Receive the next packet. `Ok(None)` means the peer closed cleanly.
    async fn read_packet(&self) -> Result<Option<Bytes>>;

    /// Close the transport; pending reads return `Ok(None)` or an error.
    async fn close(&self) -> Result<()>;
}
