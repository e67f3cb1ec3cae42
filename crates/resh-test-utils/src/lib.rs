//! resh-test-utils: Test infrastructure for resh.
//!
//! Provides:
//! - MemPacketTransport: in-memory SSH packet transport pair
//! - MockTunnel: a scripted datagram tunnel server speaking the stream protocol
//! - CaptureWriter: an `AsyncWrite` that records everything written to it

mod capture;
mod mock_tunnel;
mod packet_pair;

pub use capture::CaptureWriter;
pub use mock_tunnel::{MockTunnel, MockTunnelConfig, MockTunnelLog};
pub use packet_pair::{MemPacketTransport, packet_pair};
