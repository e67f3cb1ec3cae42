//! OpenSSH mux protocol codec.
//!
//! Every message is `u32 big-endian length || payload`; the first four
//! payload bytes are the message type. Only the messages needed for proxy
//! mode are implemented.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{MuxError, MuxResult};

/// Length of the frame header.
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest mux control message accepted (256 KiB).
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;

pub const MUX_MSG_HELLO: u32 = 0x0000_0001;
pub const MUX_C_PROXY: u32 = 0x1000_000f;
pub const MUX_S_PERMISSION_DENIED: u32 = 0x8000_0002;
pub const MUX_S_FAILURE: u32 = 0x8000_0003;
pub const MUX_S_PROXY: u32 = 0x8000_000f;

/// A decoded mux message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxMessage {
    Hello { version: u32 },
    ProxyRequest { request_id: u32 },
    Proxy { request_id: u32 },
    Failure { reason: String },
    Other { kind: u32 },
}

impl MuxMessage {
    pub fn kind(&self) -> u32 {
        match self {
            MuxMessage::Hello { .. } => MUX_MSG_HELLO,
            MuxMessage::ProxyRequest { .. } => MUX_C_PROXY,
            MuxMessage::Proxy { .. } => MUX_S_PROXY,
            MuxMessage::Failure { .. } => MUX_S_FAILURE,
            MuxMessage::Other { kind } => *kind,
        }
    }

    /// Encode with the length prefix.
    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::with_capacity(16);
        match self {
            MuxMessage::Hello { version } => {
                payload.put_u32(MUX_MSG_HELLO);
                payload.put_u32(*version);
            }
            MuxMessage::ProxyRequest { request_id } => {
                payload.put_u32(MUX_C_PROXY);
                payload.put_u32(*request_id);
            }
            MuxMessage::Proxy { request_id } => {
                payload.put_u32(MUX_S_PROXY);
                payload.put_u32(*request_id);
            }
            MuxMessage::Failure { reason } => {
                payload.put_u32(MUX_S_FAILURE);
                payload.put_u32(reason.len() as u32);
                payload.put_slice(reason.as_bytes());
            }
            MuxMessage::Other { kind } => payload.put_u32(*kind),
        }
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.put_slice(&payload);
        buf.freeze()
    }

    /// Decode one payload (without the length prefix).
    pub fn decode(mut payload: &[u8]) -> MuxResult<Self> {
        if payload.len() < 4 {
            return Err(MuxError::Codec("mux message shorter than its type".into()));
        }
        let kind = payload.get_u32();
        let need_u32 = |p: &mut &[u8]| {
            if p.len() < 4 {
                Err(MuxError::Codec(format!("truncated mux message {:#010x}", kind)))
            } else {
                Ok(p.get_u32())
            }
        };
        match kind {
            MUX_MSG_HELLO => Ok(MuxMessage::Hello {
                version: need_u32(&mut payload)?,
            }),
            MUX_C_PROXY => Ok(MuxMessage::ProxyRequest {
                request_id: need_u32(&mut payload)?,
            }),
            MUX_S_PROXY => Ok(MuxMessage::Proxy {
                request_id: need_u32(&mut payload)?,
            }),
            MUX_S_FAILURE | MUX_S_PERMISSION_DENIED => Ok(MuxMessage::Failure {
                reason: failure_reason(payload)?,
            }),
            other => Ok(MuxMessage::Other { kind: other }),
        }
    }
}

/// Read the reason string of a failure reply.
///
/// OpenSSH puts the request id before the reason; older peers send the
/// string alone. Both layouts are accepted.
fn failure_reason(payload: &[u8]) -> MuxResult<String> {
    let as_string = |p: &[u8]| -> Option<String> {
        if p.len() < 4 {
            return None;
        }
        let len = u32::from_be_bytes([p[0], p[1], p[2], p[3]]) as usize;
        if p.len() - 4 != len {
            return None;
        }
        String::from_utf8(p[4..].to_vec()).ok()
    };
    if let Some(reason) = as_string(payload) {
        return Ok(reason);
    }
    if payload.len() >= 4
        && let Some(reason) = as_string(&payload[4..])
    {
        return Ok(reason);
    }
    Err(MuxError::Codec("malformed failure reason".into()))
}

/// Read one framed message payload.
pub async fn read_message<R: AsyncRead + Unpin>(r: &mut R) -> MuxResult<MuxMessage> {
    let len = r.read_u32().await? as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(MuxError::Codec(format!(
            "message length {} exceeds maximum {}",
            len, MAX_MESSAGE_SIZE
        )));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    MuxMessage::decode(&payload)
}

pub async fn write_message<W: AsyncWrite + Unpin>(w: &mut W, msg: &MuxMessage) -> MuxResult<()> {
    w.write_all(&msg.encode()).await?;
    w.flush().await?;
    Ok(())
}
