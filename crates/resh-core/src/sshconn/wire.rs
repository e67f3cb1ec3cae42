//! SSH wire encoding helpers for connection-protocol messages.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

pub const MSG_DISCONNECT: u8 = 1;
pub const MSG_IGNORE: u8 = 2;
pub const MSG_UNIMPLEMENTED: u8 = 3;
pub const MSG_DEBUG: u8 = 4;
pub const MSG_GLOBAL_REQUEST: u8 = 80;
pub const MSG_REQUEST_SUCCESS: u8 = 81;
pub const MSG_REQUEST_FAILURE: u8 = 82;
pub const MSG_CHANNEL_OPEN: u8 = 90;
pub const MSG_CHANNEL_OPEN_CONFIRMATION: u8 = 91;
pub const MSG_CHANNEL_OPEN_FAILURE: u8 = 92;
pub const MSG_CHANNEL_WINDOW_ADJUST: u8 = 93;
pub const MSG_CHANNEL_DATA: u8 = 94;
pub const MSG_CHANNEL_EXTENDED_DATA: u8 = 95;
pub const MSG_CHANNEL_EOF: u8 = 96;
pub const MSG_CHANNEL_CLOSE: u8 = 97;
pub const MSG_CHANNEL_REQUEST: u8 = 98;
pub const MSG_CHANNEL_SUCCESS: u8 = 99;
pub const MSG_CHANNEL_FAILURE: u8 = 100;

/// `SSH_OPEN_ADMINISTRATIVELY_PROHIBITED`.
pub const OPEN_ADMINISTRATIVELY_PROHIBITED: u32 = 1;

/// Builder for one outgoing packet.
#[derive(Debug)]
pub struct PacketWriter {
    buf: BytesMut,
}

impl PacketWriter {
    pub fn new(msg: u8) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(msg);
        Self { buf }
    }

    pub fn u8(mut self, v: u8) -> Self {
        self.buf.put_u8(v);
        self
    }

    pub fn bool(self, v: bool) -> Self {
        self.u8(v as u8)
    }

    pub fn u32(mut self, v: u32) -> Self {
        self.buf.put_u32(v);
        self
    }

    pub fn string(mut self, v: impl AsRef<[u8]>) -> Self {
        let v = v.as_ref();
        self.buf.put_u32(v.len() as u32);
        self.buf.put_slice(v);
        self
    }

    /// Append pre-encoded fields.
    pub fn raw(mut self, v: &[u8]) -> Self {
        self.buf.put_slice(v);
        self
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Cursor over one incoming packet.
#[derive(Debug)]
pub struct PacketReader {
    buf: Bytes,
}

impl PacketReader {
    /// Wrap a packet; returns the message type and a reader for the rest.
    pub fn new(mut packet: Bytes) -> Result<(u8, Self)> {
        if packet.is_empty() {
            return Err(short());
        }
        let msg = packet.get_u8();
        Ok((msg, Self { buf: packet }))
    }

    pub fn u8(&mut self) -> Result<u8> {
        if self.buf.remaining() < 1 {
            return Err(short());
        }
        Ok(self.buf.get_u8())
    }

    pub fn bool(&mut self) -> Result<bool> {
        Ok(self.u8()? != 0)
    }

    pub fn u32(&mut self) -> Result<u32> {
        if self.buf.remaining() < 4 {
            return Err(short());
        }
        Ok(self.buf.get_u32())
    }

    pub fn string(&mut self) -> Result<Bytes> {
        let len = self.u32()? as usize;
        if self.buf.remaining() < len {
            return Err(short());
        }
        Ok(self.buf.split_to(len))
    }

    /// Unread remainder of the packet.
    pub fn rest(self) -> Bytes {
        self.buf
    }

    pub fn utf8(&mut self) -> Result<String> {
        let raw = self.string()?;
        String::from_utf8(raw.to_vec()).map_err(|e| Error::Protocol {
            message: format!("invalid UTF-8 in SSH string: {}", e),
        })
    }
}

fn short() -> Error {
    Error::Protocol {
        message: "truncated SSH packet".into(),
    }
}

/// Encode the terminal modes blob of a `pty-req` (empty list).
pub fn empty_terminal_modes() -> Bytes {
    // TTY_OP_END
    Bytes::from_static(&[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_reader_agree() {
        let pkt = PacketWriter::new(MSG_CHANNEL_REQUEST)
            .u32(7)
            .string("exec")
            .bool(true)
            .string(b"ls -l")
            .finish();
        let (msg, mut r) = PacketReader::new(pkt).unwrap();
        assert_eq!(msg, MSG_CHANNEL_REQUEST);
        assert_eq!(r.u32().unwrap(), 7);
        assert_eq!(r.utf8().unwrap(), "exec");
        assert!(r.bool().unwrap());
        assert_eq!(&r.string().unwrap()[..], b"ls -l");
        assert!(r.u8().is_err());
    }

    #[test]
    fn truncated_string_is_error() {
        let pkt = Bytes::from_static(&[MSG_CHANNEL_DATA, 0, 0, 0, 1, 0, 0, 0, 9, b'x']);
        let (_, mut r) = PacketReader::new(pkt).unwrap();
        assert_eq!(r.u32().unwrap(), 1);
        assert!(r.string().is_err());
    }
}
