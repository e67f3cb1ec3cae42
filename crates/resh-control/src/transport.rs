//! SSH packets over a proxied control socket.
//!
//! Frames are `u32 length || u8 padding length || packet || padding`. We
//! always write a zero padding length; on read the advertised padding is
//! stripped from the tail.

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;

use resh_core::constants::MAX_PACKET_SIZE;
use resh_core::{Error, PacketTransport, Result};

const FRAME_HEADER_LEN: usize = 4;

/// Frame one packet.
pub fn encode_packet(packet: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + 1 + packet.len());
    buf.put_u32((packet.len() + 1) as u32);
    buf.put_u8(0);
    buf.put_slice(packet);
    buf.freeze()
}

/// Try to decode one frame from the front of `buf`.
pub fn decode_packet(buf: &mut BytesMut) -> Result<Option<Bytes>> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len == 0 || len > MAX_PACKET_SIZE {
        return Err(Error::Codec {
            message: format!("bad proxied packet length {}", len),
        });
    }
    if buf.len() < FRAME_HEADER_LEN + len {
        return Ok(None);
    }
    buf.advance(FRAME_HEADER_LEN);
    let mut frame = buf.split_to(len).freeze();
    let pad = frame.get_u8() as usize;
    if pad > frame.len() {
        return Err(Error::Codec {
            message: format!("padding {} longer than packet {}", pad, frame.len()),
        });
    }
    frame.truncate(frame.len() - pad);
    Ok(Some(frame))
}

/// [`PacketTransport`] over a control socket in proxy mode.
#[derive(Debug)]
pub struct MuxPacketTransport {
    reader: Mutex<(OwnedReadHalf, BytesMut)>,
    writer: Mutex<OwnedWriteHalf>,
}

impl MuxPacketTransport {
    pub fn new(stream: UnixStream) -> Self {
        let (r, w) = stream.into_split();
        Self {
            reader: Mutex::new((r, BytesMut::with_capacity(8192))),
            writer: Mutex::new(w),
        }
    }
}

#[async_trait]
impl PacketTransport for MuxPacketTransport {
    async fn write_packet(&self, packet: &[u8]) -> Result<()> {
        let frame = encode_packet(packet);
        let mut w = self.writer.lock().await;
        w.write_all(&frame).await?;
        Ok(())
    }

    async fn read_packet(&self) -> Result<Option<Bytes>> {
        let mut guard = self.reader.lock().await;
        let (stream, buf) = &mut *guard;
        loop {
            if let Some(packet) = decode_packet(buf)? {
                return Ok(Some(packet));
            }
            let n = stream.read_buf(buf).await?;
            if n == 0 {
                if buf.is_empty() {
                    return Ok(None);
                }
                return Err(Error::ConnectionClosed);
            }
        }
    }

    async fn close(&self) -> Result<()> {
        let mut w = self.writer.lock().await;
        w.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn decodes_example_frame() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 4, 0, 0, 1, 2][..]);
        let packet = decode_packet(&mut buf).unwrap().unwrap();
        assert_eq!(&packet[..], &[0, 1, 2]);
        assert!(buf.is_empty());
    }

    #[test]
    fn strips_trailing_padding() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 6, 2, 94, 7, 9, 0xaa, 0xbb][..]);
        let packet = decode_packet(&mut buf).unwrap().unwrap();
        assert_eq!(&packet[..], &[94, 7, 9]);
    }

    #[test]
    fn partial_frame_waits() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 4, 0, 0][..]);
        assert!(decode_packet(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 6);
    }

    #[test]
    fn zero_length_rejected() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 0][..]);
        assert!(decode_packet(&mut buf).is_err());
    }

    proptest! {
        #[test]
        fn framing_preserves_packet(packet in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let mut buf = BytesMut::from(&encode_packet(&packet)[..]);
            let decoded = decode_packet(&mut buf).unwrap().unwrap();
            prop_assert_eq!(&decoded[..], &packet[..]);
            prop_assert!(buf.is_empty());
        }
    }
}
