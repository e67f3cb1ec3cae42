//! Record framing on tunnel streams.
//!
//! Each record is `u32 big-endian length || bytes`. A command tag is a
//! UTF-8 record, a message is a JSON record.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::MAX_RECORD_SIZE;
use crate::error::{Error, Result};

use super::messages::{BusCommand, Reply};

/// Length of the record header.
pub const RECORD_HEADER_LEN: usize = 4;

/// Encode one record.
pub fn encode_record(data: &[u8]) -> Result<Bytes> {
    if data.len() > MAX_RECORD_SIZE {
        return Err(Error::Codec {
            message: format!(
                "record too large: {} bytes (max {})",
                data.len(),
                MAX_RECORD_SIZE
            ),
        });
    }
    let mut buf = BytesMut::with_capacity(RECORD_HEADER_LEN + data.len());
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
    Ok(buf.freeze())
}

pub async fn write_record<W: AsyncWrite + Unpin>(w: &mut W, data: &[u8]) -> Result<()> {
    let buf = encode_record(data)?;
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_record<R: AsyncRead + Unpin>(r: &mut R) -> Result<Bytes> {
    let len = r.read_u32().await? as usize;
    if len > MAX_RECORD_SIZE {
        return Err(Error::Codec {
            message: format!("record length {} exceeds maximum {}", len, MAX_RECORD_SIZE),
        });
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

pub async fn write_command<W: AsyncWrite + Unpin>(w: &mut W, tag: &str) -> Result<()> {
    write_record(w, tag.as_bytes()).await
}

pub async fn read_command<R: AsyncRead + Unpin>(r: &mut R) -> Result<String> {
    let raw = read_record(r).await?;
    String::from_utf8(raw.to_vec()).map_err(|e| Error::Codec {
        message: format!("invalid command tag: {}", e),
    })
}

pub async fn write_message<W: AsyncWrite + Unpin, T: Serialize>(w: &mut W, msg: &T) -> Result<()> {
    let json = serde_json::to_vec(msg).map_err(|e| Error::Codec {
        message: format!("failed to encode message: {}", e),
    })?;
    write_record(w, &json).await
}

pub async fn read_message<R: AsyncRead + Unpin, T: DeserializeOwned>(r: &mut R) -> Result<T> {
    let raw = read_record(r).await?;
    serde_json::from_slice(&raw).map_err(|e| Error::Codec {
        message: format!("invalid message: {}", e),
    })
}

/// Write one bus command and its body as a single write.
pub async fn write_bus<W: AsyncWrite + Unpin, T: Serialize>(
    w: &mut W,
    cmd: BusCommand,
    body: &T,
) -> Result<()> {
    let json = serde_json::to_vec(body).map_err(|e| Error::Codec {
        message: format!("failed to encode {} body: {}", cmd.as_str(), e),
    })?;
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&encode_record(cmd.as_str().as_bytes())?);
    buf.extend_from_slice(&encode_record(&json)?);
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

/// Read one bus command; the body is left undecoded.
pub async fn read_bus<R: AsyncRead + Unpin>(r: &mut R) -> Result<(BusCommand, Bytes)> {
    let cmd: BusCommand = read_command(r).await?.parse()?;
    let body = read_record(r).await?;
    Ok((cmd, body))
}

/// Decode a JSON body read with [`read_bus`].
pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| Error::Codec {
        message: format!("invalid message: {}", e),
    })
}

/// Read a stream's `OK`/`Error(text)` reply.
pub async fn read_reply<R: AsyncRead + Unpin>(r: &mut R) -> Result<()> {
    read_message::<_, Reply>(r).await?.into_result()
}
