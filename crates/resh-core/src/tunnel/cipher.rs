//! Tunnel encryption.
//!
//! The key is PBKDF2-HMAC-SHA1 over the server-issued password and salt.
//! Each direction is an AES-256-CFB stream whose IV is sent in clear as
//! the first 16 bytes written by that side.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use aes::Aes256;
use bytes::{Buf, BytesMut};
use cfb_mode::cipher::KeyIvInit;
use cfb_mode::{BufDecryptor, BufEncryptor};
use rand::RngCore;
use sha1::Sha1;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::trace;

use crate::constants::{TUNNEL_IV_LEN, TUNNEL_KDF_ITERATIONS, TUNNEL_KEY_LEN};
use crate::error::{Error, Result};

/// Derive the tunnel key from the launch password and salt.
pub fn derive_key(pass: &[u8], salt: &[u8]) -> [u8; TUNNEL_KEY_LEN] {
    let mut key = [0u8; TUNNEL_KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha1>(pass, salt, TUNNEL_KDF_ITERATIONS, &mut key);
    key
}

/// A byte stream encrypted in both directions.
pub struct CipherStream<S> {
    inner: S,
    enc: BufEncryptor<Aes256>,
    dec: BufDecryptor<Aes256>,
    /// Ciphertext accepted from the caller but not yet written.
    pending: BytesMut,
}

impl<S> std::fmt::Debug for CipherStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherStream")
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> CipherStream<S> {
    /// Exchange IVs with the peer and wrap the stream.
    pub async fn establish(mut inner: S, key: &[u8; TUNNEL_KEY_LEN]) -> Result<Self> {
        let mut local_iv = [0u8; TUNNEL_IV_LEN];
        rand::thread_rng().fill_bytes(&mut local_iv);
        inner.write_all(&local_iv).await?;
        inner.flush().await?;

        let mut remote_iv = [0u8; TUNNEL_IV_LEN];
        inner.read_exact(&mut remote_iv).await?;
        trace!("tunnel cipher established");

        let enc = BufEncryptor::<Aes256>::new_from_slices(key, &local_iv).map_err(|e| {
            Error::TransportHandshake {
                message: format!("cipher init failed: {}", e),
            }
        })?;
        let dec = BufDecryptor::<Aes256>::new_from_slices(key, &remote_iv).map_err(|e| {
            Error::TransportHandshake {
                message: format!("cipher init failed: {}", e),
            }
        })?;

        Ok(Self {
            inner,
            enc,
            dec,
            pending: BytesMut::new(),
        })
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.pending.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for CipherStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.dec.decrypt(&mut buf.filled_mut()[before..]);
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for CipherStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        let start = this.pending.len();
        this.pending.extend_from_slice(buf);
        this.enc.encrypt(&mut this.pending[start..]);
        // Best effort; whatever is left goes out on the next write or flush.
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
