//! In-memory packet transport pair.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};

use resh_core::error::{Error, Result};
use resh_core::packet::PacketTransport;

/// One end of an in-memory packet link.
#[derive(Debug)]
pub struct MemPacketTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

/// Create two connected transports.
pub fn packet_pair() -> (MemPacketTransport, MemPacketTransport) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        MemPacketTransport {
            tx: Mutex::new(Some(a_tx)),
            rx: Mutex::new(b_rx),
        },
        MemPacketTransport {
            tx: Mutex::new(Some(b_tx)),
            rx: Mutex::new(a_rx),
        },
    )
}

#[async_trait]
impl PacketTransport for MemPacketTransport {
    async fn write_packet(&self, packet: &[u8]) -> Result<()> {
        let tx = self.tx.lock().await;
        match tx.as_ref() {
            Some(tx) => tx
                .send(Bytes::copy_from_slice(packet))
                .map_err(|_| Error::ConnectionClosed),
            None => Err(Error::ConnectionClosed),
        }
    }

    async fn read_packet(&self) -> Result<Option<Bytes>> {
        Ok(self.rx.lock().await.recv().await)
    }

    async fn close(&self) -> Result<()> {
        self.tx.lock().await.take();
        Ok(())
    }
}
