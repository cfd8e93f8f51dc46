//! Transport seam between the client and the connection layer.
//!
//! The client only ever sends encoded stanza bytes and closes; receiving
//! runs in a dedicated task that feeds decrypted frames back into the
//! dispatcher. The production implementation is the Noise channel over
//! WebSocket; tests plug in capture transports.

use crate::Result;
use async_trait::async_trait;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one stanza's encoded bytes over the transport.
    async fn send(&self, data: &[u8]) -> Result<()>;

    /// Close the transport, flushing the graceful close sequence when
    /// the connection is still open.
    async fn close(&self) -> Result<()>;
}
