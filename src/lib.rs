//! # whatsapp-core
//!
//! Core of a WhatsApp Web multidevice client: the authenticated,
//! encrypted, long-lived connection and the message relay over it.
//!
//! ## What's inside
//!
//! - Noise-framed transport over WebSocket and the token-compressed
//!   binary stanza codec
//! - Signal-protocol message layer: pairwise sessions, group sender
//!   keys, prekey bundles, and a transactional key store with a
//!   write-behind cache
//! - Stanza relay and fan-out: recipient expansion across devices,
//!   session assertion, USync device discovery, sender-key distribution
//!
//! Credential persistence, chat/contact bookkeeping, media transfer and
//! pairing UI are external collaborators: the crate consumes a blob
//! store for keys and emits typed events for everything else.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use whatsapp_core::{init_auth_creds, Client, MemoryKeyStore, SocketConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = Client::new(
//!         init_auth_creds(),
//!         Arc::new(MemoryKeyStore::new()),
//!         SocketConfig::default(),
//!     );
//!     client.events().process(|events| {
//!         for (channel, batch) in events {
//!             println!("{channel}: {} event(s)", batch.len());
//!         }
//!     });
//!     client.connect().await?;
//!     Ok(())
//! }
//! ```

pub mod binary;
pub mod client;
pub mod error;
pub mod events;
pub mod jobqueue;
pub mod mediaconn;
pub mod pairing;
pub mod proto;
pub mod relay;
pub mod request;
pub mod signal;
pub mod socket;
pub mod store;
pub mod transport;
pub mod types;
pub mod usync;

pub use client::{
    should_reconnect, Client, MessageRef, ReceiptType, SendRequestExtra, SendResponse,
    SocketConfig,
};
pub use error::{DisconnectReason, Error, Result};
pub use events::{Event, EventBus};
pub use relay::{RelayEngine, RelayOptions};
pub use signal::SignalRepository;
pub use store::{init_auth_creds, AuthenticationCreds, MemoryKeyStore, SignalKeyStore};
pub use transport::Transport;
pub use types::{Jid, MessageId};
