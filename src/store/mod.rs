//! Signal key storage.
//!
//! The external collaborator is an opaque blob store addressed by
//! `(type, id)`; everything the crate layers on top (read-through cache,
//! transactional write-behind) is built against the [`SignalKeyStore`]
//! capability trait.

mod cache;
pub mod creds;
mod memory;
mod transaction;

pub use cache::CachedKeyStore;
pub use creds::{
    init_auth_creds, AccountSettings, AuthenticationCreds, KeyPair, PreKey, PreKeyBatch,
    SignedPreKey,
};
pub use memory::MemoryKeyStore;
pub use transaction::{TransactionOptions, TransactionalKeyStore};

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

/// Namespaces inside the blob store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyType {
    PreKey,
    Session,
    SenderKey,
    SenderKeyMemory,
    AppStateSyncKey,
    AppStateSyncVersion,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreKey => "pre-key",
            Self::Session => "session",
            Self::SenderKey => "sender-key",
            Self::SenderKeyMemory => "sender-key-memory",
            Self::AppStateSyncKey => "app-state-sync-key",
            Self::AppStateSyncVersion => "app-state-sync-version",
        }
    }

    pub const ALL: [KeyType; 6] = [
        Self::PreKey,
        Self::Session,
        Self::SenderKey,
        Self::SenderKeyMemory,
        Self::AppStateSyncKey,
        Self::AppStateSyncVersion,
    ];
}

impl std::fmt::Display for KeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One write batch: per type, id → new value (`None` deletes the entry).
/// Values are `Bytes` so decorators can hold them by reference.
pub type KeyBatch = HashMap<KeyType, HashMap<String, Option<Bytes>>>;

/// Capability contract for the opaque blob store and every decorator
/// stacked over it.
#[async_trait]
pub trait SignalKeyStore: Send + Sync {
    /// Fetch the given ids in one call; absent ids are simply missing from
    /// the returned map.
    async fn get(&self, typ: KeyType, ids: &[String]) -> crate::Result<HashMap<String, Bytes>>;

    /// Apply a write batch atomically (as far as the backend allows).
    async fn set(&self, batch: KeyBatch) -> crate::Result<()>;

    /// Drop everything. Optional for backends; decorators flush their own
    /// state and forward.
    async fn clear(&self) -> crate::Result<()>;
}

/// Shared handle used throughout the crate.
pub type KeyStore = Arc<dyn SignalKeyStore>;

/// Convenience: fetch a single record.
pub async fn get_one(
    store: &dyn SignalKeyStore,
    typ: KeyType,
    id: &str,
) -> crate::Result<Option<Bytes>> {
    let mut map = store.get(typ, &[id.to_string()]).await?;
    Ok(map.remove(id))
}

/// Convenience: write a single record.
pub async fn set_one(
    store: &dyn SignalKeyStore,
    typ: KeyType,
    id: &str,
    value: Option<Bytes>,
) -> crate::Result<()> {
    let mut batch = KeyBatch::new();
    batch.entry(typ).or_default().insert(id.to_string(), value);
    store.set(batch).await
}
