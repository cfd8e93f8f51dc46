//! Read-through cache over the backing key store.
//!
//! Hits are served from memory; misses are fetched from the inner store
//! in one batched call and populated. Writes go through to the inner
//! store and update the cache. Misses are never negatively cached.

use super::{KeyBatch, KeyStore, KeyType, SignalKeyStore};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Default entry lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

struct Entry {
    value: Bytes,
    inserted: Instant,
}

pub struct CachedKeyStore {
    inner: KeyStore,
    ttl: Duration,
    cache: RwLock<HashMap<(KeyType, String), Entry>>,
}

impl CachedKeyStore {
    pub fn new(inner: KeyStore) -> Self {
        Self::with_ttl(inner, DEFAULT_TTL)
    }

    pub fn with_ttl(inner: KeyStore, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn lookup(&self, typ: KeyType, ids: &[String]) -> (HashMap<String, Bytes>, Vec<String>) {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        let mut hits = HashMap::new();
        let mut misses = Vec::new();
        for id in ids {
            match cache.get(&(typ, id.clone())) {
                Some(entry) if entry.inserted.elapsed() < self.ttl => {
                    hits.insert(id.clone(), entry.value.clone());
                }
                _ => misses.push(id.clone()),
            }
        }
        (hits, misses)
    }

    fn populate(&self, typ: KeyType, fetched: &HashMap<String, Bytes>) {
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        for (id, value) in fetched {
            cache.insert(
                (typ, id.clone()),
                Entry {
                    value: value.clone(),
                    inserted: Instant::now(),
                },
            );
        }
    }
}

#[async_trait]
impl SignalKeyStore for CachedKeyStore {
    async fn get(&self, typ: KeyType, ids: &[String]) -> crate::Result<HashMap<String, Bytes>> {
        let (mut hits, misses) = self.lookup(typ, ids);
        if !misses.is_empty() {
            let fetched = self.inner.get(typ, &misses).await?;
            self.populate(typ, &fetched);
            hits.extend(fetched);
        }
        Ok(hits)
    }

    async fn set(&self, batch: KeyBatch) -> crate::Result<()> {
        self.inner.set(batch.clone()).await?;
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        for (typ, entries) in batch {
            for (id, value) in entries {
                match value {
                    Some(v) => {
                        cache.insert(
                            (typ, id),
                            Entry {
                                value: v,
                                inserted: Instant::now(),
                            },
                        );
                    }
                    None => {
                        cache.remove(&(typ, id));
                    }
                }
            }
        }
        Ok(())
    }

    async fn clear(&self) -> crate::Result<()> {
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.inner.clear().await
    }
}
