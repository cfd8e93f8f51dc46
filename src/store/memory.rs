use super::{KeyBatch, KeyType, SignalKeyStore};
use crate::error::StoreError;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::RwLock;

/// In-memory key store (for testing or single-run; not persistent).
#[derive(Default)]
pub struct MemoryKeyStore {
    data: RwLock<HashMap<KeyType, HashMap<String, Bytes>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries of a type (test helper).
    pub fn count(&self, typ: KeyType) -> usize {
        self.data
            .read()
            .map(|d| d.get(&typ).map_or(0, HashMap::len))
            .unwrap_or(0)
    }
}

#[async_trait]
impl SignalKeyStore for MemoryKeyStore {
    async fn get(&self, typ: KeyType, ids: &[String]) -> crate::Result<HashMap<String, Bytes>> {
        let data = self
            .data
            .read()
            .map_err(|e| StoreError::Load(e.to_string()))?;
        let Some(space) = data.get(&typ) else {
            return Ok(HashMap::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| space.get(id).map(|v| (id.clone(), v.clone())))
            .collect())
    }

    async fn set(&self, batch: KeyBatch) -> crate::Result<()> {
        let mut data = self
            .data
            .write()
            .map_err(|e| StoreError::Save(e.to_string()))?;
        for (typ, entries) in batch {
            let space = data.entry(typ).or_default();
            for (id, value) in entries {
                match value {
                    Some(v) => {
                        space.insert(id, v);
                    }
                    None => {
                        space.remove(&id);
                    }
                }
            }
        }
        Ok(())
    }

    async fn clear(&self) -> crate::Result<()> {
        self.data
            .write()
            .map_err(|e| StoreError::Save(e.to_string()))?
            .clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{get_one, set_one};

    #[tokio::test]
    async fn set_then_get_returns_value() {
        let store = MemoryKeyStore::new();
        set_one(&store, KeyType::Session, "123.0", Some(Bytes::from_static(b"rec")))
            .await
            .unwrap();
        let got = get_one(&store, KeyType::Session, "123.0").await.unwrap();
        assert_eq!(got, Some(Bytes::from_static(b"rec")));
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let store = MemoryKeyStore::new();
        set_one(&store, KeyType::PreKey, "7", Some(Bytes::from_static(b"k")))
            .await
            .unwrap();
        set_one(&store, KeyType::PreKey, "7", None).await.unwrap();
        assert!(get_one(&store, KeyType::PreKey, "7").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_skips_missing_ids() {
        let store = MemoryKeyStore::new();
        set_one(&store, KeyType::Session, "a", Some(Bytes::from_static(b"1")))
            .await
            .unwrap();
        let got = store
            .get(KeyType::Session, &["a".into(), "b".into()])
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert!(got.contains_key("a"));
    }

    #[tokio::test]
    async fn clear_drops_everything() {
        let store = MemoryKeyStore::new();
        set_one(&store, KeyType::Session, "a", Some(Bytes::from_static(b"1")))
            .await
            .unwrap();
        store.clear().await.unwrap();
        assert_eq!(store.count(KeyType::Session), 0);
    }
}
