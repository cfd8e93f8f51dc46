//! Transactional write-behind layer over a cached key store.
//!
//! Inside a transaction, reads are served from an in-memory overlay that
//! sees the transaction's own writes; writes accumulate in a mutation set
//! and only reach the backing store when the outermost transaction exits
//! successfully. Nested transactions share the overlay and commit once.
//!
//! Each top-level `transaction()` call gets its own overlay, carried in
//! a task-local so `get`/`set` issued from the transaction body resolve
//! to the right one. Transactions running concurrently on independent
//! tasks (an inbound decrypt racing an outbound send) therefore stage
//! and commit in full isolation from each other.

use super::{KeyBatch, KeyStore, KeyType, SignalKeyStore};
use crate::error::StoreError;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Copy, Debug)]
pub struct TransactionOptions {
    pub max_commit_retries: u32,
    pub delay_between_tries: Duration,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            max_commit_retries: 10,
            delay_between_tries: Duration::from_secs(3),
        }
    }
}

#[derive(Default)]
struct TxState {
    depth: u32,
    /// Read overlay: `Some(v)` written value, `None` deleted in this tx.
    cache: HashMap<KeyType, HashMap<String, Option<Bytes>>>,
    mutations: KeyBatch,
    queries: u32,
}

/// Active transaction overlays for the current task, keyed by store id
/// so stacked transactions on different stores stay separate.
type TxScopes = HashMap<u64, Arc<Mutex<TxState>>>;

tokio::task_local! {
    static TX_SCOPES: TxScopes;
}

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(0);

pub struct TransactionalKeyStore {
    inner: KeyStore,
    opts: TransactionOptions,
    id: u64,
}

impl TransactionalKeyStore {
    pub fn new(inner: KeyStore, opts: TransactionOptions) -> Self {
        Self {
            inner,
            opts,
            id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// The overlay of the transaction this task is currently inside, if
    /// any.
    fn scope(&self) -> Option<Arc<Mutex<TxState>>> {
        TX_SCOPES
            .try_with(|scopes| scopes.get(&self.id).cloned())
            .ok()
            .flatten()
    }

    pub fn in_transaction(&self) -> bool {
        self.scope().is_some()
    }

    /// Run `work` inside a transaction. Re-entrant: nested calls on the
    /// same task share the overlay and only the outermost exit commits.
    /// If `work` fails, the accumulated mutations are discarded.
    pub async fn transaction<T, F, Fut>(&self, work: F) -> crate::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = crate::Result<T>>,
    {
        let mut scopes = TX_SCOPES.try_with(Clone::clone).unwrap_or_default();
        if let Some(scope) = scopes.get(&self.id).cloned() {
            // nested: reuse the enclosing overlay
            {
                let mut st = scope.lock().unwrap_or_else(|e| e.into_inner());
                st.depth += 1;
                tracing::trace!(depth = st.depth, "entering nested key store transaction");
            }
            let result = work().await;
            scope.lock().unwrap_or_else(|e| e.into_inner()).depth -= 1;
            return result;
        }

        let scope = Arc::new(Mutex::new(TxState {
            depth: 1,
            ..TxState::default()
        }));
        scopes.insert(self.id, Arc::clone(&scope));
        tracing::trace!("entering key store transaction");
        let result = TX_SCOPES.scope(scopes, work()).await;

        let mutations = {
            let mut st = scope.lock().unwrap_or_else(|e| e.into_inner());
            tracing::trace!(queries = st.queries, "closing key store transaction");
            std::mem::take(&mut st.mutations)
        };

        let value = result?;
        if !mutations.is_empty() {
            self.commit(mutations).await?;
        }
        Ok(value)
    }

    async fn commit(&self, mutations: KeyBatch) -> crate::Result<()> {
        let tries = self.opts.max_commit_retries.max(1);
        let mut last = String::new();
        for attempt in 1..=tries {
            match self.inner.set(mutations.clone()).await {
                Ok(()) => {
                    tracing::trace!(attempt, "committed key store transaction");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "transaction commit failed");
                    last = e.to_string();
                    if attempt < tries {
                        tokio::time::sleep(self.opts.delay_between_tries).await;
                    }
                }
            }
        }
        Err(StoreError::CommitFailure {
            attempts: tries,
            last,
        }
        .into())
    }
}

#[async_trait]
impl SignalKeyStore for TransactionalKeyStore {
    async fn get(&self, typ: KeyType, ids: &[String]) -> crate::Result<HashMap<String, Bytes>> {
        let Some(scope) = self.scope() else {
            return self.inner.get(typ, ids).await;
        };
        let (mut out, to_fetch) = {
            let mut st = scope.lock().unwrap_or_else(|e| e.into_inner());
            st.queries += 1;
            let overlay = st.cache.entry(typ).or_default();
            let mut out = HashMap::new();
            let mut to_fetch = Vec::new();
            for id in ids {
                match overlay.get(id) {
                    Some(Some(v)) => {
                        out.insert(id.clone(), v.clone());
                    }
                    Some(None) => {} // deleted in this transaction
                    None => to_fetch.push(id.clone()),
                }
            }
            (out, to_fetch)
        };

        if !to_fetch.is_empty() {
            let fetched = self.inner.get(typ, &to_fetch).await?;
            let mut st = scope.lock().unwrap_or_else(|e| e.into_inner());
            let overlay = st.cache.entry(typ).or_default();
            for (id, v) in &fetched {
                overlay.entry(id.clone()).or_insert_with(|| Some(v.clone()));
            }
            out.extend(fetched);
        }
        Ok(out)
    }

    async fn set(&self, batch: KeyBatch) -> crate::Result<()> {
        let Some(scope) = self.scope() else {
            return self.inner.set(batch).await;
        };
        let mut st = scope.lock().unwrap_or_else(|e| e.into_inner());
        let st = &mut *st;
        for (typ, entries) in batch {
            let overlay = st.cache.entry(typ).or_default();
            let pending = st.mutations.entry(typ).or_default();
            for (id, value) in entries {
                overlay.insert(id.clone(), value.clone());
                pending.insert(id, value);
            }
        }
        Ok(())
    }

    async fn clear(&self) -> crate::Result<()> {
        if let Some(scope) = self.scope() {
            let mut st = scope.lock().unwrap_or_else(|e| e.into_inner());
            st.cache.clear();
            st.mutations.clear();
        }
        self.inner.clear().await
    }
}
