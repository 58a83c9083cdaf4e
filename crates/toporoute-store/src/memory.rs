//! In-memory coordination store
//!
//! A single mutex guards keys, leases and watchers, which makes every operation
//! linearizable. Leases expire lazily on each access and, optionally, through a
//! background sweeper so watchers observe expiry without further traffic.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, info, trace};

use toporoute_common::{Result, ToporouteError};

use crate::traits::{
    CoordinationStore, KeepAliveResponse, KeepAliveStream, KeyValue, Lease, LeaseId, PutOp,
    WatchStream,
};

const KEEPALIVE_CHANNEL_SIZE: usize = 16;
const MIN_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(10);

struct StoredValue {
    value: String,
    lease: Option<LeaseId>,
    mod_revision: u64,
}

struct LeaseRecord {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<Vec<KeyValue>>,
}

#[derive(Default)]
struct StoreState {
    kvs: BTreeMap<String, StoredValue>,
    leases: HashMap<LeaseId, LeaseRecord>,
    watchers: Vec<Watcher>,
    revision: u64,
    next_lease_id: LeaseId,
}

impl StoreState {
    fn snapshot(&self, prefix: &str) -> Vec<KeyValue> {
        self.kvs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, stored)| KeyValue {
                key: key.clone(),
                value: stored.value.clone(),
                lease: stored.lease,
                mod_revision: stored.mod_revision,
            })
            .collect()
    }

    fn check_lease(&self, lease: Option<LeaseId>) -> Result<()> {
        match lease {
            Some(id) if !self.leases.contains_key(&id) => Err(ToporouteError::LeaseNotFound(id)),
            _ => Ok(()),
        }
    }

    fn put_locked(&mut self, key: &str, value: &str, lease: Option<LeaseId>, revision: u64) {
        // A re-put moves the key to the new lease
        if let Some(prev_lease) = self.kvs.get(key).and_then(|prev| prev.lease)
            && Some(prev_lease) != lease
            && let Some(record) = self.leases.get_mut(&prev_lease)
        {
            record.keys.remove(key);
        }
        if let Some(id) = lease
            && let Some(record) = self.leases.get_mut(&id)
        {
            record.keys.insert(key.to_string());
        }
        self.kvs.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                lease,
                mod_revision: revision,
            },
        );
    }

    fn remove_key(&mut self, key: &str) -> bool {
        match self.kvs.remove(key) {
            Some(stored) => {
                if let Some(id) = stored.lease
                    && let Some(record) = self.leases.get_mut(&id)
                {
                    record.keys.remove(key);
                }
                true
            }
            None => false,
        }
    }

    fn remove_lease(&mut self, id: LeaseId) -> Option<Vec<String>> {
        let record = self.leases.remove(&id)?;
        let mut removed = Vec::new();
        for key in record.keys {
            if self.kvs.get(&key).is_some_and(|stored| stored.lease == Some(id)) {
                self.kvs.remove(&key);
                removed.push(key);
            }
        }
        if !removed.is_empty() {
            self.revision += 1;
        }
        Some(removed)
    }

    fn purge_expired(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, record)| record.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        let mut changed = Vec::new();
        for id in expired {
            let removed = self.remove_lease(id).unwrap_or_default();
            debug!(lease_id = id, keys = removed.len(), "Lease expired");
            changed.extend(removed);
        }
        changed
    }

    fn notify(&mut self, changed: &[String]) {
        if changed.is_empty() {
            return;
        }
        let mut watchers = std::mem::take(&mut self.watchers);
        watchers.retain(|watcher| {
            if changed.iter().any(|key| key.starts_with(&watcher.prefix)) {
                watcher.tx.send(self.snapshot(&watcher.prefix)).is_ok()
            } else {
                !watcher.tx.is_closed()
            }
        });
        self.watchers = watchers;
    }
}

/// In-process coordination store with TTL leases
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
    unavailable: Arc<AtomicBool>,
    _sweeper: Option<tokio::task::JoinHandle<()>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            unavailable: Arc::new(AtomicBool::new(false)),
            _sweeper: None,
        }
    }

    /// Start a background task that expires leases every `interval`
    pub fn with_expiry_sweeper(mut self, interval: Duration) -> Self {
        let weak = Arc::downgrade(&self.state);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(state) = weak.upgrade() else {
                    break;
                };
                {
                    let mut guard = state.lock();
                    let changed = guard.purge_expired(Instant::now());
                    if !changed.is_empty() {
                        trace!(keys = changed.len(), "Expiry sweep removed keys");
                        guard.notify(&changed);
                    }
                }
            }
        });

        if let Some(previous) = self._sweeper.replace(handle) {
            previous.abort();
        }
        self
    }

    /// Make every subsequent request fail with a store error (or recover)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
        info!(unavailable, "Memory store availability changed");
    }

    /// Number of live leases
    pub fn lease_count(&self) -> usize {
        self.with_state(|state| state.leases.len())
    }

    /// All stored keys, ordered
    pub fn keys(&self) -> Vec<String> {
        self.with_state(|state| state.kvs.keys().cloned().collect())
    }

    /// Keys currently attached to a lease
    pub fn lease_keys(&self, lease: LeaseId) -> Vec<String> {
        self.with_state(|state| {
            state
                .leases
                .get(&lease)
                .map(|record| record.keys.iter().cloned().collect())
                .unwrap_or_default()
        })
    }

    fn ensure_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ToporouteError::Store("store unavailable".to_string()));
        }
        Ok(())
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> R {
        let mut state = self.state.lock();
        let expired = state.purge_expired(Instant::now());
        state.notify(&expired);
        f(&mut state)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if let Some(handle) = self._sweeper.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()> {
        self.ensure_available()?;
        self.with_state(|state| {
            state.check_lease(lease)?;
            state.revision += 1;
            let revision = state.revision;
            state.put_locked(key, value, lease, revision);
            state.notify(&[key.to_string()]);
            Ok(())
        })
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        self.ensure_available()?;
        Ok(self.with_state(|state| {
            state.kvs.get(key).map(|stored| KeyValue {
                key: key.to_string(),
                value: stored.value.clone(),
                lease: stored.lease,
                mod_revision: stored.mod_revision,
            })
        }))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        self.ensure_available()?;
        Ok(self.with_state(|state| state.snapshot(prefix)))
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        self.ensure_available()?;
        Ok(self.with_state(|state| {
            if state.remove_key(key) {
                state.revision += 1;
                state.notify(&[key.to_string()]);
                1
            } else {
                0
            }
        }))
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        self.ensure_available()?;
        Ok(self.with_state(|state| {
            let keys: Vec<String> = state
                .snapshot(prefix)
                .into_iter()
                .map(|kv| kv.key)
                .collect();
            for key in &keys {
                state.remove_key(key);
            }
            if !keys.is_empty() {
                state.revision += 1;
                state.notify(&keys);
            }
            keys.len() as u64
        }))
    }

    async fn txn_put(&self, ops: Vec<PutOp>) -> Result<()> {
        self.ensure_available()?;
        self.with_state(|state| {
            for op in &ops {
                state
                    .check_lease(op.lease)
                    .map_err(|e| ToporouteError::TransactionFailed(e.to_string()))?;
            }
            if ops.is_empty() {
                return Ok(());
            }
            state.revision += 1;
            let revision = state.revision;
            for op in &ops {
                state.put_locked(&op.key, &op.value, op.lease, revision);
            }
            let keys: Vec<String> = ops.into_iter().map(|op| op.key).collect();
            state.notify(&keys);
            Ok(())
        })
    }

    async fn grant(&self, ttl: Duration) -> Result<Lease> {
        self.ensure_available()?;
        Ok(self.with_state(|state| {
            state.next_lease_id += 1;
            let id = state.next_lease_id;
            state.leases.insert(
                id,
                LeaseRecord {
                    ttl,
                    deadline: Instant::now() + ttl,
                    keys: BTreeSet::new(),
                },
            );
            debug!(lease_id = id, ttl_ms = ttl.as_millis() as u64, "Lease granted");
            Lease { id, ttl }
        }))
    }

    async fn revoke(&self, lease: LeaseId) -> Result<()> {
        self.ensure_available()?;
        self.with_state(|state| {
            let removed = state
                .remove_lease(lease)
                .ok_or(ToporouteError::LeaseNotFound(lease))?;
            debug!(lease_id = lease, keys = removed.len(), "Lease revoked");
            state.notify(&removed);
            Ok(())
        })
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream> {
        self.ensure_available()?;
        let ttl = self
            .with_state(|state| state.leases.get(&lease).map(|record| record.ttl))
            .ok_or(ToporouteError::LeaseNotFound(lease))?;

        let (tx, rx) = mpsc::channel(KEEPALIVE_CHANNEL_SIZE);
        let weak = Arc::downgrade(&self.state);
        let period = (ttl / 3).max(MIN_KEEPALIVE_INTERVAL);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let renewed = {
                    let Some(state) = weak.upgrade() else {
                        break;
                    };
                    let mut guard = state.lock();
                    let now = Instant::now();
                    match guard.leases.get_mut(&lease) {
                        Some(record) if record.deadline > now => {
                            record.deadline = now + record.ttl;
                            true
                        }
                        _ => false,
                    }
                };
                if !renewed {
                    debug!(lease_id = lease, "Keepalive stopped, lease is gone");
                    break;
                }
                if tx.send(KeepAliveResponse { id: lease, ttl }).await.is_err() {
                    trace!(lease_id = lease, "Keepalive receiver dropped");
                    break;
                }
            }
        });

        Ok(rx)
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream> {
        self.ensure_available()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.with_state(|state| {
            let _ = tx.send(state.snapshot(prefix));
            state.watchers.push(Watcher {
                prefix: prefix.to_string(),
                tx,
            });
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_and_prefix() {
        let store = MemoryStore::new();
        store.put("/ns/as/topics/a", "1", None).await.unwrap();
        store.put("/ns/as/topics/b", "2", None).await.unwrap();
        store.put("/ns/as/services/1", "x", None).await.unwrap();

        let kv = store.get("/ns/as/topics/a").await.unwrap().unwrap();
        assert_eq!(kv.value, "1");
        assert!(kv.lease.is_none());

        let topics = store.get_prefix("/ns/as/topics").await.unwrap();
        assert_eq!(topics.len(), 2);
        assert_eq!(topics[0].key, "/ns/as/topics/a");
        assert_eq!(topics[1].key, "/ns/as/topics/b");

        assert!(store.get("/missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_and_delete_prefix() {
        let store = MemoryStore::new();
        store.put("/p/a", "1", None).await.unwrap();
        store.put("/p/b", "2", None).await.unwrap();
        store.put("/q/c", "3", None).await.unwrap();

        assert_eq!(store.delete("/p/a").await.unwrap(), 1);
        assert_eq!(store.delete("/p/a").await.unwrap(), 0);
        assert_eq!(store.delete_prefix("/p").await.unwrap(), 1);
        assert_eq!(store.keys(), vec!["/q/c".to_string()]);
    }

    #[tokio::test]
    async fn test_revoke_deletes_only_keys_still_on_lease() {
        let store = MemoryStore::new();
        let old = store.grant(Duration::from_secs(20)).await.unwrap();
        let new = store.grant(Duration::from_secs(20)).await.unwrap();

        store.put("/t/a", "old", Some(old.id)).await.unwrap();
        store.put("/t/b", "old", Some(old.id)).await.unwrap();
        // Re-put moves the key to the newer lease
        store.put("/t/b", "new", Some(new.id)).await.unwrap();

        store.revoke(old.id).await.unwrap();
        assert!(store.get("/t/a").await.unwrap().is_none());
        assert_eq!(store.get("/t/b").await.unwrap().unwrap().value, "new");
        assert_eq!(store.lease_count(), 1);

        let err = store.revoke(old.id).await.unwrap_err();
        assert_eq!(err, ToporouteError::LeaseNotFound(old.id));
    }

    #[tokio::test]
    async fn test_put_with_unknown_lease_fails() {
        let store = MemoryStore::new();
        let err = store.put("/k", "v", Some(99)).await.unwrap_err();
        assert_eq!(err, ToporouteError::LeaseNotFound(99));
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_txn_is_all_or_nothing() {
        let store = MemoryStore::new();
        let lease = store.grant(Duration::from_secs(20)).await.unwrap();

        let err = store
            .txn_put(vec![
                PutOp::new("/t/a", "1", Some(lease.id)),
                PutOp::new("/t/b", "2", Some(12345)),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, ToporouteError::TransactionFailed(_)));
        assert!(store.keys().is_empty());

        store
            .txn_put(vec![
                PutOp::new("/t/a", "1", Some(lease.id)),
                PutOp::new("/t/b", "2", Some(lease.id)),
            ])
            .await
            .unwrap();
        assert_eq!(store.lease_keys(lease.id).len(), 2);

        let kvs = store.get_prefix("/t/").await.unwrap();
        assert_eq!(kvs[0].mod_revision, kvs[1].mod_revision);
    }

    #[tokio::test]
    async fn test_watch_delivers_snapshots() {
        let store = MemoryStore::new();
        store.put("/w/a", "1", None).await.unwrap();

        let mut watch = store.watch_prefix("/w/").await.unwrap();
        let initial = watch.recv().await.unwrap();
        assert_eq!(initial.len(), 1);

        store.put("/w/b", "2", None).await.unwrap();
        let update = watch.recv().await.unwrap();
        assert_eq!(update.len(), 2);

        // Writes outside the prefix are not delivered
        store.put("/other", "x", None).await.unwrap();
        store.delete("/w/a").await.unwrap();
        let update = watch.recv().await.unwrap();
        assert_eq!(update.len(), 1);
        assert_eq!(update[0].key, "/w/b");
    }

    #[tokio::test]
    async fn test_lease_expires_without_keepalive() {
        let store = MemoryStore::new();
        let lease = store.grant(Duration::from_millis(50)).await.unwrap();
        store.put("/e/a", "1", Some(lease.id)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(store.get("/e/a").await.unwrap().is_none());
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test]
    async fn test_keepalive_renews_lease() {
        let store = MemoryStore::new();
        let lease = store.grant(Duration::from_millis(90)).await.unwrap();
        store.put("/k/a", "1", Some(lease.id)).await.unwrap();

        let mut acks = store.keep_alive(lease.id).await.unwrap();
        let first = acks.recv().await.unwrap();
        assert_eq!(first.id, lease.id);

        let drain = tokio::spawn(async move { while acks.recv().await.is_some() {} });
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(store.get("/k/a").await.unwrap().is_some());

        store.revoke(lease.id).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), drain)
            .await
            .expect("keepalive stream should close after revoke")
            .unwrap();
    }

    #[tokio::test]
    async fn test_sweeper_notifies_watchers_on_expiry() {
        let store = MemoryStore::new().with_expiry_sweeper(Duration::from_millis(10));
        let lease = store.grant(Duration::from_millis(40)).await.unwrap();
        store.put("/s/a", "1", Some(lease.id)).await.unwrap();

        let mut watch = store.watch_prefix("/s/").await.unwrap();
        assert_eq!(watch.recv().await.unwrap().len(), 1);

        let update = tokio::time::timeout(Duration::from_secs(1), watch.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(update.is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_requests() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let err = store.put("/k", "v", None).await.unwrap_err();
        assert!(matches!(err, ToporouteError::Store(_)));
        assert!(err.is_transient());

        store.set_unavailable(false);
        store.put("/k", "v", None).await.unwrap();
    }
}
