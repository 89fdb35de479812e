//! In-memory backends for single-pod deployments and tests.
//!
//! Semantics mirror the Redis backends: TTL'd snapshot entries, fencing
//! tokens on the lock, and a bus hub whose endpoints never receive their
//! own publishes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{BusHandler, MutationLock, SnapshotBus, SnapshotStore};
use crate::error::ListenResult;
use crate::group::types::Snapshot;
use crate::protocol_constants::SNAPSHOT_TTL_SECS;
use crate::utils::now_millis;

// ─────────────────────────────────────────────────────────────────────────────
// Snapshot store
// ─────────────────────────────────────────────────────────────────────────────

/// Pod-local snapshot store with the same TTL behavior as the Redis one.
pub struct MemorySnapshotStore {
    entries: DashMap<String, (Snapshot, u64)>,
    ttl_ms: u64,
}

impl Default for MemorySnapshotStore {
    fn default() -> Self {
        Self::with_ttl_ms(SNAPSHOT_TTL_SECS * 1_000)
    }
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl_ms(ttl_ms: u64) -> Self {
        Self {
            entries: DashMap::new(),
            ttl_ms,
        }
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn get(&self, group_id: &str) -> ListenResult<Option<Snapshot>> {
        let expired = match self.entries.get(group_id) {
            Some(entry) => now_millis().saturating_sub(entry.1) >= self.ttl_ms,
            None => return Ok(None),
        };
        if expired {
            self.entries.remove(group_id);
            return Ok(None);
        }
        Ok(self.entries.get(group_id).map(|e| e.0.clone()))
    }

    async fn set(&self, snapshot: &Snapshot) -> ListenResult<()> {
        self.entries
            .insert(snapshot.group_id.clone(), (snapshot.clone(), now_millis()));
        Ok(())
    }

    async fn delete(&self, group_id: &str) -> ListenResult<()> {
        self.entries.remove(group_id);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cluster bus
// ─────────────────────────────────────────────────────────────────────────────

/// Shared hub connecting the in-memory bus endpoints of several coordinator
/// instances (used to exercise cross-pod behavior in one process).
#[derive(Default)]
pub struct MemoryBusHub {
    handlers: DashMap<u64, BusHandler>,
    next_endpoint: AtomicU64,
}

impl MemoryBusHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates a bus endpoint; each pod-under-test gets its own.
    pub fn endpoint(self: &Arc<Self>) -> MemorySnapshotBus {
        MemorySnapshotBus {
            hub: Arc::clone(self),
            endpoint_id: self.next_endpoint.fetch_add(1, Ordering::Relaxed),
        }
    }
}

/// One pod's view of the in-memory bus. Publishes are delivered inline to
/// every *other* endpoint's handler.
pub struct MemorySnapshotBus {
    hub: Arc<MemoryBusHub>,
    endpoint_id: u64,
}

#[async_trait]
impl SnapshotBus for MemorySnapshotBus {
    async fn publish(&self, snapshot: &Snapshot) -> ListenResult<()> {
        let peers: Vec<BusHandler> = self
            .hub
            .handlers
            .iter()
            .filter(|entry| *entry.key() != self.endpoint_id)
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for handler in peers {
            handler(snapshot.clone()).await;
        }
        Ok(())
    }

    async fn subscribe(&self, handler: BusHandler) -> ListenResult<()> {
        self.hub.handlers.insert(self.endpoint_id, handler);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Mutation lock
// ─────────────────────────────────────────────────────────────────────────────

/// Pod-local lease table with expiry and fencing-token release.
#[derive(Default)]
pub struct MemoryMutationLock {
    leases: DashMap<String, (String, u64)>,
}

impl MemoryMutationLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MutationLock for MemoryMutationLock {
    async fn acquire(&self, group_id: &str, token: &str, ttl_ms: u64) -> ListenResult<bool> {
        let now = now_millis();
        let mut acquired = false;
        self.leases
            .entry(group_id.to_string())
            .and_modify(|lease| {
                if lease.1 <= now {
                    // Expired lease: steal it
                    *lease = (token.to_string(), now + ttl_ms);
                    acquired = true;
                }
            })
            .or_insert_with(|| {
                acquired = true;
                (token.to_string(), now + ttl_ms)
            });
        Ok(acquired)
    }

    async fn release(&self, group_id: &str, token: &str) -> ListenResult<bool> {
        Ok(self
            .leases
            .remove_if(group_id, |_, lease| lease.0 == token)
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use parking_lot::Mutex;

    #[tokio::test]
    async fn store_round_trip_and_delete() {
        let store = MemorySnapshotStore::new();
        assert!(store.get("g1").await.unwrap().is_none());

        let snapshot = Snapshot::empty("g1");
        store.set(&snapshot).await.unwrap();
        assert_eq!(store.get("g1").await.unwrap(), Some(snapshot));

        store.delete("g1").await.unwrap();
        assert!(store.get("g1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn store_expires_after_ttl() {
        let store = MemorySnapshotStore::with_ttl_ms(0);
        store.set(&Snapshot::empty("g1")).await.unwrap();
        assert!(store.get("g1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn bus_skips_own_endpoint() {
        let hub = MemoryBusHub::new();
        let pod_a = hub.endpoint();
        let pod_b = hub.endpoint();

        let seen_by_a: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_by_b: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen_by_a);
        pod_a
            .subscribe(Arc::new(move |snapshot| {
                let sink = Arc::clone(&sink);
                async move { sink.lock().push(snapshot.group_id) }.boxed()
            }))
            .await
            .unwrap();
        let sink = Arc::clone(&seen_by_b);
        pod_b
            .subscribe(Arc::new(move |snapshot| {
                let sink = Arc::clone(&sink);
                async move { sink.lock().push(snapshot.group_id) }.boxed()
            }))
            .await
            .unwrap();

        pod_a.publish(&Snapshot::empty("g1")).await.unwrap();

        assert!(seen_by_a.lock().is_empty(), "publisher must not hear itself");
        assert_eq!(*seen_by_b.lock(), vec!["g1".to_string()]);
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let lock = MemoryMutationLock::new();
        assert!(lock.acquire("g1", "tok-a", 3_000).await.unwrap());
        assert!(!lock.acquire("g1", "tok-b", 3_000).await.unwrap());

        // Wrong token cannot release
        assert!(!lock.release("g1", "tok-b").await.unwrap());
        assert!(lock.release("g1", "tok-a").await.unwrap());

        assert!(lock.acquire("g1", "tok-b", 3_000).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_stolen() {
        let lock = MemoryMutationLock::new();
        assert!(lock.acquire("g1", "tok-a", 0).await.unwrap());
        assert!(lock.acquire("g1", "tok-b", 3_000).await.unwrap());
        // The original holder's release is fenced off
        assert!(!lock.release("g1", "tok-a").await.unwrap());
    }

    #[tokio::test]
    async fn locks_are_per_group() {
        let lock = MemoryMutationLock::new();
        assert!(lock.acquire("g1", "tok-a", 3_000).await.unwrap());
        assert!(lock.acquire("g2", "tok-b", 3_000).await.unwrap());
    }
}
