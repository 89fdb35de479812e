//! Shared-state abstractions: snapshot store, cluster bus, mutation lock.
//!
//! All three are written against traits so the coordinator never knows which
//! backend it is talking to:
//!
//! - [`SnapshotStore`]: durable-enough KV holding the authoritative
//!   per-group snapshot (TTL'd, last-writer-wins; writers are serialized per
//!   group by the mutation lock).
//! - [`SnapshotBus`]: best-effort at-least-once pub/sub of snapshots to
//!   other pods. Ordering is not guaranteed; the snapshot `version` is the
//!   ordering authority.
//! - [`MutationLock`]: single-writer lease per group id with a fencing
//!   token and finite TTL.
//!
//! `memory` backends serve single-pod deployments and tests; `redis`
//! backends serve horizontal scaling. Disabled modes degrade to pod-local
//! behavior and are logged once at startup by the bootstrap.

mod memory;
mod redis;

pub use memory::{MemoryBusHub, MemoryMutationLock, MemorySnapshotBus, MemorySnapshotStore};
pub use redis::{RedisMutationLock, RedisSnapshotBus, RedisSnapshotStore};

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::ListenResult;
use crate::group::types::Snapshot;

/// Handler invoked for every snapshot published by *another* pod.
pub type BusHandler = Arc<dyn Fn(Snapshot) -> BoxFuture<'static, ()> + Send + Sync>;

/// Durable-enough KV for authoritative per-group snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn get(&self, group_id: &str) -> ListenResult<Option<Snapshot>>;
    async fn set(&self, snapshot: &Snapshot) -> ListenResult<()>;
    async fn delete(&self, group_id: &str) -> ListenResult<()>;
    fn is_enabled(&self) -> bool {
        true
    }
}

/// Pub/sub channel broadcasting snapshots to all pods.
#[async_trait]
pub trait SnapshotBus: Send + Sync {
    async fn publish(&self, snapshot: &Snapshot) -> ListenResult<()>;
    /// Installs the handler for snapshots from other pods. Called once at
    /// startup.
    async fn subscribe(&self, handler: BusHandler) -> ListenResult<()>;
    fn is_enabled(&self) -> bool {
        true
    }
}

/// Per-group exclusive lease with fencing.
#[async_trait]
pub trait MutationLock: Send + Sync {
    /// Acquires the lease for `group_id` iff none exists. Returns `false`
    /// when the lease is held by someone else.
    async fn acquire(&self, group_id: &str, token: &str, ttl_ms: u64) -> ListenResult<bool>;
    /// Releases the lease iff the stored token matches (compare-and-delete).
    async fn release(&self, group_id: &str, token: &str) -> ListenResult<bool>;
}

/// Store stand-in when `LISTEN_TOGETHER_STATE_STORE_ENABLED` is off:
/// operations are no-ops and `get` returns `None`, degrading the system to
/// pod-local state.
pub struct DisabledSnapshotStore;

#[async_trait]
impl SnapshotStore for DisabledSnapshotStore {
    async fn get(&self, _group_id: &str) -> ListenResult<Option<Snapshot>> {
        Ok(None)
    }
    async fn set(&self, _snapshot: &Snapshot) -> ListenResult<()> {
        Ok(())
    }
    async fn delete(&self, _group_id: &str) -> ListenResult<()> {
        Ok(())
    }
    fn is_enabled(&self) -> bool {
        false
    }
}

/// Bus stand-in when cross-pod fanout is off: publishes vanish and no
/// subscription is installed.
pub struct DisabledSnapshotBus;

#[async_trait]
impl SnapshotBus for DisabledSnapshotBus {
    async fn publish(&self, _snapshot: &Snapshot) -> ListenResult<()> {
        Ok(())
    }
    async fn subscribe(&self, _handler: BusHandler) -> ListenResult<()> {
        Ok(())
    }
    fn is_enabled(&self) -> bool {
        false
    }
}
