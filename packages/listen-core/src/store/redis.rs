//! Redis backends for the snapshot store, cluster bus, and mutation lock.
//!
//! Key layout:
//! - snapshots: `listen-together:snapshot:<groupId>` (`SET ... EX`)
//! - locks: `<prefix>:<groupId>` (`SET NX PX` + Lua compare-and-delete)
//! - bus: pub/sub channel `listen-together:snapshots`
//!
//! Payloads are canonical JSON. Bus frames carry the origin pod id so a
//! subscriber can drop its own publishes.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{BusHandler, MutationLock, SnapshotBus, SnapshotStore};
use crate::error::{ListenError, ListenResult};
use crate::group::types::Snapshot;
use crate::protocol_constants::{SNAPSHOT_BUS_CHANNEL, SNAPSHOT_KEY_PREFIX, SNAPSHOT_TTL_SECS};

/// Atomic compare-and-delete used for fenced lock release.
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

fn infra(err: redis::RedisError) -> ListenError {
    ListenError::Infrastructure(format!("redis: {err}"))
}

fn snapshot_key(group_id: &str) -> String {
    format!("{SNAPSHOT_KEY_PREFIX}:{group_id}")
}

// ─────────────────────────────────────────────────────────────────────────────
// Snapshot store
// ─────────────────────────────────────────────────────────────────────────────

pub struct RedisSnapshotStore {
    conn: ConnectionManager,
    ttl_secs: u64,
}

impl RedisSnapshotStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            ttl_secs: SNAPSHOT_TTL_SECS,
        }
    }
}

#[async_trait]
impl SnapshotStore for RedisSnapshotStore {
    async fn get(&self, group_id: &str) -> ListenResult<Option<Snapshot>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(snapshot_key(group_id)).await.map_err(infra)?;
        raw.map(|payload| {
            serde_json::from_str(&payload).map_err(|e| {
                ListenError::Infrastructure(format!("corrupt snapshot for {group_id}: {e}"))
            })
        })
        .transpose()
    }

    async fn set(&self, snapshot: &Snapshot) -> ListenResult<()> {
        let payload = serde_json::to_string(snapshot)
            .map_err(|e| ListenError::Infrastructure(format!("snapshot encode: {e}")))?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(snapshot_key(&snapshot.group_id), payload, self.ttl_secs)
            .await
            .map_err(infra)?;
        Ok(())
    }

    async fn delete(&self, group_id: &str) -> ListenResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(snapshot_key(group_id)).await.map_err(infra)?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cluster bus
// ─────────────────────────────────────────────────────────────────────────────

/// Wire frame on the snapshot channel.
#[derive(Serialize, Deserialize)]
struct BusFrame {
    origin: String,
    snapshot: Snapshot,
}

pub struct RedisSnapshotBus {
    client: redis::Client,
    publish_conn: ConnectionManager,
    pod_id: String,
    cancel: CancellationToken,
}

impl RedisSnapshotBus {
    pub fn new(
        client: redis::Client,
        publish_conn: ConnectionManager,
        pod_id: String,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            publish_conn,
            pod_id,
            cancel,
        }
    }
}

#[async_trait]
impl SnapshotBus for RedisSnapshotBus {
    async fn publish(&self, snapshot: &Snapshot) -> ListenResult<()> {
        let frame = BusFrame {
            origin: self.pod_id.clone(),
            snapshot: snapshot.clone(),
        };
        let payload = serde_json::to_string(&frame)
            .map_err(|e| ListenError::Infrastructure(format!("bus frame encode: {e}")))?;
        let mut conn = self.publish_conn.clone();
        let _: () = conn
            .publish(SNAPSHOT_BUS_CHANNEL, payload)
            .await
            .map_err(infra)?;
        Ok(())
    }

    async fn subscribe(&self, handler: BusHandler) -> ListenResult<()> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(infra)?;
        pubsub
            .subscribe(SNAPSHOT_BUS_CHANNEL)
            .await
            .map_err(infra)?;

        let own_pod = self.pod_id.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            use futures::StreamExt;
            let mut messages = pubsub.on_message();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = messages.next() => {
                        let Some(msg) = msg else { break };
                        let payload: String = match msg.get_payload() {
                            Ok(p) => p,
                            Err(e) => {
                                log::warn!("[ClusterBus] Undecodable message payload: {e}");
                                continue;
                            }
                        };
                        match serde_json::from_str::<BusFrame>(&payload) {
                            Ok(frame) if frame.origin == own_pod => {} // own publish replayed
                            Ok(frame) => handler(frame.snapshot).await,
                            Err(e) => log::warn!("[ClusterBus] Undecodable bus frame: {e}"),
                        }
                    }
                }
            }
            log::debug!("[ClusterBus] Subscriber loop stopped");
        });
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Mutation lock
// ─────────────────────────────────────────────────────────────────────────────

pub struct RedisMutationLock {
    conn: ConnectionManager,
    prefix: String,
    release: redis::Script,
}

impl RedisMutationLock {
    pub fn new(conn: ConnectionManager, prefix: String) -> Self {
        Self {
            conn,
            prefix,
            release: redis::Script::new(RELEASE_SCRIPT),
        }
    }

    fn key(&self, group_id: &str) -> String {
        format!("{}:{}", self.prefix, group_id)
    }
}

#[async_trait]
impl MutationLock for RedisMutationLock {
    async fn acquire(&self, group_id: &str, token: &str, ttl_ms: u64) -> ListenResult<bool> {
        let mut conn = self.conn.clone();
        // SET NX PX: atomic acquire-with-expiry; nil reply means held
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(group_id))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(infra)?;
        Ok(reply.is_some())
    }

    async fn release(&self, group_id: &str, token: &str) -> ListenResult<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release
            .key(self.key(group_id))
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(infra)?;
        Ok(deleted == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol_constants::DEFAULT_MUTATION_LOCK_PREFIX;

    #[test]
    fn snapshot_keys_follow_layout() {
        assert_eq!(snapshot_key("g1"), "listen-together:snapshot:g1");
    }

    #[test]
    fn lock_keys_are_prefixed() {
        // Only the key layout is unit-testable without a live server
        let prefix = DEFAULT_MUTATION_LOCK_PREFIX;
        assert_eq!(format!("{prefix}:g1"), "listen-together:lock:g1");
    }

    #[test]
    fn bus_frames_round_trip() {
        let frame = BusFrame {
            origin: "pod-a".into(),
            snapshot: Snapshot::empty("g1"),
        };
        let json = serde_json::to_string(&frame).unwrap();
        let parsed: BusFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.origin, "pod-a");
        assert_eq!(parsed.snapshot.group_id, "g1");
    }
}
