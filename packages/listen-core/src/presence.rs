//! Per-socket presence, disconnect grace, and reconnect SLO sampling.
//!
//! Responsibilities:
//! - Track which sockets belong to which member of which group
//! - Schedule member cleanup when the last socket disconnects, cancel it
//!   on reconnect or explicit leave
//! - Sample reconnect latency against the SLO
//!
//! Cleanup itself (removing the DB membership row and mutating the group)
//! is not done here: expired members are handed to the coordinator through
//! the cleanup channel returned by [`PresenceLayer::new`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthContext;
use crate::observability::CoordMetrics;
use crate::utils::now_millis;

/// Capacity of the expired-member cleanup queue.
const CLEANUP_QUEUE_CAPACITY: usize = 64;

/// A member expired from a group; the coordinator must remove it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredMember {
    pub group_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone)]
struct SocketSession {
    user_id: String,
    username: String,
    group_id: Option<String>,
}

#[derive(Debug, Default)]
struct MemberPresence {
    sockets: HashSet<String>,
    disconnected_at_ms: Option<u64>,
}

type MemberKey = (String, String); // (group_id, user_id)

pub struct PresenceLayer {
    sockets: DashMap<String, SocketSession>,
    members: DashMap<MemberKey, MemberPresence>,
    grace_timers: DashMap<MemberKey, JoinHandle<()>>,
    cleanup_tx: mpsc::Sender<ExpiredMember>,
    metrics: Arc<CoordMetrics>,
    grace_ms: u64,
    slo_ms: u64,
    cancel: CancellationToken,
}

impl PresenceLayer {
    /// Creates the layer and the receiver the coordinator drains for
    /// expired members.
    pub fn new(
        metrics: Arc<CoordMetrics>,
        grace_ms: u64,
        slo_ms: u64,
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<ExpiredMember>) {
        let (cleanup_tx, cleanup_rx) = mpsc::channel(CLEANUP_QUEUE_CAPACITY);
        (
            Arc::new(Self {
                sockets: DashMap::new(),
                members: DashMap::new(),
                grace_timers: DashMap::new(),
                cleanup_tx,
                metrics,
                grace_ms,
                slo_ms,
                cancel,
            }),
            cleanup_rx,
        )
    }

    /// Registers a freshly authenticated socket (no group yet).
    pub fn register_socket(&self, socket_id: &str, ctx: &AuthContext) {
        self.sockets.insert(
            socket_id.to_string(),
            SocketSession {
                user_id: ctx.user_id.clone(),
                username: ctx.username.clone(),
                group_id: None,
            },
        );
    }

    /// The group this socket has joined, if any.
    pub fn socket_group(&self, socket_id: &str) -> Option<String> {
        self.sockets.get(socket_id).and_then(|s| s.group_id.clone())
    }

    pub fn socket_user(&self, socket_id: &str) -> Option<(String, String)> {
        self.sockets
            .get(socket_id)
            .map(|s| (s.user_id.clone(), s.username.clone()))
    }

    /// Attaches a socket to a group. When the member was in disconnect
    /// grace, cancels the pending cleanup and returns the sampled reconnect
    /// latency.
    pub fn join_group(&self, socket_id: &str, group_id: &str) -> Option<u64> {
        let user_id = {
            let mut session = self.sockets.get_mut(socket_id)?;
            session.group_id = Some(group_id.to_string());
            session.user_id.clone()
        };

        let key = (group_id.to_string(), user_id);
        if let Some((_, timer)) = self.grace_timers.remove(&key) {
            timer.abort();
        }

        let mut presence = self.members.entry(key).or_default();
        presence.sockets.insert(socket_id.to_string());
        let latency = presence
            .disconnected_at_ms
            .take()
            .map(|at| now_millis().saturating_sub(at));
        if let Some(latency_ms) = latency {
            self.metrics.record_reconnect(latency_ms, self.slo_ms);
        }
        latency
    }

    /// Explicit leave: the member is gone now, no grace applies.
    pub fn leave_group(&self, socket_id: &str) -> Option<ExpiredMember> {
        let (user_id, group_id) = {
            let mut session = self.sockets.get_mut(socket_id)?;
            let group_id = session.group_id.take()?;
            (session.user_id.clone(), group_id)
        };

        let key = (group_id.clone(), user_id.clone());
        if let Some((_, timer)) = self.grace_timers.remove(&key) {
            timer.abort();
        }
        self.members.remove(&key);
        Some(ExpiredMember { group_id, user_id })
    }

    /// Socket dropped. When this was the member's last socket in its group,
    /// schedules cleanup after the grace period.
    pub fn disconnect(self: &Arc<Self>, socket_id: &str) {
        let Some((_, session)) = self.sockets.remove(socket_id) else {
            return;
        };
        let Some(group_id) = session.group_id else {
            return;
        };

        let key = (group_id.clone(), session.user_id.clone());
        let now_fully_disconnected = {
            let Some(mut presence) = self.members.get_mut(&key) else {
                return;
            };
            presence.sockets.remove(socket_id);
            if presence.sockets.is_empty() {
                presence.disconnected_at_ms = Some(now_millis());
                true
            } else {
                false
            }
        };

        if now_fully_disconnected {
            self.schedule_cleanup(key);
        }
    }

    /// Currently live socket count for a member (diagnostics and tests).
    pub fn socket_count(&self, group_id: &str, user_id: &str) -> usize {
        self.members
            .get(&(group_id.to_string(), user_id.to_string()))
            .map(|p| p.sockets.len())
            .unwrap_or(0)
    }

    /// Aborts all pending grace timers (shutdown path).
    pub fn shutdown(&self) {
        self.grace_timers.retain(|_, timer| {
            timer.abort();
            false
        });
    }

    fn schedule_cleanup(self: &Arc<Self>, key: MemberKey) {
        self.metrics.record_cleanup_scheduled();
        log::debug!(
            "[Presence] Member {} fully disconnected from {}, cleanup in {}ms",
            key.1,
            key.0,
            self.grace_ms
        );

        let layer = Arc::clone(self);
        let timer_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = layer.cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(layer.grace_ms)) => {}
            }

            // Re-check: a reconnect may have raced the timer
            let still_gone = layer
                .members
                .get(&timer_key)
                .is_some_and(|p| p.sockets.is_empty());
            if !still_gone {
                return;
            }
            layer.members.remove(&timer_key);
            layer.grace_timers.remove(&timer_key);
            layer.metrics.record_cleanup_executed();

            let (group_id, user_id) = timer_key;
            log::info!(
                "[Presence] Grace expired for {} in {}, removing membership",
                user_id,
                group_id
            );
            if layer
                .cleanup_tx
                .send(ExpiredMember { group_id, user_id })
                .await
                .is_err()
            {
                log::warn!("[Presence] Cleanup queue closed, expired member dropped");
            }
        });

        if let Some(previous) = self.grace_timers.insert(key, handle) {
            previous.abort();
        }
    }
}
