//! The group coordinator: ties the state machine to its distributed
//! harness.
//!
//! Every mutation runs the same protocol: acquire the group's mutation
//! lease (or the pod-local critical section when the lock subsystem is
//! disabled), rehydrate from the snapshot store, apply through the group
//! manager, enqueue persist-and-publish on the snapshot pipeline and flush
//! it, release the lease, then fan the resulting deltas out to the group's
//! room. Ready-gate deadline timers and the cluster-bus subscriber live
//! here too, as does the explicit start/shutdown lifecycle.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ListenError, ListenResult};
use crate::events::GroupEvent;
use crate::group::manager::{GateTiming, GroupManager, MutationOutcome};
use crate::group::types::{EndReason, PlaybackCmd, QueueCmd, Snapshot};
use crate::membership::GroupMembership;
use crate::observability::CoordMetrics;
use crate::pipeline::SnapshotPipeline;
use crate::presence::ExpiredMember;
use crate::rooms::RoomRegistry;
use crate::store::{MutationLock, SnapshotBus, SnapshotStore};
use crate::utils::now_millis;

/// Bounded retries for internally-driven mutations (gate deadlines, stale
/// cleanup) that must not give up on the first lock conflict.
const INTERNAL_RETRY_LIMIT: u32 = 10;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub lock_enabled: bool,
    pub lock_ttl_ms: u64,
    pub gate_timing: GateTiming,
}

pub struct GroupCoordinator {
    manager: GroupManager,
    store: Arc<dyn SnapshotStore>,
    bus: Arc<dyn SnapshotBus>,
    lock: Arc<dyn MutationLock>,
    pipeline: SnapshotPipeline,
    rooms: Arc<RoomRegistry>,
    membership: Arc<dyn GroupMembership>,
    metrics: Arc<CoordMetrics>,
    /// Fallback critical sections when the lock subsystem is disabled.
    local_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    gate_timers: DashMap<String, JoinHandle<()>>,
    cfg: CoordinatorConfig,
    cancel: CancellationToken,
}

impl GroupCoordinator {
    /// Builds the coordinator and installs the cluster-bus subscription.
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        cfg: CoordinatorConfig,
        store: Arc<dyn SnapshotStore>,
        bus: Arc<dyn SnapshotBus>,
        lock: Arc<dyn MutationLock>,
        rooms: Arc<RoomRegistry>,
        membership: Arc<dyn GroupMembership>,
        metrics: Arc<CoordMetrics>,
        cancel: CancellationToken,
    ) -> ListenResult<Arc<Self>> {
        let coordinator = Arc::new(Self {
            manager: GroupManager::new(cfg.gate_timing),
            pipeline: SnapshotPipeline::new(Arc::clone(&store), Arc::clone(&bus)),
            store,
            bus,
            lock,
            rooms,
            membership,
            metrics,
            local_locks: DashMap::new(),
            gate_timers: DashMap::new(),
            cfg,
            cancel,
        });

        let weak = Arc::downgrade(&coordinator);
        coordinator
            .bus
            .subscribe(Arc::new(move |snapshot| {
                let weak = weak.clone();
                async move {
                    if let Some(coordinator) = weak.upgrade() {
                        coordinator.handle_remote_snapshot(snapshot).await;
                    }
                }
                .boxed()
            }))
            .await?;

        Ok(coordinator)
    }

    /// Cancels gate timers and drains the persistence pipeline.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.gate_timers.retain(|_, timer| {
            timer.abort();
            false
        });
        self.pipeline.shutdown().await;
        log::info!("[Coordinator] Shutdown complete");
    }

    pub fn metrics(&self) -> &CoordMetrics {
        &self.metrics
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Client-driven operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Joins a user to a group: membership collaborator first (validates or
    /// creates the DB row), then the pod-local join mutation. Returns the
    /// post-join snapshot for the unicast `group:state`.
    pub async fn join_group(
        self: &Arc<Self>,
        user_id: &str,
        username: &str,
        group_id: &str,
    ) -> ListenResult<Snapshot> {
        let seed = self
            .membership
            .join_group_by_id(user_id, username, group_id)
            .await?;

        let outcome = self
            .mutate(group_id, move |manager, now_ms| {
                manager.ensure_group(seed);
                manager.join_member(group_id, user_id, username, now_ms)
            })
            .await?;
        if let Some(outcome) = &outcome {
            self.commit(group_id, outcome).await;
        }

        self.manager
            .snapshot(group_id)
            .ok_or_else(|| ListenError::NotFound(group_id.to_string()))
    }

    /// Explicit leave: removes the DB row, then the member.
    pub async fn leave_group(self: &Arc<Self>, user_id: &str, group_id: &str) -> ListenResult<()> {
        self.membership.leave_group(user_id, group_id).await?;
        match self
            .mutate(group_id, |manager, now_ms| {
                manager.leave_member(group_id, user_id, now_ms)
            })
            .await
        {
            Ok(Some(outcome)) => {
                self.commit(group_id, &outcome).await;
                Ok(())
            }
            Ok(None) => Ok(()),
            // The group was already gone on this pod; the row removal stands
            Err(ListenError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn apply_playback(
        self: &Arc<Self>,
        group_id: &str,
        user_id: &str,
        cmd: PlaybackCmd,
    ) -> ListenResult<()> {
        let outcome = self
            .mutate(group_id, move |manager, now_ms| {
                manager.apply_playback(group_id, user_id, cmd, now_ms)
            })
            .await?;
        if let Some(outcome) = &outcome {
            self.commit(group_id, outcome).await;
        }
        Ok(())
    }

    pub async fn apply_queue(
        self: &Arc<Self>,
        group_id: &str,
        user_id: &str,
        cmd: QueueCmd,
    ) -> ListenResult<()> {
        let outcome = self
            .mutate(group_id, move |manager, now_ms| {
                manager.apply_queue(group_id, user_id, cmd, now_ms)
            })
            .await?;
        if let Some(outcome) = &outcome {
            self.commit(group_id, outcome).await;
        }
        Ok(())
    }

    /// `ready` report. When this closes the gate, the `group:play-at`
    /// broadcast is enqueued on every room socket before this returns, so
    /// the reporter observes it before its own acknowledgement.
    pub async fn report_ready(
        self: &Arc<Self>,
        group_id: &str,
        user_id: &str,
    ) -> ListenResult<()> {
        let outcome = self
            .mutate(group_id, move |manager, now_ms| {
                manager.report_ready(group_id, user_id, now_ms)
            })
            .await?;
        if let Some(outcome) = &outcome {
            self.commit(group_id, outcome).await;
        }
        Ok(())
    }

    /// Read path for the polling fallback: pod-local state, falling back to
    /// the store.
    pub async fn current_snapshot(&self, group_id: &str) -> ListenResult<Snapshot> {
        if let Some(snapshot) = self.manager.snapshot(group_id) {
            return Ok(snapshot);
        }
        self.store
            .get(group_id)
            .await?
            .ok_or_else(|| ListenError::NotFound(group_id.to_string()))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internally-driven operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Drains the presence layer's expired-member queue.
    pub fn spawn_cleanup_worker(
        self: &Arc<Self>,
        mut expired_rx: mpsc::Receiver<ExpiredMember>,
    ) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = coordinator.cancel.cancelled() => break,
                    expired = expired_rx.recv() => {
                        let Some(expired) = expired else { break };
                        coordinator.expire_member(expired).await;
                    }
                }
            }
        })
    }

    /// Stale-member cleanup: the grace period elapsed with no reconnect.
    async fn expire_member(self: &Arc<Self>, expired: ExpiredMember) {
        let ExpiredMember { group_id, user_id } = expired;
        if let Err(e) = self.membership.leave_group(&user_id, &group_id).await {
            log::warn!(
                "[Coordinator] Membership removal failed for {} in {}: {}",
                user_id,
                group_id,
                e
            );
        }

        let result = self
            .mutate_with_retry(&group_id, |manager, now_ms| {
                manager.leave_member(&group_id, &user_id, now_ms)
            })
            .await;
        match result {
            Ok(Some(outcome)) => self.commit(&group_id, &outcome).await,
            Ok(None) | Err(ListenError::NotFound(_)) => {}
            Err(e) => log::warn!(
                "[Coordinator] Stale cleanup mutation failed for {} in {}: {}",
                user_id,
                group_id,
                e
            ),
        }
    }

    /// A gate deadline elapsed: play with whoever is ready.
    async fn fire_gate_deadline(self: &Arc<Self>, group_id: &str, gate_seq: u64) {
        let result = self
            .mutate_with_retry(group_id, |manager, now_ms| {
                manager.fire_gate_deadline(group_id, gate_seq, now_ms)
            })
            .await;
        match result {
            Ok(Some(outcome)) => self.commit(group_id, &outcome).await,
            Ok(None) | Err(ListenError::NotFound(_)) => {}
            Err(e) => log::warn!(
                "[Coordinator] Gate deadline mutation failed for {}: {}",
                group_id,
                e
            ),
        }
    }

    /// Applies a snapshot published by another pod: monotone adoption, then
    /// a `group:state` fanout to local room sockets. An empty member set
    /// means the group ended remotely.
    async fn handle_remote_snapshot(self: &Arc<Self>, snapshot: Snapshot) {
        let group_id = snapshot.group_id.clone();

        if snapshot.members.is_empty() {
            self.manager.remove_group(&group_id);
            self.cancel_gate_timer(&group_id);
            self.rooms
                .broadcast(
                    &group_id,
                    &GroupEvent::Ended {
                        reason: EndReason::Empty,
                    },
                )
                .await;
            self.rooms.close_room(&group_id);
            return;
        }

        let gate = snapshot.ready_gate.clone();
        if self.manager.adopt_snapshot(snapshot.clone()) {
            // Shadow the gate deadline locally so playback still starts if
            // the arming pod dies; gate_seq makes duplicate firing harmless.
            match gate {
                Some(gate) => self.arm_gate_timer(&group_id, gate.gate_seq, gate.deadline_ms),
                None => self.cancel_gate_timer(&group_id),
            }
            self.rooms
                .broadcast(&group_id, &GroupEvent::State(snapshot))
                .await;
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // The mutation protocol
    // ─────────────────────────────────────────────────────────────────────────

    /// Runs one mutation under the group's lease: acquire, rehydrate,
    /// apply, persist+publish (flushed), release.
    async fn mutate<F>(&self, group_id: &str, apply: F) -> ListenResult<Option<MutationOutcome>>
    where
        F: FnOnce(&GroupManager, u64) -> ListenResult<Option<MutationOutcome>>,
    {
        let token = Uuid::new_v4().to_string();
        let mut local_guard = None;

        if self.cfg.lock_enabled {
            match self
                .lock
                .acquire(group_id, &token, self.cfg.lock_ttl_ms)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    self.metrics.record_conflict();
                    return Err(ListenError::conflict_for_ttl(self.cfg.lock_ttl_ms));
                }
                Err(e) => {
                    self.metrics.record_lock_failure(&e.to_string());
                    self.metrics.record_conflict();
                    return Err(ListenError::conflict_for_ttl(self.cfg.lock_ttl_ms));
                }
            }
        } else {
            let mutex = self
                .local_locks
                .entry(group_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone();
            local_guard = Some(mutex.lock_owned().await);
        }

        let result = self.locked_mutate(group_id, apply).await;

        if self.cfg.lock_enabled {
            if let Err(e) = self.lock.release(group_id, &token).await {
                log::warn!(
                    "[Coordinator] Lock release failed for {}: {}",
                    group_id,
                    e
                );
            }
        }
        drop(local_guard);
        result
    }

    async fn locked_mutate<F>(
        &self,
        group_id: &str,
        apply: F,
    ) -> ListenResult<Option<MutationOutcome>>
    where
        F: FnOnce(&GroupManager, u64) -> ListenResult<Option<MutationOutcome>>,
    {
        // Rehydrate: the store is the tie-breaker between pods
        match self.store.get(group_id).await {
            Ok(Some(snapshot)) => {
                self.manager.adopt_snapshot(snapshot);
            }
            Ok(None) => {}
            Err(e) => {
                // Mutating against possibly-stale state is worse than a retry
                log::warn!("[Coordinator] Rehydrate failed for {}: {}", group_id, e);
                self.metrics.record_conflict();
                return Err(ListenError::conflict_for_ttl(self.cfg.lock_ttl_ms));
            }
        }

        let outcome = apply(&self.manager, now_millis())?;

        if let Some(outcome) = &outcome {
            self.pipeline.enqueue(outcome.snapshot.clone()).await;
            self.pipeline.flush(group_id).await;
            if outcome.ended {
                self.pipeline.retire(group_id).await;
            }
        }
        Ok(outcome)
    }

    /// Retry wrapper for internally-driven mutations that must survive
    /// transient lock contention.
    async fn mutate_with_retry<F>(
        &self,
        group_id: &str,
        mut apply: F,
    ) -> ListenResult<Option<MutationOutcome>>
    where
        F: FnMut(&GroupManager, u64) -> ListenResult<Option<MutationOutcome>>,
    {
        let mut attempts = 0;
        loop {
            match self.mutate(group_id, &mut apply).await {
                Err(ListenError::Conflict { retry_after_ms })
                    if attempts < INTERNAL_RETRY_LIMIT && !self.cancel.is_cancelled() =>
                {
                    attempts += 1;
                    tokio::time::sleep(Duration::from_millis(retry_after_ms)).await;
                }
                other => return other,
            }
        }
    }

    /// Post-lock fanout and timer bookkeeping for one applied mutation.
    ///
    /// Only the manager's delta events are broadcast here; the full
    /// `group:state` goes out where observers actually need it (the join
    /// unicast and cross-pod adoption), not on every mutation.
    async fn commit(self: &Arc<Self>, group_id: &str, outcome: &MutationOutcome) {
        match outcome.snapshot.ready_gate.as_ref() {
            Some(gate) => self.arm_gate_timer(group_id, gate.gate_seq, gate.deadline_ms),
            None => self.cancel_gate_timer(group_id),
        }

        self.rooms.broadcast_all(group_id, &outcome.events).await;
        if outcome.ended {
            self.rooms.close_room(group_id);
        }
    }

    fn arm_gate_timer(self: &Arc<Self>, group_id: &str, gate_seq: u64, deadline_ms: u64) {
        let delay_ms = deadline_ms.saturating_sub(now_millis());
        let coordinator = Arc::clone(self);
        let cancel = self.cancel.clone();
        let group = group_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
            }
            // Drop our own registry entry first: the commit below would
            // otherwise abort the very task it is running on
            coordinator.gate_timers.remove(&group);
            coordinator.fire_gate_deadline(&group, gate_seq).await;
        });
        if let Some(previous) = self.gate_timers.insert(group_id.to_string(), handle) {
            previous.abort();
        }
    }

    fn cancel_gate_timer(&self, group_id: &str) {
        if let Some((_, timer)) = self.gate_timers.remove(group_id) {
            timer.abort();
        }
    }
}
