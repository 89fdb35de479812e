//! Group state machine: applies mutations to pod-local group state.
//!
//! Responsibilities:
//! - Membership-gated playback and queue mutations
//! - Ready-gate protocol (arm on play, satisfy on quorum or deadline)
//! - Member lifecycle (join, leave, group termination when empty)
//! - Monotone snapshot adoption for rehydration and cross-pod reconciliation
//!
//! The manager is pure in-memory and never suspends; callers serialize
//! mutations per group with the mutation lock and rehydrate from the state
//! store before applying. Timestamps are passed in so behavior is
//! deterministic under test.

use dashmap::DashMap;

use crate::error::{ListenError, ListenResult};
use crate::events::{GroupEvent, QueueOp};
use crate::group::types::{
    EndReason, Group, Member, PlaybackCmd, QueueCmd, QueueItem, ReadyGate, Snapshot,
};

/// Result of one applied mutation.
///
/// `events` carries the delta(s) to fan out: exactly one for ordinary
/// mutations, two when a single mutation closes a gate or ends the group
/// (e.g. the last expected member leaving, or the last member leaving).
#[derive(Debug, Clone)]
pub struct MutationOutcome {
    /// Post-mutation snapshot, `version == previous + 1`.
    pub snapshot: Snapshot,
    pub events: Vec<GroupEvent>,
    /// The group terminated and was dropped from pod-local state.
    pub ended: bool,
}

/// Timing knobs for the ready-gate protocol.
#[derive(Debug, Clone, Copy)]
pub struct GateTiming {
    pub ready_timeout_ms: u64,
    pub join_lead_ms: u64,
}

/// Owns all pod-local group state and applies mutations to it.
pub struct GroupManager {
    groups: DashMap<String, Group>,
    timing: GateTiming,
}

impl GroupManager {
    pub fn new(timing: GateTiming) -> Self {
        Self {
            groups: DashMap::new(),
            timing,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Snapshot access & reconciliation
    // ─────────────────────────────────────────────────────────────────────────

    /// Renders the current pod-local snapshot for a group.
    pub fn snapshot(&self, group_id: &str) -> Option<Snapshot> {
        self.groups.get(group_id).map(|g| Snapshot::of(group_id, &g))
    }

    /// Current pod-local version, if the group is known here.
    pub fn version(&self, group_id: &str) -> Option<u64> {
        self.groups.get(group_id).map(|g| g.version)
    }

    pub fn contains(&self, group_id: &str) -> bool {
        self.groups.contains_key(group_id)
    }

    /// Drops a group from pod-local state (termination or remote end).
    pub fn remove_group(&self, group_id: &str) {
        self.groups.remove(group_id);
    }

    /// Adopts an external snapshot iff its version is strictly greater than
    /// the local one (monotone reconciliation). Returns whether it was
    /// applied. A snapshot for an unknown group is always adopted.
    pub fn adopt_snapshot(&self, snapshot: Snapshot) -> bool {
        let group_id = snapshot.group_id.clone();
        match self.groups.get_mut(&group_id) {
            Some(mut local) => {
                if snapshot.version > local.version {
                    *local = snapshot.into_group();
                    true
                } else {
                    false
                }
            }
            None => {
                self.groups.insert(group_id, snapshot.into_group());
                true
            }
        }
    }

    /// Seeds a group from a snapshot only when this pod has no copy yet.
    pub fn ensure_group(&self, snapshot: Snapshot) {
        self.groups
            .entry(snapshot.group_id.clone())
            .or_insert_with(|| snapshot.into_group());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Membership mutations
    // ─────────────────────────────────────────────────────────────────────────

    /// Adds a member to a group. A re-join of an existing member is a no-op
    /// (returns `None`); the caller still unicasts current state.
    ///
    /// A joiner is added to an armed gate's expected set only while the
    /// deadline has not passed.
    pub fn join_member(
        &self,
        group_id: &str,
        user_id: &str,
        username: &str,
        now_ms: u64,
    ) -> ListenResult<Option<MutationOutcome>> {
        let mut group = self
            .groups
            .get_mut(group_id)
            .ok_or_else(|| ListenError::NotFound(group_id.to_string()))?;

        if group.members.contains_key(user_id) {
            return Ok(None);
        }

        group.members.insert(
            user_id.to_string(),
            Member {
                user_id: user_id.to_string(),
                username: username.to_string(),
                joined_at_ms: now_ms,
            },
        );
        if let Some(gate) = group.ready_gate.as_mut() {
            if now_ms < gate.deadline_ms {
                gate.expected_user_ids.insert(user_id.to_string());
            }
        }
        group.version += 1;
        let events = vec![GroupEvent::MemberJoined {
            user_id: user_id.to_string(),
            username: username.to_string(),
        }];
        Ok(Some(MutationOutcome {
            snapshot: Snapshot::of(group_id, &group),
            events,
            ended: false,
        }))
    }

    /// Removes a member. Emits `MemberLeft`, plus `PlayAt` when the
    /// departure satisfies an armed gate, plus `Ended` when the group
    /// becomes empty (the group is then dropped).
    pub fn leave_member(
        &self,
        group_id: &str,
        user_id: &str,
        now_ms: u64,
    ) -> ListenResult<Option<MutationOutcome>> {
        let mut ended = false;
        let outcome = {
            let mut group = self
                .groups
                .get_mut(group_id)
                .ok_or_else(|| ListenError::NotFound(group_id.to_string()))?;

            if group.members.remove(user_id).is_none() {
                return Ok(None);
            }

            let mut events = vec![GroupEvent::MemberLeft {
                user_id: user_id.to_string(),
            }];

            let gate_now_satisfied = match group.ready_gate.as_mut() {
                Some(gate) => {
                    gate.expected_user_ids.remove(user_id);
                    gate.ready_user_ids.remove(user_id);
                    gate.is_satisfied()
                }
                None => false,
            };
            if gate_now_satisfied && !group.members.is_empty() {
                events.push(satisfy_gate(&mut group, now_ms, self.timing.join_lead_ms));
            }

            group.version += 1;
            if group.members.is_empty() {
                // Last member gone: terminate the group
                group.playing = false;
                group.ready_gate = None;
                events.push(GroupEvent::Ended {
                    reason: EndReason::Empty,
                });
                ended = true;
            }

            MutationOutcome {
                snapshot: Snapshot::of(group_id, &group),
                events,
                ended,
            }
        };
        if ended {
            self.groups.remove(group_id);
        }
        Ok(Some(outcome))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Playback mutations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn apply_playback(
        &self,
        group_id: &str,
        user_id: &str,
        cmd: PlaybackCmd,
        now_ms: u64,
    ) -> ListenResult<Option<MutationOutcome>> {
        let mut group = self.member_checked(group_id, user_id)?;

        let outcome = match cmd {
            PlaybackCmd::Play => {
                if group.playing || group.is_armed() {
                    return Ok(None);
                }
                if group.cursor.is_none() {
                    return Err(ListenError::InvalidInput("queue is empty".into()));
                }
                group.version += 1;
                let event = arm_gate(&mut group, now_ms, self.timing.ready_timeout_ms);
                Some((Snapshot::of(group_id, &group), vec![event]))
            }
            PlaybackCmd::Pause => {
                if !group.playing && !group.is_armed() {
                    return Ok(None);
                }
                group.position_ms = group.estimated_position_ms(now_ms);
                group.playing = false;
                group.ready_gate = None;
                group.updated_at_ms = now_ms;
                group.version += 1;
                Some((Snapshot::of(group_id, &group), vec![playback_delta(&group)]))
            }
            PlaybackCmd::Seek { position_ms } => {
                let duration = group
                    .current_track()
                    .map(|t| t.duration_ms)
                    .ok_or_else(|| ListenError::InvalidInput("queue is empty".into()))?;
                let was_active = group.playing || group.is_armed();
                group.position_ms = position_ms.min(duration);
                group.updated_at_ms = now_ms;
                group.version += 1;
                let event = if was_active {
                    // Re-sync everyone at the new offset
                    arm_gate(&mut group, now_ms, self.timing.ready_timeout_ms)
                } else {
                    playback_delta(&group)
                };
                Some((Snapshot::of(group_id, &group), vec![event]))
            }
            PlaybackCmd::Next => {
                let cursor = group
                    .cursor
                    .ok_or_else(|| ListenError::InvalidInput("queue is empty".into()))?;
                let was_active = group.playing || group.is_armed();
                group.position_ms = 0;
                group.updated_at_ms = now_ms;
                group.version += 1;
                let event = if cursor + 1 >= group.queue.len() {
                    // End of queue: stop, cursor stays on the last played track
                    group.playing = false;
                    group.ready_gate = None;
                    playback_delta(&group)
                } else {
                    group.cursor = Some(cursor + 1);
                    if was_active {
                        arm_gate(&mut group, now_ms, self.timing.ready_timeout_ms)
                    } else {
                        playback_delta(&group)
                    }
                };
                Some((Snapshot::of(group_id, &group), vec![event]))
            }
            PlaybackCmd::Previous => {
                let cursor = group
                    .cursor
                    .ok_or_else(|| ListenError::InvalidInput("queue is empty".into()))?;
                let was_active = group.playing || group.is_armed();
                group.cursor = Some(cursor.saturating_sub(1));
                group.position_ms = 0;
                group.updated_at_ms = now_ms;
                group.version += 1;
                let event = if was_active {
                    arm_gate(&mut group, now_ms, self.timing.ready_timeout_ms)
                } else {
                    playback_delta(&group)
                };
                Some((Snapshot::of(group_id, &group), vec![event]))
            }
            PlaybackCmd::SetTrack { index } => {
                if index >= group.queue.len() {
                    return Err(ListenError::InvalidInput(format!(
                        "track index {index} out of range"
                    )));
                }
                let was_active = group.playing || group.is_armed();
                group.cursor = Some(index);
                group.position_ms = 0;
                group.updated_at_ms = now_ms;
                group.version += 1;
                let event = if was_active {
                    arm_gate(&mut group, now_ms, self.timing.ready_timeout_ms)
                } else {
                    playback_delta(&group)
                };
                Some((Snapshot::of(group_id, &group), vec![event]))
            }
        };

        Ok(outcome.map(|(snapshot, events)| MutationOutcome {
            snapshot,
            events,
            ended: false,
        }))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queue mutations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn apply_queue(
        &self,
        group_id: &str,
        user_id: &str,
        cmd: QueueCmd,
        now_ms: u64,
    ) -> ListenResult<Option<MutationOutcome>> {
        let mut group = self.member_checked(group_id, user_id)?;

        let op = match cmd {
            QueueCmd::Add { items } => {
                let items = non_empty(items)?;
                group.queue.extend(items);
                if group.cursor.is_none() {
                    group.cursor = Some(0);
                    group.position_ms = 0;
                }
                QueueOp::Add
            }
            QueueCmd::InsertNext { items } => {
                let items = non_empty(items)?;
                let at = group.cursor.map(|c| c + 1).unwrap_or(0);
                // Splice keeps the inserted items' relative order
                let tail: Vec<QueueItem> = group.queue.split_off(at);
                group.queue.extend(items);
                group.queue.extend(tail);
                if group.cursor.is_none() {
                    group.cursor = Some(0);
                    group.position_ms = 0;
                }
                QueueOp::InsertNext
            }
            QueueCmd::Remove { index } => {
                if index >= group.queue.len() {
                    return Err(ListenError::InvalidInput(format!(
                        "queue index {index} out of range"
                    )));
                }
                group.queue.remove(index);
                match group.cursor {
                    Some(_) if group.queue.is_empty() => {
                        group.cursor = None;
                        group.position_ms = 0;
                        group.playing = false;
                        group.ready_gate = None;
                    }
                    Some(c) if index < c => group.cursor = Some(c - 1),
                    Some(c) if index == c => {
                        // Current track removed: same index, bounded by new length
                        group.cursor = Some(c.min(group.queue.len() - 1));
                        group.position_ms = 0;
                        group.updated_at_ms = now_ms;
                    }
                    _ => {}
                }
                QueueOp::Remove
            }
            QueueCmd::Reorder { from, to } => {
                let len = group.queue.len();
                if from >= len || to >= len {
                    return Err(ListenError::InvalidInput(format!(
                        "reorder {from}->{to} out of range"
                    )));
                }
                let item = group.queue.remove(from);
                group.queue.insert(to, item);
                // Keep the cursor on the track it pointed at before the move
                if let Some(c) = group.cursor {
                    if c == from {
                        group.cursor = Some(to);
                    } else if from < c && to >= c {
                        group.cursor = Some(c - 1);
                    } else if from > c && to <= c {
                        group.cursor = Some(c + 1);
                    }
                }
                QueueOp::Reorder
            }
            QueueCmd::Clear => {
                group.queue.clear();
                group.cursor = None;
                group.position_ms = 0;
                group.playing = false;
                group.ready_gate = None;
                group.updated_at_ms = now_ms;
                QueueOp::Clear
            }
        };

        group.version += 1;
        let event = GroupEvent::QueueDelta {
            op,
            queue: group.queue.clone(),
            cursor: group.cursor,
            version: group.version,
        };
        Ok(Some(MutationOutcome {
            snapshot: Snapshot::of(group_id, &group),
            events: vec![event],
            ended: false,
        }))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Ready gate
    // ─────────────────────────────────────────────────────────────────────────

    /// Records a ready report. Duplicates and reports with no armed gate are
    /// no-ops. Closing the gate emits `PlayAt`; otherwise an updated
    /// `Waiting` with the members still outstanding.
    pub fn report_ready(
        &self,
        group_id: &str,
        user_id: &str,
        now_ms: u64,
    ) -> ListenResult<Option<MutationOutcome>> {
        let mut group = self.member_checked(group_id, user_id)?;

        let (satisfied, remaining, deadline_ms) = match group.ready_gate.as_mut() {
            None => return Ok(None),
            Some(gate) => {
                if !gate.ready_user_ids.insert(user_id.to_string()) {
                    return Ok(None);
                }
                (gate.is_satisfied(), gate.remaining(), gate.deadline_ms)
            }
        };

        group.version += 1;
        let event = if satisfied {
            satisfy_gate(&mut group, now_ms, self.timing.join_lead_ms)
        } else {
            GroupEvent::Waiting {
                expected_user_ids: remaining,
                deadline_ms,
            }
        };
        Ok(Some(MutationOutcome {
            snapshot: Snapshot::of(group_id, &group),
            events: vec![event],
            ended: false,
        }))
    }

    /// Deadline timer fired for gate `gate_seq`: play with whoever is ready.
    ///
    /// A stale timer (group gone, gate closed, or re-armed since) is a
    /// no-op rather than an error.
    pub fn fire_gate_deadline(
        &self,
        group_id: &str,
        gate_seq: u64,
        now_ms: u64,
    ) -> ListenResult<Option<MutationOutcome>> {
        let Some(mut group) = self.groups.get_mut(group_id) else {
            return Ok(None);
        };
        match group.ready_gate.as_ref() {
            Some(gate) if gate.gate_seq == gate_seq => {}
            _ => return Ok(None),
        }
        group.version += 1;
        let event = satisfy_gate(&mut group, now_ms, self.timing.join_lead_ms);
        Ok(Some(MutationOutcome {
            snapshot: Snapshot::of(group_id, &group),
            events: vec![event],
            ended: false,
        }))
    }

    fn member_checked(
        &self,
        group_id: &str,
        user_id: &str,
    ) -> ListenResult<dashmap::mapref::one::RefMut<'_, String, Group>> {
        let group = self
            .groups
            .get_mut(group_id)
            .ok_or_else(|| ListenError::NotFound(group_id.to_string()))?;
        if !group.members.contains_key(user_id) {
            return Err(ListenError::NotMember);
        }
        Ok(group)
    }
}

/// Arms a new gate for the current cursor. Must be called after the version
/// bump so `gate_seq` is unique and increasing per group.
fn arm_gate(group: &mut Group, now_ms: u64, ready_timeout_ms: u64) -> GroupEvent {
    let expected: std::collections::BTreeSet<String> = group.members.keys().cloned().collect();
    let deadline_ms = now_ms + ready_timeout_ms;
    group.playing = false;
    group.ready_gate = Some(ReadyGate {
        target_index: group.cursor.unwrap_or(0),
        expected_user_ids: expected.clone(),
        ready_user_ids: std::collections::BTreeSet::new(),
        deadline_ms,
        gate_seq: group.version,
    });
    GroupEvent::Waiting {
        expected_user_ids: expected.into_iter().collect(),
        deadline_ms,
    }
}

/// Closes the gate and schedules the shared start instant.
fn satisfy_gate(group: &mut Group, now_ms: u64, join_lead_ms: u64) -> GroupEvent {
    let wall_clock_ms = now_ms + join_lead_ms;
    group.ready_gate = None;
    group.playing = true;
    // Position counts from the scheduled start instant
    group.updated_at_ms = wall_clock_ms;
    GroupEvent::PlayAt {
        wall_clock_ms,
        cursor: group.cursor.unwrap_or(0),
        position_ms: group.position_ms,
    }
}

fn playback_delta(group: &Group) -> GroupEvent {
    GroupEvent::PlaybackDelta {
        playing: group.playing,
        position_ms: group.position_ms,
        cursor: group.cursor,
        updated_at_ms: group.updated_at_ms,
        version: group.version,
    }
}

fn non_empty(items: Vec<QueueItem>) -> ListenResult<Vec<QueueItem>> {
    if items.is_empty() {
        return Err(ListenError::InvalidInput("no resolvable tracks".into()));
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: GateTiming = GateTiming {
        ready_timeout_ms: 4_000,
        join_lead_ms: 500,
    };

    fn track(id: &str) -> QueueItem {
        QueueItem {
            track_id: id.to_string(),
            title: format!("Title {id}"),
            artist_name: "Artist".to_string(),
            album_title: "Album".to_string(),
            duration_ms: 180_000,
            cover_url: None,
        }
    }

    /// Group g1 with members u1, u2 and tracks t1, t2; cursor 0, paused.
    fn seeded_manager() -> GroupManager {
        let manager = GroupManager::new(T);
        manager.ensure_group(Snapshot::empty("g1"));
        manager.join_member("g1", "u1", "alice", 1).unwrap();
        manager.join_member("g1", "u2", "bob", 2).unwrap();
        manager
            .apply_queue(
                "g1",
                "u1",
                QueueCmd::Add {
                    items: vec![track("t1"), track("t2")],
                },
                3,
            )
            .unwrap();
        manager
    }

    fn queue_ids(manager: &GroupManager) -> Vec<String> {
        manager
            .snapshot("g1")
            .unwrap()
            .queue
            .into_iter()
            .map(|t| t.track_id)
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Ready gate protocol
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn happy_path_play_waits_then_plays_at() {
        let manager = seeded_manager();
        let before = manager.version("g1").unwrap();

        let out = manager
            .apply_playback("g1", "u1", PlaybackCmd::Play, 10_000)
            .unwrap()
            .unwrap();
        assert_eq!(out.snapshot.version, before + 1);
        assert!(!out.snapshot.playing, "armed, not yet playing");
        match &out.events[0] {
            GroupEvent::Waiting {
                expected_user_ids,
                deadline_ms,
            } => {
                assert_eq!(expected_user_ids.len(), 2);
                assert_eq!(*deadline_ms, 14_000);
            }
            other => panic!("expected Waiting, got {other:?}"),
        }

        // First ready: still waiting on u2
        let out = manager.report_ready("g1", "u1", 10_100).unwrap().unwrap();
        match &out.events[0] {
            GroupEvent::Waiting {
                expected_user_ids, ..
            } => assert_eq!(expected_user_ids, &vec!["u2".to_string()]),
            other => panic!("expected Waiting, got {other:?}"),
        }

        // Second ready closes the gate
        let out = manager.report_ready("g1", "u2", 10_300).unwrap().unwrap();
        match &out.events[0] {
            GroupEvent::PlayAt {
                wall_clock_ms,
                cursor,
                position_ms,
            } => {
                assert_eq!(*wall_clock_ms, 10_800);
                assert_eq!(*cursor, 0);
                assert_eq!(*position_ms, 0);
            }
            other => panic!("expected PlayAt, got {other:?}"),
        }
        let snap = manager.snapshot("g1").unwrap();
        assert!(snap.playing);
        assert!(snap.ready_gate.is_none());
        assert_eq!(snap.position_ms, 0);
        assert_eq!(snap.cursor, Some(0));
    }

    #[test]
    fn deadline_plays_with_partial_quorum() {
        let manager = seeded_manager();
        let out = manager
            .apply_playback("g1", "u1", PlaybackCmd::Play, 10_000)
            .unwrap()
            .unwrap();
        let gate_seq = out.snapshot.ready_gate.as_ref().unwrap().gate_seq;

        manager.report_ready("g1", "u1", 10_500).unwrap().unwrap();

        // Deadline fires: play anyway
        let out = manager
            .fire_gate_deadline("g1", gate_seq, 14_000)
            .unwrap()
            .unwrap();
        match &out.events[0] {
            GroupEvent::PlayAt { wall_clock_ms, .. } => assert_eq!(*wall_clock_ms, 14_500),
            other => panic!("expected PlayAt, got {other:?}"),
        }
        assert!(manager.snapshot("g1").unwrap().playing);
    }

    #[test]
    fn stale_deadline_is_a_noop() {
        let manager = seeded_manager();
        let out = manager
            .apply_playback("g1", "u1", PlaybackCmd::Play, 10_000)
            .unwrap()
            .unwrap();
        let gate_seq = out.snapshot.ready_gate.as_ref().unwrap().gate_seq;

        // Gate closed by both members reporting
        manager.report_ready("g1", "u1", 10_100).unwrap();
        manager.report_ready("g1", "u2", 10_200).unwrap();

        assert!(manager
            .fire_gate_deadline("g1", gate_seq, 14_000)
            .unwrap()
            .is_none());
        // Unknown group is equally quiet
        assert!(manager
            .fire_gate_deadline("nope", gate_seq, 14_000)
            .unwrap()
            .is_none());
    }

    #[test]
    fn duplicate_ready_is_ignored() {
        let manager = seeded_manager();
        manager
            .apply_playback("g1", "u1", PlaybackCmd::Play, 10_000)
            .unwrap();
        let v = manager.version("g1").unwrap();
        manager.report_ready("g1", "u1", 10_100).unwrap().unwrap();
        assert!(manager.report_ready("g1", "u1", 10_200).unwrap().is_none());
        assert_eq!(manager.version("g1").unwrap(), v + 1);
    }

    #[test]
    fn ready_without_gate_is_a_noop() {
        let manager = seeded_manager();
        assert!(manager.report_ready("g1", "u1", 10_000).unwrap().is_none());
    }

    #[test]
    fn play_while_armed_or_playing_is_a_noop() {
        let manager = seeded_manager();
        manager
            .apply_playback("g1", "u1", PlaybackCmd::Play, 10_000)
            .unwrap()
            .unwrap();
        assert!(manager
            .apply_playback("g1", "u2", PlaybackCmd::Play, 10_100)
            .unwrap()
            .is_none());

        manager.report_ready("g1", "u1", 10_100).unwrap();
        manager.report_ready("g1", "u2", 10_200).unwrap();
        assert!(manager.snapshot("g1").unwrap().playing);
        assert!(manager
            .apply_playback("g1", "u1", PlaybackCmd::Play, 11_000)
            .unwrap()
            .is_none());
    }

    #[test]
    fn play_with_empty_queue_is_invalid() {
        let manager = GroupManager::new(T);
        manager.ensure_group(Snapshot::empty("g1"));
        manager.join_member("g1", "u1", "alice", 1).unwrap();
        assert!(matches!(
            manager.apply_playback("g1", "u1", PlaybackCmd::Play, 10),
            Err(ListenError::InvalidInput(_))
        ));
    }

    #[test]
    fn joiner_during_gate_extends_expected_before_deadline_only() {
        let manager = seeded_manager();
        manager
            .apply_playback("g1", "u1", PlaybackCmd::Play, 10_000)
            .unwrap();

        // Joins before the deadline: expected grows
        manager.join_member("g1", "u3", "carol", 11_000).unwrap();
        let gate = manager.snapshot("g1").unwrap().ready_gate.unwrap();
        assert!(gate.expected_user_ids.contains("u3"));

        // Joins after the deadline passed: not expected
        manager.join_member("g1", "u4", "dave", 15_000).unwrap();
        let gate = manager.snapshot("g1").unwrap().ready_gate.unwrap();
        assert!(!gate.expected_user_ids.contains("u4"));
    }

    #[test]
    fn last_expected_member_leaving_closes_gate() {
        let manager = seeded_manager();
        manager
            .apply_playback("g1", "u1", PlaybackCmd::Play, 10_000)
            .unwrap();
        manager.report_ready("g1", "u1", 10_100).unwrap();

        let out = manager.leave_member("g1", "u2", 10_500).unwrap().unwrap();
        assert!(matches!(out.events[0], GroupEvent::MemberLeft { .. }));
        assert!(matches!(out.events[1], GroupEvent::PlayAt { .. }));
        assert!(manager.snapshot("g1").unwrap().playing);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Pause / seek / track navigation
    // ─────────────────────────────────────────────────────────────────────────

    fn playing_manager() -> GroupManager {
        let manager = seeded_manager();
        manager
            .apply_playback("g1", "u1", PlaybackCmd::Play, 10_000)
            .unwrap();
        manager.report_ready("g1", "u1", 10_000).unwrap();
        manager.report_ready("g1", "u2", 10_000).unwrap();
        // playing, updated_at = 10_500 (play-at instant)
        manager
    }

    #[test]
    fn pause_freezes_estimated_position() {
        let manager = playing_manager();
        let out = manager
            .apply_playback("g1", "u1", PlaybackCmd::Pause, 40_500)
            .unwrap()
            .unwrap();
        let snap = out.snapshot;
        assert!(!snap.playing);
        // 30s of playback since the scheduled start
        assert_eq!(snap.position_ms, 30_000);
        assert_eq!(snap.updated_at_ms, 40_500);
    }

    #[test]
    fn pause_is_idempotent() {
        let manager = playing_manager();
        manager
            .apply_playback("g1", "u1", PlaybackCmd::Pause, 40_500)
            .unwrap()
            .unwrap();
        let v = manager.version("g1").unwrap();
        assert!(manager
            .apply_playback("g1", "u1", PlaybackCmd::Pause, 41_000)
            .unwrap()
            .is_none());
        assert_eq!(manager.version("g1").unwrap(), v);
    }

    #[test]
    fn pause_cancels_armed_gate() {
        let manager = seeded_manager();
        manager
            .apply_playback("g1", "u1", PlaybackCmd::Play, 10_000)
            .unwrap();
        let out = manager
            .apply_playback("g1", "u2", PlaybackCmd::Pause, 10_500)
            .unwrap()
            .unwrap();
        assert!(out.snapshot.ready_gate.is_none());
        assert!(!out.snapshot.playing);
        assert!(matches!(out.events[0], GroupEvent::PlaybackDelta { .. }));
    }

    #[test]
    fn seek_clamps_and_rearms_when_active() {
        let manager = playing_manager();
        let out = manager
            .apply_playback(
                "g1",
                "u1",
                PlaybackCmd::Seek {
                    position_ms: 999_999_999,
                },
                20_000,
            )
            .unwrap()
            .unwrap();
        // Clamped to the 180s track
        assert_eq!(out.snapshot.position_ms, 180_000);
        assert!(out.snapshot.ready_gate.is_some(), "re-armed for resync");
        assert!(matches!(out.events[0], GroupEvent::Waiting { .. }));
    }

    #[test]
    fn seek_while_paused_stays_paused() {
        let manager = seeded_manager();
        let out = manager
            .apply_playback("g1", "u1", PlaybackCmd::Seek { position_ms: 30_000 }, 20_000)
            .unwrap()
            .unwrap();
        assert_eq!(out.snapshot.position_ms, 30_000);
        assert!(!out.snapshot.playing);
        assert!(out.snapshot.ready_gate.is_none());
        assert!(matches!(out.events[0], GroupEvent::PlaybackDelta { .. }));
    }

    #[test]
    fn next_advances_and_rearms_when_active() {
        let manager = playing_manager();
        let out = manager
            .apply_playback("g1", "u1", PlaybackCmd::Next, 20_000)
            .unwrap()
            .unwrap();
        assert_eq!(out.snapshot.cursor, Some(1));
        assert_eq!(out.snapshot.position_ms, 0);
        assert!(out.snapshot.ready_gate.is_some());
    }

    #[test]
    fn next_at_end_stops_playback() {
        let manager = playing_manager();
        manager
            .apply_playback("g1", "u1", PlaybackCmd::Next, 20_000)
            .unwrap();
        // Now on the last track and armed; next again stops
        let out = manager
            .apply_playback("g1", "u1", PlaybackCmd::Next, 21_000)
            .unwrap()
            .unwrap();
        assert_eq!(out.snapshot.cursor, Some(1), "cursor stays on last played");
        assert!(!out.snapshot.playing);
        assert!(out.snapshot.ready_gate.is_none());
        assert_eq!(out.snapshot.position_ms, 0);
    }

    #[test]
    fn previous_clamps_at_zero() {
        let manager = seeded_manager();
        let out = manager
            .apply_playback("g1", "u1", PlaybackCmd::Previous, 20_000)
            .unwrap()
            .unwrap();
        assert_eq!(out.snapshot.cursor, Some(0));
        assert_eq!(out.snapshot.position_ms, 0);
        assert!(!out.snapshot.playing, "paused stays paused");
    }

    #[test]
    fn set_track_validates_range() {
        let manager = seeded_manager();
        assert!(matches!(
            manager.apply_playback("g1", "u1", PlaybackCmd::SetTrack { index: 2 }, 20_000),
            Err(ListenError::InvalidInput(_))
        ));
        let out = manager
            .apply_playback("g1", "u1", PlaybackCmd::SetTrack { index: 1 }, 20_000)
            .unwrap()
            .unwrap();
        assert_eq!(out.snapshot.cursor, Some(1));
        assert_eq!(out.snapshot.position_ms, 0);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queue mutations
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn add_to_empty_queue_sets_cursor() {
        let manager = GroupManager::new(T);
        manager.ensure_group(Snapshot::empty("g1"));
        manager.join_member("g1", "u1", "alice", 1).unwrap();
        let out = manager
            .apply_queue(
                "g1",
                "u1",
                QueueCmd::Add {
                    items: vec![track("t1")],
                },
                5,
            )
            .unwrap()
            .unwrap();
        assert_eq!(out.snapshot.cursor, Some(0));
        match &out.events[0] {
            GroupEvent::QueueDelta { op, queue, .. } => {
                assert_eq!(*op, QueueOp::Add);
                assert_eq!(queue.len(), 1);
            }
            other => panic!("expected QueueDelta, got {other:?}"),
        }
    }

    #[test]
    fn insert_next_lands_after_cursor_in_order() {
        let manager = seeded_manager();
        manager
            .apply_queue(
                "g1",
                "u1",
                QueueCmd::InsertNext {
                    items: vec![track("t3"), track("t4")],
                },
                5,
            )
            .unwrap()
            .unwrap();
        assert_eq!(queue_ids(&manager), vec!["t1", "t3", "t4", "t2"]);
        assert_eq!(manager.snapshot("g1").unwrap().cursor, Some(0));
    }

    #[test]
    fn remove_before_cursor_shifts_cursor_down() {
        let manager = seeded_manager();
        manager
            .apply_playback("g1", "u1", PlaybackCmd::SetTrack { index: 1 }, 5)
            .unwrap();
        manager
            .apply_queue("g1", "u1", QueueCmd::Remove { index: 0 }, 6)
            .unwrap()
            .unwrap();
        let snap = manager.snapshot("g1").unwrap();
        assert_eq!(queue_ids(&manager), vec!["t2"]);
        assert_eq!(snap.cursor, Some(0));
    }

    #[test]
    fn remove_current_track_keeps_index_bounded() {
        let manager = seeded_manager();
        manager
            .apply_queue(
                "g1",
                "u1",
                QueueCmd::Add {
                    items: vec![track("t3")],
                },
                5,
            )
            .unwrap();
        manager
            .apply_playback("g1", "u1", PlaybackCmd::SetTrack { index: 2 }, 6)
            .unwrap();
        // Removing the last (current) track bounds the cursor to the new tail
        let out = manager
            .apply_queue("g1", "u1", QueueCmd::Remove { index: 2 }, 7)
            .unwrap()
            .unwrap();
        assert_eq!(out.snapshot.cursor, Some(1));
        assert_eq!(out.snapshot.position_ms, 0);
    }

    #[test]
    fn remove_last_item_empties_and_stops() {
        let manager = GroupManager::new(T);
        manager.ensure_group(Snapshot::empty("g1"));
        manager.join_member("g1", "u1", "alice", 1).unwrap();
        manager
            .apply_queue(
                "g1",
                "u1",
                QueueCmd::Add {
                    items: vec![track("t1")],
                },
                2,
            )
            .unwrap();
        let out = manager
            .apply_queue("g1", "u1", QueueCmd::Remove { index: 0 }, 3)
            .unwrap()
            .unwrap();
        assert_eq!(out.snapshot.cursor, None);
        assert!(!out.snapshot.playing);
        assert!(out.snapshot.queue.is_empty());
    }

    #[test]
    fn remove_out_of_range_is_invalid() {
        let manager = seeded_manager();
        let v = manager.version("g1").unwrap();
        assert!(matches!(
            manager.apply_queue("g1", "u1", QueueCmd::Remove { index: 9 }, 5),
            Err(ListenError::InvalidInput(_))
        ));
        // No state change on failure
        assert_eq!(manager.version("g1").unwrap(), v);
    }

    #[test]
    fn add_then_remove_restores_prior_queue() {
        let manager = seeded_manager();
        let before = queue_ids(&manager);
        manager
            .apply_queue(
                "g1",
                "u1",
                QueueCmd::Add {
                    items: vec![track("t3")],
                },
                5,
            )
            .unwrap();
        manager
            .apply_queue("g1", "u1", QueueCmd::Remove { index: 2 }, 6)
            .unwrap();
        assert_eq!(queue_ids(&manager), before);
    }

    #[test]
    fn reorder_follows_current_item() {
        let manager = seeded_manager();
        manager
            .apply_queue(
                "g1",
                "u1",
                QueueCmd::Add {
                    items: vec![track("t3")],
                },
                5,
            )
            .unwrap();
        // queue: t1 t2 t3, cursor 0 (t1). Move t1 to the end.
        manager
            .apply_queue("g1", "u1", QueueCmd::Reorder { from: 0, to: 2 }, 6)
            .unwrap();
        let snap = manager.snapshot("g1").unwrap();
        assert_eq!(queue_ids(&manager), vec!["t2", "t3", "t1"]);
        assert_eq!(snap.cursor, Some(2), "cursor still points at t1");

        // Move t2 (index 0) past the cursor: cursor shifts down
        manager
            .apply_queue("g1", "u1", QueueCmd::Reorder { from: 0, to: 2 }, 7)
            .unwrap();
        assert_eq!(queue_ids(&manager), vec!["t3", "t1", "t2"]);
        assert_eq!(manager.snapshot("g1").unwrap().cursor, Some(1));
    }

    #[test]
    fn clear_empties_and_cancels_gate() {
        let manager = seeded_manager();
        manager
            .apply_playback("g1", "u1", PlaybackCmd::Play, 10_000)
            .unwrap();
        let out = manager
            .apply_queue("g1", "u1", QueueCmd::Clear, 10_500)
            .unwrap()
            .unwrap();
        assert!(out.snapshot.queue.is_empty());
        assert_eq!(out.snapshot.cursor, None);
        assert!(!out.snapshot.playing);
        assert!(out.snapshot.ready_gate.is_none());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Membership, authorization, termination
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn non_member_mutations_are_refused() {
        let manager = seeded_manager();
        assert!(matches!(
            manager.apply_playback("g1", "intruder", PlaybackCmd::Play, 5),
            Err(ListenError::NotMember)
        ));
        assert!(matches!(
            manager.apply_queue("g1", "intruder", QueueCmd::Clear, 5),
            Err(ListenError::NotMember)
        ));
        assert!(matches!(
            manager.report_ready("g1", "intruder", 5),
            Err(ListenError::NotMember)
        ));
    }

    #[test]
    fn unknown_group_is_not_found() {
        let manager = GroupManager::new(T);
        assert!(matches!(
            manager.apply_playback("nope", "u1", PlaybackCmd::Play, 5),
            Err(ListenError::NotFound(_))
        ));
    }

    #[test]
    fn rejoin_is_a_noop() {
        let manager = seeded_manager();
        let v = manager.version("g1").unwrap();
        assert!(manager.join_member("g1", "u1", "alice", 9).unwrap().is_none());
        assert_eq!(manager.version("g1").unwrap(), v);
    }

    #[test]
    fn last_member_leaving_ends_group() {
        let manager = seeded_manager();
        manager.leave_member("g1", "u1", 5).unwrap().unwrap();
        let out = manager.leave_member("g1", "u2", 6).unwrap().unwrap();
        assert!(out.ended);
        assert!(matches!(out.events[0], GroupEvent::MemberLeft { .. }));
        assert!(matches!(
            out.events[1],
            GroupEvent::Ended {
                reason: EndReason::Empty
            }
        ));
        assert!(out.snapshot.members.is_empty());

        // Subsequent operations fail NotFound
        assert!(matches!(
            manager.apply_playback("g1", "u1", PlaybackCmd::Play, 7),
            Err(ListenError::NotFound(_))
        ));
        assert!(!manager.contains("g1"));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Versioning & reconciliation
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn versions_increase_by_exactly_one_per_mutation() {
        let manager = seeded_manager();
        let mut last = manager.version("g1").unwrap();
        let mutations: Vec<Box<dyn Fn(&GroupManager) -> Option<MutationOutcome>>> = vec![
            Box::new(|m| {
                m.apply_playback("g1", "u1", PlaybackCmd::Play, 10_000)
                    .unwrap()
            }),
            Box::new(|m| m.report_ready("g1", "u1", 10_100).unwrap()),
            Box::new(|m| m.report_ready("g1", "u2", 10_200).unwrap()),
            Box::new(|m| {
                m.apply_playback("g1", "u1", PlaybackCmd::Pause, 20_000)
                    .unwrap()
            }),
            Box::new(|m| {
                m.apply_queue(
                    "g1",
                    "u2",
                    QueueCmd::Add {
                        items: vec![track("t9")],
                    },
                    20_100,
                )
                .unwrap()
            }),
        ];
        for mutate in mutations {
            let out = mutate(&manager).expect("mutation applied");
            assert_eq!(out.snapshot.version, last + 1);
            last = out.snapshot.version;
        }
    }

    #[test]
    fn adopt_snapshot_is_monotone() {
        let manager = seeded_manager();
        let local = manager.snapshot("g1").unwrap();

        // Older or equal versions are discarded
        let mut stale = local.clone();
        stale.version = local.version;
        assert!(!manager.adopt_snapshot(stale));

        // Newer versions replace local state
        let mut newer = local.clone();
        newer.version = local.version + 5;
        newer.playing = true;
        assert!(manager.adopt_snapshot(newer));
        let snap = manager.snapshot("g1").unwrap();
        assert_eq!(snap.version, local.version + 5);
        assert!(snap.playing);
    }

    #[test]
    fn ensure_group_does_not_clobber_existing_state() {
        let manager = seeded_manager();
        let v = manager.version("g1").unwrap();
        manager.ensure_group(Snapshot::empty("g1"));
        assert_eq!(manager.version("g1").unwrap(), v);
    }
}
