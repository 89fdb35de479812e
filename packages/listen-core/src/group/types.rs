//! Core data model for listening groups.
//!
//! The [`Group`] is the authoritative pod-local state; the [`Snapshot`] is
//! its canonical wire/store projection. Sockets never appear here - socket
//! membership is pod-local and lives in the presence layer.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::protocol_constants::SNAPSHOT_SCHEMA_VERSION;

/// Immutable queue entry, produced only by the track validator.
///
/// Queue identity is positional: the same track may appear multiple times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub track_id: String,
    pub title: String,
    pub artist_name: String,
    pub album_title: String,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub cover_url: Option<String>,
}

/// A group member as carried in snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub user_id: String,
    pub username: String,
    pub joined_at_ms: u64,
}

/// Transient coordination object opened when entering playback.
///
/// Satisfied when every expected member has reported ready or the deadline
/// elapses, whichever comes first. `gate_seq` ties deadline timers to the
/// gate instance they were armed for, so a stale timer firing after a
/// re-arm is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyGate {
    pub target_index: usize,
    pub expected_user_ids: BTreeSet<String>,
    pub ready_user_ids: BTreeSet<String>,
    pub deadline_ms: u64,
    pub gate_seq: u64,
}

impl ReadyGate {
    /// The gate is satisfied when everyone expected has reported ready.
    pub fn is_satisfied(&self) -> bool {
        self.expected_user_ids
            .iter()
            .all(|u| self.ready_user_ids.contains(u))
    }

    /// Members still expected to report ready.
    pub fn remaining(&self) -> Vec<String> {
        self.expected_user_ids
            .iter()
            .filter(|u| !self.ready_user_ids.contains(*u))
            .cloned()
            .collect()
    }
}

/// Authoritative in-memory state of one listening group.
///
/// Playback state machine: `Idle -> ArmedWaiting -> Playing -> Paused`.
/// An armed (present) gate is the ArmedWaiting state and implies
/// `playing == false`; `playing` flips to true exactly when the gate is
/// satisfied and `PlayAt` is emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub queue: Vec<QueueItem>,
    /// Index into `queue`; `None` iff the queue is empty.
    pub cursor: Option<usize>,
    pub position_ms: u64,
    pub playing: bool,
    pub updated_at_ms: u64,
    pub members: BTreeMap<String, Member>,
    pub ready_gate: Option<ReadyGate>,
    /// Strictly increases on every applied mutation.
    pub version: u64,
}

impl Group {
    /// An empty group at version 0 (nothing applied yet).
    pub fn empty() -> Self {
        Self {
            queue: Vec::new(),
            cursor: None,
            position_ms: 0,
            playing: false,
            updated_at_ms: 0,
            members: BTreeMap::new(),
            ready_gate: None,
            version: 0,
        }
    }

    /// The track under the cursor, if any.
    pub fn current_track(&self) -> Option<&QueueItem> {
        self.cursor.and_then(|i| self.queue.get(i))
    }

    /// Whether a ready gate is currently armed (ArmedWaiting state).
    pub fn is_armed(&self) -> bool {
        self.ready_gate.is_some()
    }

    /// Playback offset extrapolated to `now_ms`, clamped to the current
    /// track duration. Used when freezing position on pause.
    pub fn estimated_position_ms(&self, now_ms: u64) -> u64 {
        if !self.playing {
            return self.position_ms;
        }
        let elapsed = now_ms.saturating_sub(self.updated_at_ms);
        let estimate = self.position_ms.saturating_add(elapsed);
        match self.current_track() {
            Some(track) => estimate.min(track.duration_ms),
            None => estimate,
        }
    }
}

/// Canonical serializable projection of a [`Group`] at a given version.
///
/// This is both the store payload and the `group:state` wire payload. The
/// top-level `schemaVersion` allows rolling schema changes across pods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub schema_version: u8,
    pub group_id: String,
    pub queue: Vec<QueueItem>,
    pub cursor: Option<usize>,
    pub position_ms: u64,
    pub playing: bool,
    pub updated_at_ms: u64,
    pub members: Vec<Member>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub ready_gate: Option<ReadyGate>,
    pub version: u64,
}

impl Snapshot {
    /// Renders a snapshot from pod-local group state.
    pub fn of(group_id: &str, group: &Group) -> Self {
        Self {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            group_id: group_id.to_string(),
            queue: group.queue.clone(),
            cursor: group.cursor,
            position_ms: group.position_ms,
            playing: group.playing,
            updated_at_ms: group.updated_at_ms,
            members: group.members.values().cloned().collect(),
            ready_gate: group.ready_gate.clone(),
            version: group.version,
        }
    }

    /// An empty version-0 snapshot for a group that has no applied state yet.
    pub fn empty(group_id: &str) -> Self {
        Self::of(group_id, &Group::empty())
    }

    /// Reconstructs pod-local group state from a snapshot.
    pub fn into_group(self) -> Group {
        Group {
            queue: self.queue,
            cursor: self.cursor,
            position_ms: self.position_ms,
            playing: self.playing,
            updated_at_ms: self.updated_at_ms,
            members: self
                .members
                .into_iter()
                .map(|m| (m.user_id.clone(), m))
                .collect(),
            ready_gate: self.ready_gate,
            version: self.version,
        }
    }
}

/// Playback verbs, validated at the transport boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackCmd {
    Play,
    Pause,
    Seek { position_ms: u64 },
    Next,
    Previous,
    SetTrack { index: usize },
}

/// Queue verbs, validated at the transport boundary. `Add`/`InsertNext`
/// carry items already resolved by the track validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueCmd {
    Add { items: Vec<QueueItem> },
    InsertNext { items: Vec<QueueItem> },
    Remove { index: usize },
    Reorder { from: usize, to: usize },
    Clear,
}

/// Why a group ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EndReason {
    /// The last member left.
    Empty,
}
