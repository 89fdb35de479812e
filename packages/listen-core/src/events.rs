//! Delta events emitted by the group manager and fanned out to rooms.
//!
//! Every applied mutation produces exactly one delta event. The full
//! `group:state` snapshot is sent only where observers need to (re)sync:
//! the unicast on join and the fanout after cross-pod adoption.

use serde::Serialize;

use crate::group::types::{EndReason, QueueItem, Snapshot};

/// Queue operation tag carried in queue deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum QueueOp {
    Add,
    InsertNext,
    Remove,
    Reorder,
    Clear,
}

/// Events delivered to every socket in a group's room.
///
/// Serialized shape is the wire `data` payload; the wire event name comes
/// from [`GroupEvent::wire_name`].
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum GroupEvent {
    /// Full snapshot (`group:state`): join unicast and cross-pod adoption.
    State(Snapshot),

    /// Playback fields changed without opening a gate.
    #[serde(rename_all = "camelCase")]
    PlaybackDelta {
        playing: bool,
        position_ms: u64,
        cursor: Option<usize>,
        updated_at_ms: u64,
        version: u64,
    },

    /// The queue changed. Carries the resulting queue so observers don't
    /// have to replay operations.
    #[serde(rename_all = "camelCase")]
    QueueDelta {
        op: QueueOp,
        queue: Vec<QueueItem>,
        cursor: Option<usize>,
        version: u64,
    },

    /// A ready gate is armed; playback is held for these members.
    #[serde(rename_all = "camelCase")]
    Waiting {
        expected_user_ids: Vec<String>,
        deadline_ms: u64,
    },

    /// The gate closed: start playback at this shared wall-clock instant.
    #[serde(rename_all = "camelCase")]
    PlayAt {
        wall_clock_ms: u64,
        cursor: usize,
        position_ms: u64,
    },

    #[serde(rename_all = "camelCase")]
    MemberJoined { user_id: String, username: String },

    #[serde(rename_all = "camelCase")]
    MemberLeft { user_id: String },

    #[serde(rename_all = "camelCase")]
    Ended { reason: EndReason },
}

impl GroupEvent {
    /// The room broadcast name for this event.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::State(_) => "group:state",
            Self::PlaybackDelta { .. } => "group:playback-delta",
            Self::QueueDelta { .. } => "group:queue-delta",
            Self::Waiting { .. } => "group:waiting",
            Self::PlayAt { .. } => "group:play-at",
            Self::MemberJoined { .. } => "group:member-joined",
            Self::MemberLeft { .. } => "group:member-left",
            Self::Ended { .. } => "group:ended",
        }
    }
}
