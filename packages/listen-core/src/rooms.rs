//! Per-group rooms and delta fanout.
//!
//! Each socket owns a bounded outbound frame queue; a room is the set of
//! queues for a group's sockets. Broadcasts push into every queue in the
//! room, blocking (never dropping) when a queue is saturated, so each
//! mutation's events are delivered at most once per socket and in order.

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::events::GroupEvent;

/// One serialized wire frame: `{"event": ..., "data": ...}`.
pub fn encode_frame(event_name: &str, data: &impl Serialize) -> String {
    #[derive(Serialize)]
    struct Frame<'a, T> {
        event: &'a str,
        data: &'a T,
    }
    serde_json::to_string(&Frame {
        event: event_name,
        data,
    })
    .unwrap_or_else(|e| {
        log::error!("[Rooms] Frame encode failed for {}: {}", event_name, e);
        format!("{{\"event\":\"{event_name}\"}}")
    })
}

/// Sender half of one socket's outbound queue.
pub type SocketSender = mpsc::Sender<String>;

/// Registry of group rooms and their member sockets.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: DashMap<String, DashMap<String, SocketSender>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a socket to a group's room.
    pub fn join(&self, group_id: &str, socket_id: &str, sender: SocketSender) {
        self.rooms
            .entry(group_id.to_string())
            .or_default()
            .insert(socket_id.to_string(), sender);
    }

    /// Removes a socket from a group's room; drops the room when empty.
    pub fn leave(&self, group_id: &str, socket_id: &str) {
        if let Some(room) = self.rooms.get(group_id) {
            room.remove(socket_id);
        }
        self.rooms
            .remove_if(group_id, |_, room| room.is_empty());
    }

    /// Drops an entire room (group ended).
    pub fn close_room(&self, group_id: &str) {
        self.rooms.remove(group_id);
    }

    pub fn room_size(&self, group_id: &str) -> usize {
        self.rooms.get(group_id).map(|room| room.len()).unwrap_or(0)
    }

    /// Broadcasts an event to every socket in the group's room.
    ///
    /// The frame is rendered once. A full queue is logged and then waited
    /// on (backpressure, not loss); a closed queue gets its socket pruned.
    pub async fn broadcast(&self, group_id: &str, event: &GroupEvent) {
        let frame = encode_frame(event.wire_name(), event);
        let targets: Vec<(String, SocketSender)> = match self.rooms.get(group_id) {
            Some(room) => room
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect(),
            None => return,
        };

        for (socket_id, sender) in targets {
            match sender.try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(frame)) => {
                    log::warn!(
                        "[Rooms] Outbound queue saturated for socket {} in {}, applying backpressure",
                        socket_id,
                        group_id
                    );
                    if sender.send(frame).await.is_err() {
                        self.leave(group_id, &socket_id);
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.leave(group_id, &socket_id);
                }
            }
        }
    }

    /// Broadcasts a sequence of events from one mutation, preserving order.
    pub async fn broadcast_all(&self, group_id: &str, events: &[GroupEvent]) {
        for event in events {
            self.broadcast(group_id, event).await;
        }
    }
}
