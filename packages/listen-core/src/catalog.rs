//! Track validation against the music catalog.
//!
//! The catalog itself is an external collaborator; the validator wraps it
//! with input checking and guarantees order-preserving, duplicate-friendly
//! resolution. Unresolvable ids are dropped, never errors.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::{ListenError, ListenResult};
use crate::group::types::QueueItem;

/// External catalog collaborator: resolves track ids to locally playable
/// queue items.
#[async_trait]
pub trait TrackCatalog: Send + Sync {
    /// Returns the resolvable subset of `track_ids` as queue items, in
    /// input order.
    async fn validate_local_tracks(&self, track_ids: &[String]) -> ListenResult<Vec<QueueItem>>;
}

/// Boundary validator in front of the catalog. No side effects.
pub struct TrackValidator {
    catalog: Arc<dyn TrackCatalog>,
}

impl TrackValidator {
    pub fn new(catalog: Arc<dyn TrackCatalog>) -> Self {
        Self { catalog }
    }

    /// Validates a candidate track id list.
    ///
    /// Fails `InvalidInput` only when the list itself is empty or malformed
    /// (blank ids); unresolvable ids are silently dropped.
    pub async fn validate(&self, track_ids: &[String]) -> ListenResult<Vec<QueueItem>> {
        if track_ids.is_empty() {
            return Err(ListenError::InvalidInput("empty track list".into()));
        }
        if track_ids.iter().any(|id| id.trim().is_empty()) {
            return Err(ListenError::InvalidInput("blank track id".into()));
        }
        self.catalog.validate_local_tracks(track_ids).await
    }
}

/// In-memory catalog for tests and the standalone server.
#[derive(Default)]
pub struct InMemoryCatalog {
    tracks: DashMap<String, QueueItem>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, item: QueueItem) {
        self.tracks.insert(item.track_id.clone(), item);
    }
}

#[async_trait]
impl TrackCatalog for InMemoryCatalog {
    async fn validate_local_tracks(&self, track_ids: &[String]) -> ListenResult<Vec<QueueItem>> {
        Ok(track_ids
            .iter()
            .filter_map(|id| self.tracks.get(id).map(|t| t.clone()))
            .collect())
    }
}
