//! Group membership collaborator.
//!
//! Membership rows live in an external database owned by the wider service;
//! this core only consumes the two operations it needs. A member exists iff
//! the row exists - the pod-local group model mirrors the rows, it never
//! owns them.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};

use crate::error::{ListenError, ListenResult};
use crate::group::types::Snapshot;

/// External membership collaborator.
#[async_trait]
pub trait GroupMembership: Send + Sync {
    /// Validates (and if permitted creates) the membership row, returning a
    /// seed snapshot for pods that have no copy of the group yet.
    ///
    /// Fails `NotFound` for a group that was removed or never existed; a
    /// join never creates a group. Fails `NotMember` when the caller is not
    /// allowed in.
    async fn join_group_by_id(
        &self,
        user_id: &str,
        username: &str,
        group_id: &str,
    ) -> ListenResult<Snapshot>;

    /// Removes the membership row.
    async fn leave_group(&self, user_id: &str, group_id: &str) -> ListenResult<()>;
}

/// In-memory membership for tests and the standalone server.
///
/// Groups must be registered up front; any authenticated user may then join
/// them (open-door policy, matching the hosted service's public groups).
#[derive(Default)]
pub struct InMemoryMembership {
    groups: DashMap<String, DashSet<String>>,
}

impl InMemoryMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a joinable group.
    pub fn create_group(&self, group_id: &str) {
        self.groups.entry(group_id.to_string()).or_default();
    }

    pub fn is_member(&self, user_id: &str, group_id: &str) -> bool {
        self.groups
            .get(group_id)
            .is_some_and(|members| members.contains(user_id))
    }
}

#[async_trait]
impl GroupMembership for InMemoryMembership {
    async fn join_group_by_id(
        &self,
        user_id: &str,
        _username: &str,
        group_id: &str,
    ) -> ListenResult<Snapshot> {
        let members = self
            .groups
            .get(group_id)
            .ok_or_else(|| ListenError::NotFound(group_id.to_string()))?;
        members.insert(user_id.to_string());
        Ok(Snapshot::empty(group_id))
    }

    async fn leave_group(&self, user_id: &str, group_id: &str) -> ListenResult<()> {
        if let Some(members) = self.groups.get(group_id) {
            members.remove(user_id);
        }
        Ok(())
    }
}
