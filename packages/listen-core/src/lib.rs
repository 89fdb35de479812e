//! Listen Core - shared library for Listen Together.
//!
//! This crate implements the real-time session coordinator behind shared
//! music playback: authenticated members of a *group* share one playback
//! cursor and one queue, playback starts are gated on members reporting
//! ready, and state survives pod restarts and brief client disconnects.
//!
//! # Architecture
//!
//! - [`group`]: the authoritative in-memory group model and its mutation
//!   state machine
//! - [`store`]: snapshot store, cluster bus, and mutation lock abstractions
//!   (in-memory and Redis backends)
//! - [`pipeline`]: per-group FIFO persist-and-publish chains
//! - [`coordinator`]: the lock-protected mutation protocol, gate timers,
//!   and cross-pod reconciliation
//! - [`presence`]: socket presence, disconnect grace, reconnect SLO
//! - [`rooms`]: per-group fanout to socket outbound queues
//! - [`api`]: the WebSocket verb surface and HTTP fallback
//! - [`observability`]: coordination counters
//!
//! # Abstraction traits
//!
//! External collaborators are consumed through traits so the core never
//! depends on the wider service's database or catalog:
//! [`AuthVerifier`](auth::AuthVerifier),
//! [`UserDirectory`](auth::UserDirectory),
//! [`GroupMembership`](membership::GroupMembership),
//! [`TrackCatalog`](catalog::TrackCatalog). Each has an in-memory
//! implementation suitable for tests and the standalone server.

#![warn(clippy::all)]

pub mod api;
pub mod auth;
pub mod bootstrap;
pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod group;
pub mod membership;
pub mod observability;
pub mod pipeline;
pub mod presence;
pub mod protocol_constants;
pub mod rooms;
pub mod store;
pub mod utils;

// Re-export commonly used types at the crate root
pub use api::{start_server, AppState};
pub use auth::{AuthClaims, AuthContext, AuthVerifier, InMemoryUserDirectory, JwtAuthVerifier,
    UserDirectory, UserRecord};
pub use bootstrap::{bootstrap_services, BootstrappedServices, Collaborators};
pub use catalog::{InMemoryCatalog, TrackCatalog, TrackValidator};
pub use config::CoreConfig;
pub use coordinator::{CoordinatorConfig, GroupCoordinator};
pub use error::{ListenError, ListenResult};
pub use events::{GroupEvent, QueueOp};
pub use group::manager::{GateTiming, GroupManager, MutationOutcome};
pub use group::types::{
    EndReason, Group, Member, PlaybackCmd, QueueCmd, QueueItem, ReadyGate, Snapshot,
};
pub use membership::{GroupMembership, InMemoryMembership};
pub use observability::{CoordMetrics, MetricsSnapshot};
pub use presence::{ExpiredMember, PresenceLayer};
pub use rooms::RoomRegistry;
pub use store::{
    BusHandler, MemoryBusHub, MemoryMutationLock, MemorySnapshotBus, MemorySnapshotStore,
    MutationLock, RedisMutationLock, RedisSnapshotBus, RedisSnapshotStore, SnapshotBus,
    SnapshotStore,
};
pub use utils::now_millis;
