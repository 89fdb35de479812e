//! Fixed protocol constants shared by all pods.
//!
//! Clients and other pods depend on these values (wire event names, key
//! layout, timing contracts); changing them is a protocol change, not a
//! tuning knob.

// ─────────────────────────────────────────────────────────────────────────────
// Ready Gate
// ─────────────────────────────────────────────────────────────────────────────

/// How long a ready gate stays open before playback starts regardless of
/// which members have reported ready (ms).
pub const READY_TIMEOUT_MS: u64 = 4_000;

/// Lead time between gate satisfaction and the scheduled playback start (ms).
///
/// Gives every client a fixed window to buffer before the shared wall-clock
/// start instant.
pub const JOIN_LEAD_MS: u64 = 500;

// ─────────────────────────────────────────────────────────────────────────────
// Mutation Lock
// ─────────────────────────────────────────────────────────────────────────────

/// Default per-group mutation lease TTL (ms). Strictly bounds how long a
/// single mutation may hold the group.
pub const DEFAULT_MUTATION_LOCK_TTL_MS: u64 = 3_000;

/// Lower clamp for the CONFLICT retry-after hint (ms).
pub const MIN_CONFLICT_RETRY_AFTER_MS: u64 = 75;

/// Upper clamp for the CONFLICT retry-after hint (ms).
pub const MAX_CONFLICT_RETRY_AFTER_MS: u64 = 500;

/// Default namespacing prefix for mutation lock keys.
pub const DEFAULT_MUTATION_LOCK_PREFIX: &str = "listen-together:lock";

// ─────────────────────────────────────────────────────────────────────────────
// Presence
// ─────────────────────────────────────────────────────────────────────────────

/// Grace period before a fully-disconnected member is treated as having
/// left the group (ms).
pub const DISCONNECT_MEMBER_GRACE_MS: u64 = 60_000;

/// Default reconnect-latency SLO target (ms). Samples above this are
/// breaches and get logged.
pub const DEFAULT_RECONNECT_SLO_MS: u64 = 5_000;

/// Interval between server-initiated WebSocket pings (seconds).
pub const WS_PING_INTERVAL_SECS: u64 = 25;

/// A connection with no pong (or any inbound frame) for this long is
/// considered dead (seconds).
pub const WS_PONG_TIMEOUT_SECS: u64 = 60;

// ─────────────────────────────────────────────────────────────────────────────
// Persisted State Layout
// ─────────────────────────────────────────────────────────────────────────────

/// Snapshot key prefix; full key is `listen-together:snapshot:<groupId>`.
pub const SNAPSHOT_KEY_PREFIX: &str = "listen-together:snapshot";

/// Cluster bus pub/sub channel carrying `(groupId, snapshot)` messages.
pub const SNAPSHOT_BUS_CHANNEL: &str = "listen-together:snapshots";

/// TTL applied to persisted snapshots (seconds).
///
/// Must exceed the longest expected idle group lifetime; idle groups past
/// this are reaped by the store.
pub const SNAPSHOT_TTL_SECS: u64 = 24 * 60 * 60;

/// Schema version stamped into every serialized snapshot.
pub const SNAPSHOT_SCHEMA_VERSION: u8 = 1;

// ─────────────────────────────────────────────────────────────────────────────
// Transport
// ─────────────────────────────────────────────────────────────────────────────

/// The single dedicated WebSocket endpoint path.
pub const SOCKET_PATH: &str = "/listen-together";

/// Capacity of each socket's outbound frame queue. Sends block (never drop)
/// when the queue is full; saturation is logged.
pub const SOCKET_OUTBOUND_CAPACITY: usize = 256;

/// Capacity of each group's snapshot persistence chain.
pub const PIPELINE_CHANNEL_CAPACITY: usize = 64;

// ─────────────────────────────────────────────────────────────────────────────
// Observability
// ─────────────────────────────────────────────────────────────────────────────

/// Aggregate counters are logged every this many recorded events.
pub const COUNTER_LOG_INTERVAL: u64 = 25;

/// Service identifier reported by the health endpoint.
pub const SERVICE_ID: &str = "listen-together";
