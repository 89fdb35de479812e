//! Core configuration, sourced from environment-style flags.
//!
//! Every `LISTEN_TOGETHER_*` flag has a single enumerated effect; the server
//! binary layers a YAML file and CLI flags on top of this.

use crate::error::{ListenError, ListenResult};
use crate::protocol_constants::{
    DEFAULT_MUTATION_LOCK_PREFIX, DEFAULT_MUTATION_LOCK_TTL_MS, DEFAULT_RECONNECT_SLO_MS,
    DISCONNECT_MEMBER_GRACE_MS, JOIN_LEAD_MS, READY_TIMEOUT_MS,
};

/// Runtime configuration for the coordinator core.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Key material for bearer-token verification (`JWT_SECRET`).
    pub jwt_secret: Option<String>,
    /// Fallback key material (`SESSION_SECRET`); one of the two must be set.
    pub session_secret: Option<String>,
    /// Enables the read-only polling fallback in addition to WebSocket.
    pub allow_polling: bool,
    /// Enables cross-pod fanout via the cluster bus. Default on.
    pub redis_adapter_enabled: bool,
    /// Enables the shared snapshot store. Default on.
    pub state_store_enabled: bool,
    /// Enables the distributed mutation lock. When off, mutations fall back
    /// to a pod-local critical section.
    pub mutation_lock_enabled: bool,
    /// Mutation lock lease TTL (ms).
    pub mutation_lock_ttl_ms: u64,
    /// Namespacing prefix for lock keys.
    pub mutation_lock_prefix: String,
    /// Reconnect-latency SLO target (ms).
    pub reconnect_slo_ms: u64,
    /// Redis connection URL for the store / bus / lock backends. When unset,
    /// in-memory (pod-local) backends are used.
    pub redis_url: Option<String>,
    /// Ready-gate deadline (ms).
    pub ready_timeout_ms: u64,
    /// Lead time between gate satisfaction and scheduled start (ms).
    pub join_lead_ms: u64,
    /// Grace period before a fully-disconnected member is removed (ms).
    pub disconnect_grace_ms: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            session_secret: None,
            allow_polling: false,
            redis_adapter_enabled: true,
            state_store_enabled: true,
            mutation_lock_enabled: true,
            mutation_lock_ttl_ms: DEFAULT_MUTATION_LOCK_TTL_MS,
            mutation_lock_prefix: DEFAULT_MUTATION_LOCK_PREFIX.to_string(),
            reconnect_slo_ms: DEFAULT_RECONNECT_SLO_MS,
            redis_url: None,
            ready_timeout_ms: READY_TIMEOUT_MS,
            join_lead_ms: JOIN_LEAD_MS,
            disconnect_grace_ms: DISCONNECT_MEMBER_GRACE_MS,
        }
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl CoreConfig {
    /// Builds a configuration from the process environment.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            jwt_secret: std::env::var("JWT_SECRET").ok(),
            session_secret: std::env::var("SESSION_SECRET").ok(),
            allow_polling: env_flag("LISTEN_TOGETHER_ALLOW_POLLING", false),
            redis_adapter_enabled: env_flag("LISTEN_TOGETHER_REDIS_ADAPTER_ENABLED", true),
            state_store_enabled: env_flag("LISTEN_TOGETHER_STATE_STORE_ENABLED", true),
            mutation_lock_enabled: env_flag("LISTEN_TOGETHER_MUTATION_LOCK_ENABLED", true),
            mutation_lock_ttl_ms: env_u64(
                "LISTEN_TOGETHER_MUTATION_LOCK_TTL_MS",
                defaults.mutation_lock_ttl_ms,
            ),
            mutation_lock_prefix: std::env::var("LISTEN_TOGETHER_MUTATION_LOCK_PREFIX")
                .unwrap_or(defaults.mutation_lock_prefix),
            reconnect_slo_ms: env_u64(
                "LISTEN_TOGETHER_RECONNECT_SLO_MS",
                defaults.reconnect_slo_ms,
            ),
            redis_url: std::env::var("REDIS_URL").ok(),
            ready_timeout_ms: defaults.ready_timeout_ms,
            join_lead_ms: defaults.join_lead_ms,
            disconnect_grace_ms: defaults.disconnect_grace_ms,
        }
    }

    /// Returns the token-verification key material.
    ///
    /// `JWT_SECRET` wins over `SESSION_SECRET`; at least one must be present.
    pub fn key_material(&self) -> ListenResult<&str> {
        self.jwt_secret
            .as_deref()
            .or(self.session_secret.as_deref())
            .ok_or_else(|| {
                ListenError::Infrastructure(
                    "missing token key material: set JWT_SECRET or SESSION_SECRET".into(),
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let cfg = CoreConfig::default();
        assert!(cfg.redis_adapter_enabled);
        assert!(cfg.state_store_enabled);
        assert!(cfg.mutation_lock_enabled);
        assert!(!cfg.allow_polling);
        assert_eq!(cfg.mutation_lock_ttl_ms, 3_000);
        assert_eq!(cfg.reconnect_slo_ms, 5_000);
        assert_eq!(cfg.ready_timeout_ms, 4_000);
        assert_eq!(cfg.join_lead_ms, 500);
        assert_eq!(cfg.disconnect_grace_ms, 60_000);
        assert_eq!(cfg.mutation_lock_prefix, "listen-together:lock");
    }

    #[test]
    fn key_material_prefers_jwt_secret() {
        let cfg = CoreConfig {
            jwt_secret: Some("a".into()),
            session_secret: Some("b".into()),
            ..Default::default()
        };
        assert_eq!(cfg.key_material().unwrap(), "a");

        let cfg = CoreConfig {
            session_secret: Some("b".into()),
            ..Default::default()
        };
        assert_eq!(cfg.key_material().unwrap(), "b");
    }

    #[test]
    fn key_material_requires_a_secret() {
        let cfg = CoreConfig::default();
        assert!(cfg.key_material().is_err());
    }
}
