//! Application bootstrap and dependency wiring.
//!
//! The composition root: backends are picked from configuration (Redis when
//! a URL is configured and the subsystem is enabled, in-memory otherwise,
//! disabled stand-ins when turned off), collaborators are injected, and the
//! coordinator, presence layer, and API state are wired together. Nothing
//! here is a global; the returned container owns the explicit lifecycle.

use std::sync::Arc;

use redis::aio::ConnectionManager;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::api::AppState;
use crate::auth::{JwtAuthVerifier, UserDirectory};
use crate::catalog::{TrackCatalog, TrackValidator};
use crate::config::CoreConfig;
use crate::coordinator::{CoordinatorConfig, GroupCoordinator};
use crate::error::{ListenError, ListenResult};
use crate::group::manager::GateTiming;
use crate::membership::GroupMembership;
use crate::observability::CoordMetrics;
use crate::presence::PresenceLayer;
use crate::rooms::RoomRegistry;
use crate::store::{
    DisabledSnapshotBus, DisabledSnapshotStore, MemoryMutationLock, MemorySnapshotStore,
    MutationLock, RedisMutationLock, RedisSnapshotBus, RedisSnapshotStore, SnapshotBus,
    SnapshotStore,
};

/// External collaborators the core consumes but does not implement.
pub struct Collaborators {
    pub directory: Arc<dyn UserDirectory>,
    pub membership: Arc<dyn GroupMembership>,
    pub catalog: Arc<dyn TrackCatalog>,
}

/// Container for all bootstrapped services.
pub struct BootstrappedServices {
    pub coordinator: Arc<GroupCoordinator>,
    pub presence: Arc<PresenceLayer>,
    pub rooms: Arc<RoomRegistry>,
    pub metrics: Arc<CoordMetrics>,
    pub app_state: AppState,
    cancel: CancellationToken,
    cleanup_worker: JoinHandle<()>,
}

impl BootstrappedServices {
    /// Cancels grace timers, drains pending snapshot chains, and stops
    /// background workers.
    pub async fn shutdown(&self) {
        log::info!("[Bootstrap] Beginning graceful shutdown...");
        self.presence.shutdown();
        self.coordinator.shutdown().await;
        self.cancel.cancel();
        self.cleanup_worker.abort();
        log::info!("[Bootstrap] Shutdown complete");
    }
}

async fn connect_redis(url: &str) -> ListenResult<(redis::Client, ConnectionManager)> {
    let client = redis::Client::open(url)
        .map_err(|e| ListenError::Infrastructure(format!("redis url: {e}")))?;
    let manager = ConnectionManager::new(client.clone())
        .await
        .map_err(|e| ListenError::Infrastructure(format!("redis connect: {e}")))?;
    Ok((client, manager))
}

/// Bootstraps all services with their dependencies.
///
/// Wiring order: metrics and cancellation first, then the shared-state
/// backends, then the coordinator (which owns the pipeline and the bus
/// subscription), then presence and its cleanup worker, and finally the
/// API state.
pub async fn bootstrap_services(
    config: &CoreConfig,
    collaborators: Collaborators,
) -> ListenResult<BootstrappedServices> {
    let verifier = Arc::new(JwtAuthVerifier::new(config.key_material()?));
    let metrics = Arc::new(CoordMetrics::new());
    let cancel = CancellationToken::new();
    let rooms = Arc::new(RoomRegistry::new());

    let needs_redis =
        config.state_store_enabled || config.redis_adapter_enabled || config.mutation_lock_enabled;
    let redis = match (&config.redis_url, needs_redis) {
        (Some(url), true) => Some(connect_redis(url).await?),
        _ => None,
    };

    let store: Arc<dyn SnapshotStore> = if !config.state_store_enabled {
        log::warn!("[Bootstrap] State store disabled; groups degrade to pod-local state");
        Arc::new(DisabledSnapshotStore)
    } else if let Some((_, manager)) = &redis {
        Arc::new(RedisSnapshotStore::new(manager.clone()))
    } else {
        log::info!("[Bootstrap] No REDIS_URL; using in-memory snapshot store (single pod)");
        Arc::new(MemorySnapshotStore::new())
    };

    let bus: Arc<dyn SnapshotBus> = if !config.redis_adapter_enabled {
        log::warn!("[Bootstrap] Cluster adapter disabled; no cross-pod fanout");
        Arc::new(DisabledSnapshotBus)
    } else if let Some((client, manager)) = &redis {
        let pod_id = Uuid::new_v4().to_string();
        log::info!("[Bootstrap] Cluster bus enabled, pod id {}", pod_id);
        Arc::new(RedisSnapshotBus::new(
            client.clone(),
            manager.clone(),
            pod_id,
            cancel.clone(),
        ))
    } else {
        log::info!("[Bootstrap] No REDIS_URL; cross-pod fanout unavailable");
        Arc::new(DisabledSnapshotBus)
    };

    let lock: Arc<dyn MutationLock> = match (&redis, config.mutation_lock_enabled) {
        (Some((_, manager)), true) => Arc::new(RedisMutationLock::new(
            manager.clone(),
            config.mutation_lock_prefix.clone(),
        )),
        (None, true) => {
            log::info!("[Bootstrap] No REDIS_URL; mutation lock is pod-local");
            Arc::new(MemoryMutationLock::new())
        }
        (_, false) => {
            log::warn!("[Bootstrap] Mutation lock disabled; using pod-local critical sections");
            Arc::new(MemoryMutationLock::new())
        }
    };

    let coordinator = GroupCoordinator::start(
        CoordinatorConfig {
            lock_enabled: config.mutation_lock_enabled,
            lock_ttl_ms: config.mutation_lock_ttl_ms,
            gate_timing: GateTiming {
                ready_timeout_ms: config.ready_timeout_ms,
                join_lead_ms: config.join_lead_ms,
            },
        },
        store,
        bus,
        lock,
        Arc::clone(&rooms),
        Arc::clone(&collaborators.membership),
        Arc::clone(&metrics),
        cancel.clone(),
    )
    .await?;

    let (presence, cleanup_rx) = PresenceLayer::new(
        Arc::clone(&metrics),
        config.disconnect_grace_ms,
        config.reconnect_slo_ms,
        cancel.clone(),
    );
    let cleanup_worker = coordinator.spawn_cleanup_worker(cleanup_rx);

    if config.allow_polling {
        log::info!("[Bootstrap] Polling fallback enabled");
    }

    let app_state = AppState {
        coordinator: Arc::clone(&coordinator),
        presence: Arc::clone(&presence),
        rooms: Arc::clone(&rooms),
        verifier,
        directory: collaborators.directory,
        validator: Arc::new(TrackValidator::new(collaborators.catalog)),
        allow_polling: config.allow_polling,
    };

    Ok(BootstrappedServices {
        coordinator,
        presence,
        rooms,
        metrics,
        app_state,
        cancel,
        cleanup_worker,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::InMemoryUserDirectory;
    use crate::catalog::InMemoryCatalog;
    use crate::membership::InMemoryMembership;

    fn collaborators() -> Collaborators {
        Collaborators {
            directory: Arc::new(InMemoryUserDirectory::new()),
            membership: Arc::new(InMemoryMembership::new()),
            catalog: Arc::new(InMemoryCatalog::new()),
        }
    }

    #[tokio::test]
    async fn bootstrap_requires_key_material() {
        let config = CoreConfig::default();
        assert!(bootstrap_services(&config, collaborators()).await.is_err());
    }

    #[tokio::test]
    async fn bootstrap_wires_memory_backends_without_redis() {
        let config = CoreConfig {
            jwt_secret: Some("secret".into()),
            ..Default::default()
        };
        let services = bootstrap_services(&config, collaborators()).await.unwrap();
        assert!(!services.app_state.allow_polling);
        services.shutdown().await;
    }
}
