//! Pool registry
//!
//! Owns every live [`Pool`] keyed by id and by name. The maps sit behind a
//! short-held `RwLock`; pools are cheap handles, so starting and draining
//! run outside it. A name is reserved while its pool starts so concurrent
//! registrations of the same name cannot both succeed.

pub mod discovery;

pub use discovery::{DirectorySource, DiscoverySource, PoolDescriptor, StaticSource};

use crate::backend::{BackendFactory, PoolBackend};
use crate::bus::{MessageBus, Topic};
use crate::core::{OrchestratorError, PoolId, Result};
use crate::pool::{Pool, PoolConfig};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Default)]
struct RegistryState {
    /// Registration order
    order: Vec<PoolId>,
    pools: HashMap<PoolId, Pool>,
    names: HashMap<String, PoolId>,
    /// Names whose pools are still starting
    reserved: HashSet<String>,
}

impl RegistryState {
    fn name_taken(&self, name: &str) -> bool {
        self.names.contains_key(name) || self.reserved.contains(name)
    }
}

/// Releases a name reservation unless the registration went through
struct NameReservation<'a> {
    registry: &'a PoolRegistry,
    name: String,
    committed: bool,
}

impl Drop for NameReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.registry.state.write().reserved.remove(&self.name);
        }
    }
}

/// A pool registered during discovery
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveredPool {
    /// Pool name
    pub name: String,
    /// Assigned id
    pub pool_id: PoolId,
}

/// A descriptor that could not be registered
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveryFailure {
    /// Pool name from the descriptor
    pub name: String,
    /// Stable error code
    pub code: String,
    /// Error message
    pub message: String,
}

/// Result of [`PoolRegistry::discover`]
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryReport {
    /// Source that was scanned
    pub source: String,
    /// Every descriptor found
    pub candidates: Vec<PoolDescriptor>,
    /// Pools registered by this call
    pub registered: Vec<DiscoveredPool>,
    /// Names already registered
    pub skipped: Vec<String>,
    /// Descriptors that failed to register
    pub failed: Vec<DiscoveryFailure>,
}

/// Registry of live pools
pub struct PoolRegistry {
    state: RwLock<RegistryState>,
    bus: Arc<MessageBus>,
    factory: BackendFactory,
}

impl std::fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("PoolRegistry")
            .field("pools", &state.order.len())
            .field("reserved", &state.reserved.len())
            .finish()
    }
}

impl PoolRegistry {
    /// Create an empty registry
    pub fn new(bus: Arc<MessageBus>, factory: BackendFactory) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            bus,
            factory,
        }
    }

    /// Bus the registry and its pools publish to
    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// Register a pool using a backend built from its configuration
    ///
    /// Spawns `min_workers` before returning. On any failure no pool is left
    /// registered.
    pub async fn register(&self, config: PoolConfig) -> Result<PoolId> {
        self.register_with_id(PoolId::new(), config, None).await
    }

    /// Register a pool over an already built backend
    pub async fn register_with_backend(
        &self,
        config: PoolConfig,
        backend: Arc<dyn PoolBackend>,
    ) -> Result<PoolId> {
        self.register_with_id(PoolId::new(), config, Some(backend))
            .await
    }

    pub(crate) async fn register_with_id(
        &self,
        id: PoolId,
        config: PoolConfig,
        backend: Option<Arc<dyn PoolBackend>>,
    ) -> Result<PoolId> {
        config.validate()?;
        let mut reservation = self.reserve(id, &config.name)?;

        let backend = match backend {
            Some(backend) => backend,
            None => self.factory.create(&config)?,
        };
        let pool = Pool::new(id, config, backend, Arc::clone(&self.bus));
        pool.start().await?;

        {
            let mut state = self.state.write();
            state.reserved.remove(pool.name());
            state.names.insert(pool.name().to_string(), id);
            state.pools.insert(id, pool.clone());
            state.order.push(id);
        }
        reservation.committed = true;

        let config = pool.config();
        self.bus.emit(
            Topic::PoolRegistered,
            Some(id),
            json!({
                "name": config.name,
                "backend_type": config.backend_type,
                "min_workers": config.min_workers,
                "max_workers": config.max_workers,
                "tags": config.tags,
            }),
        );
        info!(pool = %config.name, pool_id = %id, backend = %config.backend_type, "Pool registered");
        Ok(id)
    }

    fn reserve(&self, id: PoolId, name: &str) -> Result<NameReservation<'_>> {
        let mut state = self.state.write();
        if state.name_taken(name) || state.pools.contains_key(&id) {
            return Err(OrchestratorError::duplicate_name(name));
        }
        state.reserved.insert(name.to_string());
        Ok(NameReservation {
            registry: self,
            name: name.to_string(),
            committed: false,
        })
    }

    /// Drain and remove a pool; unknown ids are ignored
    pub async fn unregister(&self, pool_id: PoolId) -> Result<()> {
        let pool = {
            let mut state = self.state.write();
            let Some(pool) = state.pools.remove(&pool_id) else {
                return Ok(());
            };
            state.names.remove(pool.name());
            state.order.retain(|id| *id != pool_id);
            pool
        };

        let closed = pool.close().await;
        if let Err(e) = &closed {
            warn!(pool = %pool.name(), error = %e, "Pool did not close cleanly");
        }
        self.bus.emit(
            Topic::PoolRemoved,
            Some(pool_id),
            json!({"name": pool.name()}),
        );
        info!(pool = %pool.name(), pool_id = %pool_id, "Pool unregistered");
        closed
    }

    /// Look a pool up by id
    pub fn get(&self, pool_id: PoolId) -> Result<Pool> {
        self.state
            .read()
            .pools
            .get(&pool_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::pool_not_found(pool_id.to_string()))
    }

    /// Look a pool up by name
    pub fn get_by_name(&self, name: &str) -> Result<Pool> {
        let state = self.state.read();
        state
            .names
            .get(name)
            .and_then(|id| state.pools.get(id))
            .cloned()
            .ok_or_else(|| OrchestratorError::pool_not_found(name))
    }

    /// Look a pool up by id or, failing that, by name
    pub fn resolve(&self, id_or_name: &str) -> Result<Pool> {
        if let Ok(id) = id_or_name.parse::<PoolId>() {
            if let Ok(pool) = self.get(id) {
                return Ok(pool);
            }
        }
        self.get_by_name(id_or_name)
    }

    /// Pools in registration order, optionally only those carrying `tag`
    pub fn list(&self, tag: Option<&str>) -> Vec<Pool> {
        let state = self.state.read();
        state
            .order
            .iter()
            .filter_map(|id| state.pools.get(id))
            .filter(|pool| tag.map_or(true, |tag| pool.config().tags.contains(tag)))
            .cloned()
            .collect()
    }

    /// Number of registered pools
    pub fn len(&self) -> usize {
        self.state.read().order.len()
    }

    /// Whether no pool is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Scan `source`, registering unknown pools when `auto_register` is set
    pub async fn discover(
        &self,
        source: &dyn DiscoverySource,
        auto_register: bool,
    ) -> Result<DiscoveryReport> {
        let candidates = source.discover().await?;
        let mut report = DiscoveryReport {
            source: source.name().to_string(),
            candidates: candidates.clone(),
            registered: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
        };

        for descriptor in candidates {
            let name = descriptor.config.name.clone();
            if self.get_by_name(&name).is_ok() {
                report.skipped.push(name);
                continue;
            }
            if !auto_register {
                continue;
            }
            let id = descriptor.id.unwrap_or_default();
            match self.register_with_id(id, descriptor.config, None).await {
                Ok(pool_id) => report.registered.push(DiscoveredPool { name, pool_id }),
                Err(OrchestratorError::DuplicateName { .. }) => report.skipped.push(name),
                Err(e) => {
                    warn!(source = %report.source, pool = %name, error = %e, "Discovered pool failed to register");
                    report.failed.push(DiscoveryFailure {
                        name,
                        code: e.code().to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        info!(
            source = %report.source,
            candidates = report.candidates.len(),
            registered = report.registered.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "Discovery finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendOptions, BackendType};
    use crate::core::Task;
    use crate::pool::{PoolStatus, WorkerHandle};
    use async_trait::async_trait;
    use serde_json::Value;

    fn registry() -> PoolRegistry {
        PoolRegistry::new(Arc::new(MessageBus::default()), BackendFactory::default())
    }

    fn local(name: &str) -> PoolConfig {
        PoolConfig::new(name, BackendType::Local).with_workers(1, 2)
    }

    struct BrokenBackend;

    #[async_trait]
    impl PoolBackend for BrokenBackend {
        fn backend_type(&self) -> BackendType {
            BackendType::Cluster
        }

        async fn spawn_worker(&self, _pool_id: PoolId, _options: &BackendOptions) -> Result<WorkerHandle> {
            Err(OrchestratorError::backend_unavailable("cluster", "no nodes"))
        }

        async fn terminate_worker(&self, _worker: &WorkerHandle) -> Result<()> {
            Ok(())
        }

        async fn dispatch(&self, _worker: &WorkerHandle, _task: &Task) -> Result<Value> {
            unreachable!("no worker is ever spawned")
        }

        async fn probe_health(&self, _worker: &WorkerHandle) -> Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = registry();
        let mut events = registry.bus().subscribe(&[Topic::PoolRegistered]);

        let id = registry.register(local("p1")).await.unwrap();
        let pool = registry.get(id).unwrap();
        assert_eq!(pool.name(), "p1");
        assert_eq!(pool.status(), PoolStatus::Healthy);
        assert_eq!(pool.workers().len(), 1);

        assert_eq!(registry.get_by_name("p1").unwrap().id(), id);
        assert_eq!(registry.resolve(&id.to_string()).unwrap().id(), id);
        assert_eq!(registry.resolve("p1").unwrap().id(), id);
        assert_eq!(registry.resolve("nope").unwrap_err().code(), "POOL_NOT_FOUND");

        let event = events.recv().await.unwrap();
        assert_eq!(event.pool_id, Some(id));
        assert_eq!(event.payload["name"], "p1");
    }

    #[tokio::test]
    async fn test_duplicate_and_invalid_configs_rejected() {
        let registry = registry();
        registry.register(local("p1")).await.unwrap();

        let dup = registry.register(local("p1")).await.unwrap_err();
        assert_eq!(dup.code(), "DUPLICATE_NAME");

        let invalid = registry
            .register(PoolConfig::new("bad", BackendType::Local).with_workers(3, 1))
            .await
            .unwrap_err();
        assert_eq!(invalid.code(), "INVALID_CONFIG");
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_nothing_registered() {
        let registry = registry();
        let err = registry
            .register_with_backend(local("broken"), Arc::new(BrokenBackend))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "BACKEND_UNAVAILABLE");
        assert!(registry.is_empty());

        // The name is free again
        registry.register(local("broken")).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_filters_by_tag_in_registration_order() {
        let registry = registry();
        registry.register(local("c").with_tag("gpu")).await.unwrap();
        registry.register(local("a")).await.unwrap();
        registry.register(local("b").with_tag("gpu")).await.unwrap();

        let all: Vec<String> = registry.list(None).iter().map(|p| p.name().to_string()).collect();
        assert_eq!(all, vec!["c", "a", "b"]);
        let gpu: Vec<String> = registry
            .list(Some("gpu"))
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(gpu, vec!["c", "b"]);
    }

    #[tokio::test]
    async fn test_unregister_drains_and_is_idempotent() {
        let registry = registry();
        let mut events = registry.bus().subscribe(&[Topic::PoolRemoved]);
        let id = registry.register(local("p1")).await.unwrap();
        let pool = registry.get(id).unwrap();

        registry.unregister(id).await.unwrap();
        assert_eq!(pool.status(), PoolStatus::Closed);
        assert_eq!(registry.get(id).unwrap_err().code(), "POOL_NOT_FOUND");
        registry.unregister(id).await.unwrap();

        assert_eq!(events.recv().await.unwrap().pool_id, Some(id));
        // Name can be reused
        registry.register(local("p1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_discover_registers_skips_and_reports_failures() {
        let registry = registry();
        registry.register(local("existing")).await.unwrap();

        let pinned = PoolId::new();
        let source = StaticSource::new("catalog")
            .with_descriptor(PoolDescriptor::new(local("existing")))
            .with_descriptor(PoolDescriptor::new(local("fresh")).with_id(pinned))
            .with_descriptor(PoolDescriptor::new(PoolConfig::new(
                "remote",
                BackendType::Delegated,
            )));

        let dry = registry.discover(&source, false).await.unwrap();
        assert_eq!(dry.candidates.len(), 3);
        assert!(dry.registered.is_empty());
        assert_eq!(dry.skipped, vec!["existing"]);

        let report = registry.discover(&source, true).await.unwrap();
        assert_eq!(report.registered, vec![DiscoveredPool {
            name: "fresh".into(),
            pool_id: pinned,
        }]);
        assert_eq!(report.skipped, vec!["existing"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].code, "INVALID_CONFIG");
        assert_eq!(registry.get(pinned).unwrap().name(), "fresh");
    }
}
