// Process-scoped wiring: builds the cache, registry, event bus and engine from
// configuration, runs their background tasks and tears everything down.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use mcpd_common::protocol::events::EventPayload;
use mcpd_common::types::{InboundRequest, Partition};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CascadingPurger, InvalidationFailure, TtlCache};
use crate::config::EngineConfig;
use crate::engine::{CallHandle, Engine, EngineError};
use crate::entities::{EntityService, ImportStats, McpConfiguration, MutationObserver};
use crate::events::EventBus;
use crate::registry::{ClassCatalog, ModuleRegistry};
use crate::rpc::methods::RpcServerState;
use crate::store::{BlobStore, EntityStore, InMemoryEntityStore, LocalBlobStore};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// External systems the core runs against.
pub struct Collaborators {
    pub store: Arc<dyn EntityStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub catalog: ClassCatalog,
}

pub struct EngineRuntime {
    config: EngineConfig,
    cache: Arc<TtlCache>,
    entities: Arc<EntityService>,
    registry: Arc<ModuleRegistry>,
    bus: Arc<EventBus>,
    engine: Arc<Engine>,
    shutdown_tx: broadcast::Sender<()>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl EngineRuntime {
    /// Wire the core together. Must be called from within a tokio runtime.
    pub fn start(config: &EngineConfig, collaborators: Collaborators) -> Result<Self> {
        let Collaborators { store, blobs, catalog } = collaborators;

        let bundle_root = config.registry.bundle_root();
        std::fs::create_dir_all(&bundle_root)
            .with_context(|| format!("failed to create bundle root {}", bundle_root.display()))?;

        let (graph, rejected) = config.cache.relationship_graph();
        for rule in rejected {
            warn!(parent = %rule.parent, child = %rule.child, "ignoring relationship override with no matching edge");
        }
        let cache = Arc::new(TtlCache::new(config.cache.default_ttl()));
        let purger = Arc::new(
            CascadingPurger::new(cache.clone(), store.clone(), graph)
                .with_max_depth(config.cache.max_cascade_depth)
                .with_retry(config.cache.retry_policy()),
        );
        let entities = Arc::new(EntityService::new(store, purger.clone()));

        let registry = Arc::new(ModuleRegistry::new(entities.clone(), blobs.clone(), catalog, bundle_root));
        let observer: Arc<dyn MutationObserver> = registry.clone();
        entities.add_observer(Arc::downgrade(&observer));

        let bus = Arc::new(EventBus::new(config.events.bus_settings()));
        let engine =
            Arc::new(Engine::start(config.engine.clone(), registry.clone(), entities.clone(), bus.clone(), blobs));

        let (shutdown_tx, _) = broadcast::channel(4);
        let background = vec![
            tokio::spawn(forward_alerts(purger, bus.clone(), shutdown_tx.subscribe())),
            tokio::spawn(sweep(cache.clone(), bus.clone(), config.events.idle_partition_ttl(), shutdown_tx.subscribe())),
        ];

        info!(bundle_root = %registry.bundle_root().display(), "engine runtime started");
        Ok(Self {
            config: config.clone(),
            cache,
            entities,
            registry,
            bus,
            engine,
            shutdown_tx,
            background: Mutex::new(background),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<TtlCache> {
        &self.cache
    }

    pub fn entities(&self) -> &Arc<EntityService> {
        &self.entities
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn rpc_state(&self, default_partition: Partition) -> RpcServerState {
        RpcServerState::new(self.engine.clone(), self.entities.clone(), default_partition)
    }

    pub async fn dispatch(&self, request: InboundRequest) -> Result<CallHandle, EngineError> {
        self.engine.dispatch(request).await
    }

    /// Import a JSON configuration document into `partition`.
    pub async fn import_configuration_file(&self, partition: &Partition, path: &Path) -> Result<ImportStats> {
        let raw = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read configuration {}", path.display()))?;
        let document: McpConfiguration = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse configuration {}", path.display()))?;
        let stats = self
            .entities
            .import_configuration(partition, document, "bootstrap")
            .await
            .context("failed to import configuration")?;
        info!(partition = %partition, path = %path.display(), ?stats, "imported configuration");
        Ok(stats)
    }

    /// Stop background tasks and drain the engine.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        self.engine.shutdown().await;

        let tasks = std::mem::take(&mut *self.background.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(error) = task.await {
                warn!(error = %error, "background task ended abnormally");
            }
        }
        info!("engine runtime stopped");
    }
}

/// Republish invalidation failures as partition notifications for operators.
async fn forward_alerts(purger: Arc<CascadingPurger>, bus: Arc<EventBus>, mut shutdown: broadcast::Receiver<()>) {
    let mut alerts = purger.subscribe_alerts();
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            alert = alerts.recv() => match alert {
                Ok(alert) => publish_alert(&bus, &alert),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "invalidation alerts dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

fn publish_alert(bus: &EventBus, alert: &InvalidationFailure) {
    bus.publish(
        &alert.partition,
        EventPayload::Notification {
            data: json!({
                "kind": "invalidation_failure",
                "parent": alert.parent.as_str(),
                "child": alert.child.as_str(),
                "parent_value": alert.parent_value,
                "attempts": alert.attempts,
                "message": alert.message,
            }),
        },
    );
}

/// Periodic housekeeping: expired cache entries and idle bus partitions.
async fn sweep(cache: Arc<TtlCache>, bus: Arc<EventBus>, idle_partition_ttl: Duration, mut shutdown: broadcast::Receiver<()>) {
    let period = (cache.default_ttl() / 2).max(MIN_SWEEP_INTERVAL);
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                let swept = cache.sweep_expired();
                if swept > 0 {
                    debug!(swept, "swept expired cache entries");
                }
                let pruned = bus.prune_idle(idle_partition_ttl);
                if pruned > 0 {
                    debug!(pruned, "pruned idle event partitions");
                }
            }
        }
    }
}

/// Standalone mode: in-memory entities, local blob directory, optional
/// bootstrap import, runs until ctrl-c.
pub async fn run_standalone(config_path: Option<&Path>) -> Result<()> {
    let config = match config_path {
        Some(path) => {
            EngineConfig::load_from(path).with_context(|| format!("failed to load config {}", path.display()))?
        }
        None => EngineConfig::load(),
    };

    let blob_root = config.registry.blob_root();
    std::fs::create_dir_all(&blob_root)
        .with_context(|| format!("failed to create blob root {}", blob_root.display()))?;
    let collaborators = Collaborators {
        store: Arc::new(InMemoryEntityStore::new()),
        blobs: Arc::new(LocalBlobStore::new(blob_root)),
        catalog: ClassCatalog::new(),
    };
    let runtime = EngineRuntime::start(&config, collaborators)?;

    if let Some(path) = &config.bootstrap.configuration_path {
        let partition = Partition::new(config.bootstrap.partition.as_str());
        runtime.import_configuration_file(&partition, path).await?;
    }

    info!("standalone daemon started");
    let waited = tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c");
    runtime.shutdown().await;
    waited
}
