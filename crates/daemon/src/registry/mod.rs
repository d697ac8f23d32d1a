// Module registry: resolves a function name to a materialized unit.
//
// Units are kept in an arena keyed by (partition, module, class) and handed
// out as opaque handles. A miss fetches module metadata, materializes the
// bundle (single-flighted per partition/module/version), instantiates the
// class with its setting and registers the handle for reuse.

pub mod bundle;
pub mod unit;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use mcpd_common::types::{JsonMap, McpFunction, McpModule, Partition};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::cache::EntityKeys;
use crate::entities::{EntityService, MutationObserver};
use crate::store::{BlobStore, EntityKind, StoreError};

use self::bundle::{bundle_dir, bundle_version, extract, load_extracted, BundleError, MaterializedBundle};
pub use self::unit::{
    CancelSignal, ClassCatalog, InvocationContext, McpUnit, ProgressFn, UnitError, UnitFactory, UnitSpec,
};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("function `{name}` not found")]
    FunctionNotFound { name: String },

    #[error("function `{name}` is not bound to a module class")]
    NotModuleBacked { name: String },

    #[error("module `{module_name}` not found")]
    ModuleNotFound { module_name: String },

    #[error("module `{module_name}` has no source bundle")]
    MissingSource { module_name: String },

    #[error("class `{class_name}` not found in module `{module_name}`")]
    ClassNotFound { module_name: String, class_name: String },

    #[error("setting `{setting_id}` not found")]
    SettingNotFound { setting_id: String },

    #[error("failed to fetch bundle `{uri}`: {message}")]
    BundleUnavailable { uri: String, message: String },

    #[error("failed to extract bundle for module `{module_name}`: {message}")]
    Extraction { module_name: String, message: String },

    #[error("failed to instantiate `{class_name}`: {message}")]
    Instantiation { class_name: String, message: String },

    #[error("materialization of module `{module_name}` was interrupted")]
    Interrupted { module_name: String },

    #[error("entity store error: {0}")]
    Store(String),
}

impl From<StoreError> for ResolutionError {
    fn from(error: StoreError) -> Self {
        Self::Store(error.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct UnitKey {
    partition: Partition,
    module_name: String,
    class_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BundleKey {
    partition: Partition,
    module_name: String,
    version: String,
}

/// Opaque handle to a registered unit.
#[derive(Clone)]
pub struct UnitHandle {
    id: u64,
    module_name: String,
    class_name: String,
    setting_id: Option<String>,
    bundle_version: String,
    unit: Arc<dyn McpUnit>,
}

impl fmt::Debug for UnitHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitHandle")
            .field("id", &self.id)
            .field("module_name", &self.module_name)
            .field("class_name", &self.class_name)
            .field("bundle_version", &self.bundle_version)
            .finish()
    }
}

impl UnitHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn bundle_version(&self) -> &str {
        &self.bundle_version
    }

    pub fn unit(&self) -> Arc<dyn McpUnit> {
        self.unit.clone()
    }
}

/// A function together with the unit that serves it.
#[derive(Debug, Clone)]
pub struct ResolvedUnit {
    pub function: McpFunction,
    pub handle: UnitHandle,
}

type Flight = watch::Receiver<Option<Result<Arc<MaterializedBundle>, ResolutionError>>>;

pub struct ModuleRegistry {
    entities: Arc<EntityService>,
    blobs: Arc<dyn BlobStore>,
    catalog: ClassCatalog,
    bundle_root: PathBuf,
    units: RwLock<HashMap<UnitKey, UnitHandle>>,
    bundles: RwLock<HashMap<BundleKey, Arc<MaterializedBundle>>>,
    inflight: Mutex<HashMap<BundleKey, Flight>>,
    materializations: AtomicUsize,
    next_unit_id: AtomicU64,
}

impl ModuleRegistry {
    pub fn new(
        entities: Arc<EntityService>,
        blobs: Arc<dyn BlobStore>,
        catalog: ClassCatalog,
        bundle_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            entities,
            blobs,
            catalog,
            bundle_root: bundle_root.into(),
            units: RwLock::new(HashMap::new()),
            bundles: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            materializations: AtomicUsize::new(0),
            next_unit_id: AtomicU64::new(1),
        }
    }

    pub fn bundle_root(&self) -> &Path {
        &self.bundle_root
    }

    /// Bundle materializations started since the registry was created.
    pub fn materializations(&self) -> usize {
        self.materializations.load(Ordering::SeqCst)
    }

    pub fn unit_count(&self) -> usize {
        self.units.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Resolve `name` in `partition` to a function and its unit.
    pub async fn resolve(&self, partition: &Partition, name: &str) -> Result<ResolvedUnit, ResolutionError> {
        let span = info_span!("registry.resolve", partition = %partition, name = %name);
        self.resolve_inner(partition, name).instrument(span).await
    }

    async fn resolve_inner(&self, partition: &Partition, name: &str) -> Result<ResolvedUnit, ResolutionError> {
        let function = self
            .entities
            .function(partition, name)
            .await?
            .ok_or_else(|| ResolutionError::FunctionNotFound { name: name.to_string() })?;
        let (module_name, class_name) = function
            .binding()
            .map(|(m, c)| (m.to_string(), c.to_string()))
            .ok_or_else(|| ResolutionError::NotModuleBacked { name: name.to_string() })?;

        let key = UnitKey { partition: partition.clone(), module_name: module_name.clone(), class_name: class_name.clone() };
        if let Some(handle) = self.units.read().unwrap_or_else(PoisonError::into_inner).get(&key).cloned() {
            debug!(unit = handle.id, "unit registry hit");
            return Ok(ResolvedUnit { function, handle });
        }

        let module = self
            .entities
            .module(partition, &module_name)
            .await?
            .ok_or_else(|| ResolutionError::ModuleNotFound { module_name: module_name.clone() })?;
        let class = module.class(&class_name).ok_or_else(|| ResolutionError::ClassNotFound {
            module_name: module_name.clone(),
            class_name: class_name.clone(),
        })?;
        let setting_id = class.setting_id.clone();
        let setting = match &setting_id {
            Some(id) => {
                self.entities
                    .setting(partition, id)
                    .await?
                    .ok_or_else(|| ResolutionError::SettingNotFound { setting_id: id.clone() })?
                    .setting
            }
            None => JsonMap::new(),
        };

        let bundle = self.materialize(partition, &module).await?;
        let class_missing = || ResolutionError::ClassNotFound { module_name: module_name.clone(), class_name: class_name.clone() };
        if !bundle.classes.contains(&class_name) {
            return Err(class_missing());
        }
        let factory = self.catalog.get(&bundle.package_name, &class_name).ok_or_else(class_missing)?;
        let spec = UnitSpec {
            partition,
            module_name: &module_name,
            package_name: &bundle.package_name,
            class_name: &class_name,
            setting: &setting,
            bundle_dir: &bundle.dir,
        };
        let unit = factory(&spec).map_err(|error| ResolutionError::Instantiation {
            class_name: class_name.clone(),
            message: error.to_string(),
        })?;

        let candidate = UnitHandle {
            id: self.next_unit_id.fetch_add(1, Ordering::SeqCst),
            module_name,
            class_name,
            setting_id,
            bundle_version: bundle.version.clone(),
            unit,
        };
        let handle = {
            let mut units = self.units.write().unwrap_or_else(PoisonError::into_inner);
            units.entry(key).or_insert(candidate).clone()
        };
        info!(unit = handle.id, module_name = %handle.module_name, class_name = %handle.class_name, "registered unit");
        Ok(ResolvedUnit { function, handle })
    }

    async fn materialize(&self, partition: &Partition, module: &McpModule) -> Result<Arc<MaterializedBundle>, ResolutionError> {
        let source = module
            .source_uri
            .as_deref()
            .filter(|uri| !uri.is_empty())
            .ok_or_else(|| ResolutionError::MissingSource { module_name: module.module_name.clone() })?;
        let key = BundleKey {
            partition: partition.clone(),
            module_name: module.module_name.clone(),
            version: bundle_version(source, module.updated_at),
        };

        let leader = {
            let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(bundle) = self.cached_bundle(&key) {
                return Ok(bundle);
            }
            match inflight.get(&key) {
                Some(flight) => Err(flight.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    inflight.insert(key.clone(), rx);
                    Ok(tx)
                }
            }
        };

        match leader {
            Ok(tx) => {
                let guard = FlightGuard { registry: self, key: key.clone(), tx: Some(tx) };
                let outcome = self.load_bundle(&key, source).await;
                guard.finish(outcome)
            }
            Err(mut flight) => {
                debug!(module_name = %key.module_name, "joining in-flight materialization");
                let interrupted = || ResolutionError::Interrupted { module_name: key.module_name.clone() };
                match flight.wait_for(Option::is_some).await {
                    Ok(outcome) => outcome.clone().unwrap_or_else(|| Err(interrupted())),
                    Err(_) => Err(interrupted()),
                }
            }
        }
    }

    fn cached_bundle(&self, key: &BundleKey) -> Option<Arc<MaterializedBundle>> {
        self.bundles.read().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }

    async fn load_bundle(&self, key: &BundleKey, source: &str) -> Result<Arc<MaterializedBundle>, ResolutionError> {
        self.materializations.fetch_add(1, Ordering::SeqCst);
        let extraction_error = |message: String| ResolutionError::Extraction { module_name: key.module_name.clone(), message };

        let dir = bundle_dir(&self.bundle_root, &key.partition, &key.module_name, &key.version)
            .map_err(|error| extraction_error(error.to_string()))?;

        let probe = dir.clone();
        let existing = tokio::task::spawn_blocking(move || load_extracted(&probe))
            .await
            .map_err(|error| extraction_error(error.to_string()))?
            .map_err(|error| extraction_error(error.to_string()))?;
        if let Some(bundle) = existing {
            debug!(dir = %bundle.dir.display(), "reusing extracted bundle");
            return Ok(Arc::new(bundle));
        }

        let bytes = self.blobs.fetch(source).await.map_err(|error| ResolutionError::BundleUnavailable {
            uri: source.to_string(),
            message: error.to_string(),
        })?;
        let version = key.version.clone();
        let extracted: Result<MaterializedBundle, BundleError> =
            tokio::task::spawn_blocking(move || extract(&bytes, &dir, &version))
                .await
                .map_err(|error| extraction_error(error.to_string()))?;
        let bundle = extracted.map_err(|error| extraction_error(error.to_string()))?;
        info!(module_name = %key.module_name, version = %key.version, dir = %bundle.dir.display(), "materialized bundle");
        Ok(Arc::new(bundle))
    }

    /// Drop every unit and bundle of a module so the next resolve rebuilds them.
    pub fn evict_module(&self, partition: &Partition, module_name: &str) -> usize {
        let mut units = self.units.write().unwrap_or_else(PoisonError::into_inner);
        let before = units.len();
        units.retain(|key, _| !(key.partition == *partition && key.module_name == module_name));
        let evicted = before - units.len();
        drop(units);

        self.bundles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|key, _| !(key.partition == *partition && key.module_name == module_name));
        if evicted > 0 {
            info!(partition = %partition, module_name, evicted, "evicted module units");
        }
        evicted
    }

    /// Drop units instantiated with `setting_id`.
    pub fn evict_setting(&self, partition: &Partition, setting_id: &str) -> usize {
        let mut units = self.units.write().unwrap_or_else(PoisonError::into_inner);
        let before = units.len();
        units.retain(|key, handle| !(key.partition == *partition && handle.setting_id.as_deref() == Some(setting_id)));
        let evicted = before - units.len();
        if evicted > 0 {
            info!(partition = %partition, setting_id, evicted, "evicted units bound to setting");
        }
        evicted
    }
}

impl MutationObserver for ModuleRegistry {
    fn entity_changed(&self, partition: &Partition, kind: EntityKind, keys: &EntityKeys) {
        match kind {
            EntityKind::Module => {
                if let Some(module_name) = keys.get("module_name") {
                    self.evict_module(partition, module_name);
                }
            }
            EntityKind::Setting => {
                if let Some(setting_id) = keys.get("setting_id") {
                    self.evict_setting(partition, setting_id);
                }
            }
            _ => {}
        }
    }
}

/// Publishes the leader's outcome to followers. Dropped without `finish`
/// (the leader was cancelled), it releases followers with `Interrupted`.
struct FlightGuard<'a> {
    registry: &'a ModuleRegistry,
    key: BundleKey,
    tx: Option<watch::Sender<Option<Result<Arc<MaterializedBundle>, ResolutionError>>>>,
}

impl FlightGuard<'_> {
    fn finish(mut self, outcome: Result<Arc<MaterializedBundle>, ResolutionError>) -> Result<Arc<MaterializedBundle>, ResolutionError> {
        if let Ok(bundle) = &outcome {
            self.registry
                .bundles
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(self.key.clone(), bundle.clone());
        }
        self.release(outcome.clone());
        outcome
    }

    fn release(&mut self, outcome: Result<Arc<MaterializedBundle>, ResolutionError>) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        self.registry.inflight.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.key);
        let _ = tx.send(Some(outcome));
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            warn!(module_name = %self.key.module_name, "materialization abandoned");
            let interrupted = Err(ResolutionError::Interrupted { module_name: self.key.module_name.clone() });
            self.release(interrupted);
        }
    }
}
