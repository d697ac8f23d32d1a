// Entity service: cached read-through access to modules, functions, settings
// and calls, and the mutations that keep the cache coherent.
//
// Every mutation writes the store first, then runs a cascading purge and
// notifies observers (the module registry) before returning.

pub mod configuration;

use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use mcpd_common::types::{McpFunction, McpFunctionCall, McpModule, McpSetting, McpType, Partition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CascadingPurger, EntityKeys, PurgeReport, Tags, TtlCache};
use crate::entity_keys;
use crate::store::{decode, get_record, put_record, EntityKind, EntityStore, StoreError};

pub use self::configuration::{FunctionDefinition, ImportStats, McpConfiguration, ModuleDefinition, ModuleLink};

const CONFIGURATION_KEY: &str = "configuration";

/// Told about every entity mutation after the cache has been purged.
pub trait MutationObserver: Send + Sync {
    fn entity_changed(&self, partition: &Partition, kind: EntityKind, keys: &EntityKeys);
}

/// Result of a delete: whether a record existed, and what was purged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Deleted {
    pub existed: bool,
    pub report: PurgeReport,
}

pub struct EntityService {
    store: Arc<dyn EntityStore>,
    cache: Arc<TtlCache>,
    purger: Arc<CascadingPurger>,
    observers: RwLock<Vec<Weak<dyn MutationObserver>>>,
}

impl EntityService {
    pub fn new(store: Arc<dyn EntityStore>, purger: Arc<CascadingPurger>) -> Self {
        let cache = purger.cache().clone();
        Self { store, cache, purger, observers: RwLock::new(Vec::new()) }
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<TtlCache> {
        &self.cache
    }

    pub fn purger(&self) -> &Arc<CascadingPurger> {
        &self.purger
    }

    pub fn add_observer(&self, observer: Weak<dyn MutationObserver>) {
        self.observers.write().unwrap_or_else(PoisonError::into_inner).push(observer);
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub async fn module(&self, partition: &Partition, module_name: &str) -> Result<Option<McpModule>, StoreError> {
        self.read_through(EntityKind::Module, partition, module_name, module_tags, || {
            get_record(self.store.as_ref(), partition, EntityKind::Module, module_name)
        })
        .await
    }

    pub async fn function(&self, partition: &Partition, name: &str) -> Result<Option<McpFunction>, StoreError> {
        self.read_through(EntityKind::Function, partition, name, function_tags, || {
            get_record(self.store.as_ref(), partition, EntityKind::Function, name)
        })
        .await
    }

    pub async fn setting(&self, partition: &Partition, setting_id: &str) -> Result<Option<McpSetting>, StoreError> {
        self.read_through(EntityKind::Setting, partition, setting_id, setting_tags, || {
            get_record(self.store.as_ref(), partition, EntityKind::Setting, setting_id)
        })
        .await
    }

    pub async fn call(&self, partition: &Partition, call_uuid: Uuid) -> Result<Option<McpFunctionCall>, StoreError> {
        let key = call_uuid.to_string();
        self.read_through(EntityKind::FunctionCall, partition, &key, call_tags, || {
            get_record(self.store.as_ref(), partition, EntityKind::FunctionCall, &key)
        })
        .await
    }

    /// Calls of one function, oldest first. Cached as the function's call list.
    pub async fn calls_for_function(&self, partition: &Partition, name: &str) -> Result<Vec<McpFunctionCall>, StoreError> {
        let key = format!("calls:{name}");
        let tags = |_: &Vec<McpFunctionCall>| Tags::new().with("name", name);
        let calls = self
            .read_through(EntityKind::FunctionCall, partition, &key, tags, || async {
                let records = self.store.query_by_index(partition, EntityKind::FunctionCall, "name", name).await?;
                let mut calls = records
                    .into_iter()
                    .map(|record| decode::<McpFunctionCall>(EntityKind::FunctionCall, name, record))
                    .collect::<Result<Vec<_>, _>>()?;
                calls.sort_by_key(|call| call.created_at);
                Ok::<_, StoreError>(Some(calls))
            })
            .await?;
        Ok(calls.unwrap_or_default())
    }

    /// Names of the functions bound to a module. Cached on the module side,
    /// so it is a parent list a function change may invalidate.
    pub async fn functions_for_module(&self, partition: &Partition, module_name: &str) -> Result<Vec<String>, StoreError> {
        let key = format!("functions:{module_name}");
        let tags = |_: &Vec<String>| Tags::new().with("module_name", module_name);
        let names = self
            .read_through(EntityKind::Module, partition, &key, tags, || async {
                let records =
                    self.store.query_by_index(partition, EntityKind::Function, "module_name", module_name).await?;
                let names = records
                    .iter()
                    .filter_map(|record| record.get("name").and_then(|v| v.as_str()).map(str::to_string))
                    .collect::<Vec<_>>();
                Ok::<_, StoreError>(Some(names))
            })
            .await?;
        Ok(names.unwrap_or_default())
    }

    /// Functions in a partition, optionally narrowed to one MCP type. Not cached.
    pub async fn list_functions(&self, partition: &Partition, mcp_type: Option<McpType>) -> Result<Vec<McpFunction>, StoreError> {
        let records = match mcp_type {
            Some(t) => self.store.query_by_index(partition, EntityKind::Function, "mcp_type", t.as_str()).await?,
            None => self.store.list(partition, EntityKind::Function).await?,
        };
        records
            .into_iter()
            .map(|record| {
                let key = record.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                decode(EntityKind::Function, &key, record)
            })
            .collect()
    }

    pub async fn list_modules(&self, partition: &Partition) -> Result<Vec<McpModule>, StoreError> {
        let records = self.store.list(partition, EntityKind::Module).await?;
        records
            .into_iter()
            .map(|record| {
                let key = record.get("module_name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                decode(EntityKind::Module, &key, record)
            })
            .collect()
    }

    /// Assembled MCP configuration for a partition.
    pub async fn configuration(&self, partition: &Partition) -> Result<McpConfiguration, StoreError> {
        let tags = |_: &McpConfiguration| Tags::new().with("partition", partition.as_str());
        let assembled = self
            .read_through(EntityKind::Configuration, partition, CONFIGURATION_KEY, tags, || async {
                configuration::assemble(self, partition).await.map(Some)
            })
            .await?;
        Ok(assembled.unwrap_or_default())
    }

    async fn read_through<T, L, F, Fut>(
        &self,
        kind: EntityKind,
        partition: &Partition,
        key: &str,
        tags: L,
        load: F,
    ) -> Result<Option<T>, StoreError>
    where
        T: Serialize + DeserializeOwned,
        L: FnOnce(&T) -> Tags,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, StoreError>>,
    {
        if let Some(value) = self.cache.get(kind, partition, key) {
            match serde_json::from_value(value) {
                Ok(entity) => {
                    debug!(namespace = %kind, partition = %partition, key, "cache hit");
                    return Ok(Some(entity));
                }
                Err(error) => {
                    warn!(namespace = %kind, key, error = %error, "dropping undecodable cache entry");
                    self.cache.purge(kind, partition, key);
                }
            }
        }

        debug!(namespace = %kind, partition = %partition, key, "cache miss");
        let generation = self.cache.generation(kind, partition);
        let loaded = load().await?;
        if let Some(entity) = &loaded {
            match serde_json::to_value(entity) {
                Ok(value) => {
                    self.cache.put_if_current(kind, partition, key, value, tags(entity), generation);
                }
                Err(error) => warn!(namespace = %kind, key, error = %error, "entity not cacheable"),
            }
        }
        Ok(loaded)
    }

    // ── Mutations ──────────────────────────────────────────────────

    pub async fn upsert_module(&self, module: McpModule) -> Result<PurgeReport, StoreError> {
        let partition = module.partition.clone();
        put_record(self.store.as_ref(), &partition, EntityKind::Module, &module.module_name, &module).await?;
        let keys = entity_keys! { "module_name" => &module.module_name };
        let report = self.invalidate(EntityKind::Module, &partition, keys).await;
        info!(partition = %partition, module_name = %module.module_name, purged = report.total(), "upserted module");
        Ok(report)
    }

    pub async fn delete_module(&self, partition: &Partition, module_name: &str) -> Result<Deleted, StoreError> {
        let existed = self.store.delete(partition, EntityKind::Module, module_name).await?;
        let report = self.invalidate(EntityKind::Module, partition, entity_keys! { "module_name" => module_name }).await;
        info!(partition = %partition, module_name, existed, "deleted module");
        Ok(Deleted { existed, report })
    }

    pub async fn upsert_function(&self, function: McpFunction) -> Result<PurgeReport, StoreError> {
        let partition = function.partition.clone();
        let previous: Option<McpFunction> =
            get_record(self.store.as_ref(), &partition, EntityKind::Function, &function.name).await?;
        put_record(self.store.as_ref(), &partition, EntityKind::Function, &function.name, &function).await?;

        let mut report = self.invalidate(EntityKind::Function, &partition, function_keys(&function)).await;
        if let Some(previous) = previous.filter(|p| p.module_name != function.module_name) {
            // Rebinding also stales the old module's function list.
            report.merge(self.invalidate(EntityKind::Function, &partition, function_keys(&previous)).await);
        }
        info!(partition = %partition, name = %function.name, purged = report.total(), "upserted function");
        Ok(report)
    }

    pub async fn delete_function(&self, partition: &Partition, name: &str) -> Result<Deleted, StoreError> {
        let previous: Option<McpFunction> = get_record(self.store.as_ref(), partition, EntityKind::Function, name).await?;
        let existed = self.store.delete(partition, EntityKind::Function, name).await?;
        let keys = previous.as_ref().map(function_keys).unwrap_or_else(|| entity_keys! { "name" => name });
        let report = self.invalidate(EntityKind::Function, partition, keys).await;
        info!(partition = %partition, name, existed, "deleted function");
        Ok(Deleted { existed, report })
    }

    pub async fn upsert_setting(&self, setting: McpSetting) -> Result<PurgeReport, StoreError> {
        let partition = setting.partition.clone();
        put_record(self.store.as_ref(), &partition, EntityKind::Setting, &setting.setting_id, &setting).await?;
        let keys = entity_keys! { "setting_id" => &setting.setting_id };
        let report = self.invalidate(EntityKind::Setting, &partition, keys).await;
        info!(partition = %partition, setting_id = %setting.setting_id, purged = report.total(), "upserted setting");
        Ok(report)
    }

    pub async fn delete_setting(&self, partition: &Partition, setting_id: &str) -> Result<Deleted, StoreError> {
        let existed = self.store.delete(partition, EntityKind::Setting, setting_id).await?;
        let report = self.invalidate(EntityKind::Setting, partition, entity_keys! { "setting_id" => setting_id }).await;
        info!(partition = %partition, setting_id, existed, "deleted setting");
        Ok(Deleted { existed, report })
    }

    /// Persist a call record and drop its cached copies, including the
    /// function's call list.
    pub async fn write_call(&self, call: &McpFunctionCall) -> Result<PurgeReport, StoreError> {
        let key = call.call_uuid.to_string();
        put_record(self.store.as_ref(), &call.partition, EntityKind::FunctionCall, &key, call).await?;
        let keys = entity_keys! { "call_uuid" => &key, "name" => &call.name };
        Ok(self.invalidate(EntityKind::FunctionCall, &call.partition, keys).await)
    }

    async fn invalidate(&self, kind: EntityKind, partition: &Partition, keys: EntityKeys) -> PurgeReport {
        let report = self.purger.purge_cascading(kind, partition, keys.clone()).await;
        self.notify(partition, kind, &keys);
        report
    }

    fn notify(&self, partition: &Partition, kind: EntityKind, keys: &EntityKeys) {
        let observers: Vec<_> = {
            let mut observers = self.observers.write().unwrap_or_else(PoisonError::into_inner);
            observers.retain(|weak| weak.strong_count() > 0);
            observers.iter().filter_map(Weak::upgrade).collect()
        };
        for observer in observers {
            observer.entity_changed(partition, kind, keys);
        }
    }
}

// ── Tags ───────────────────────────────────────────────────────────

fn module_tags(module: &McpModule) -> Tags {
    Tags::new().with("module_name", &module.module_name).with_all("classes.setting_id", module.setting_ids())
}

fn function_tags(function: &McpFunction) -> Tags {
    let tags = Tags::new().with("name", &function.name);
    match &function.module_name {
        Some(module_name) => tags.with("module_name", module_name),
        None => tags,
    }
}

fn setting_tags(setting: &McpSetting) -> Tags {
    Tags::new().with("setting_id", &setting.setting_id)
}

fn call_tags(call: &McpFunctionCall) -> Tags {
    Tags::new().with("call_uuid", call.call_uuid.to_string()).with("name", &call.name)
}

fn function_keys(function: &McpFunction) -> EntityKeys {
    let mut keys = entity_keys! { "name" => &function.name };
    if let Some(module_name) = &function.module_name {
        keys.insert("module_name".to_string(), module_name.clone());
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RelationshipGraph;
    use crate::store::InMemoryEntityStore;
    use chrono::Utc;
    use mcpd_common::types::ModuleClass;
    use std::sync::Mutex;
    use std::time::Duration;

    fn service() -> (Arc<InMemoryEntityStore>, EntityService) {
        let store = Arc::new(InMemoryEntityStore::new());
        let cache = Arc::new(TtlCache::new(Duration::from_secs(60)));
        let purger = Arc::new(CascadingPurger::new(cache, store.clone(), RelationshipGraph::default()));
        let service = EntityService::new(store.clone(), purger);
        (store, service)
    }

    fn function(name: &str, module: &str) -> McpFunction {
        McpFunction {
            partition: Partition::new("t1"),
            name: name.into(),
            mcp_type: McpType::Tool,
            description: None,
            module_name: Some(module.into()),
            class_name: Some("Calculator".into()),
            function_name: None,
            is_async: false,
            return_type: "text".into(),
            schema: Default::default(),
            updated_by: "test".into(),
            updated_at: Utc::now(),
        }
    }

    fn module(name: &str, setting_id: &str) -> McpModule {
        McpModule {
            partition: Partition::new("t1"),
            module_name: name.into(),
            package_name: format!("{name}_pkg"),
            classes: vec![ModuleClass { class_name: "Calculator".into(), setting_id: Some(setting_id.into()) }],
            source_uri: Some(format!("mem://{name}.zip")),
            updated_by: "test".into(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn reads_are_cached_until_a_mutation() {
        let (store, service) = service();
        let t1 = Partition::new("t1");
        service.upsert_function(function("F", "M")).await.unwrap();

        let first = service.function(&t1, "F").await.unwrap().expect("function should exist");
        assert!(service.cache().contains(EntityKind::Function, &t1, "F"));

        // A write behind the service's back is invisible until purged.
        let mut changed = first.clone();
        changed.description = Some("changed".into());
        put_record(store.as_ref(), &t1, EntityKind::Function, "F", &changed).await.unwrap();
        assert_eq!(service.function(&t1, "F").await.unwrap().unwrap().description, None);

        service.upsert_function(changed).await.unwrap();
        assert_eq!(service.function(&t1, "F").await.unwrap().unwrap().description.as_deref(), Some("changed"));
    }

    #[tokio::test]
    async fn misses_are_not_cached() {
        let (_, service) = service();
        let t1 = Partition::new("t1");
        assert!(service.module(&t1, "ghost").await.unwrap().is_none());
        assert!(!service.cache().contains(EntityKind::Module, &t1, "ghost"));
    }

    #[tokio::test]
    async fn rebinding_a_function_stales_both_module_lists() {
        let (_, service) = service();
        let t1 = Partition::new("t1");
        service.upsert_function(function("F", "M")).await.unwrap();
        assert_eq!(service.functions_for_module(&t1, "M").await.unwrap(), vec!["F"]);
        assert!(service.functions_for_module(&t1, "N").await.unwrap().is_empty());

        service.upsert_function(function("F", "N")).await.unwrap();

        assert!(service.functions_for_module(&t1, "M").await.unwrap().is_empty());
        assert_eq!(service.functions_for_module(&t1, "N").await.unwrap(), vec!["F"]);
    }

    #[tokio::test]
    async fn setting_change_purges_modules_that_reference_it() {
        let (_, service) = service();
        let t1 = Partition::new("t1");
        service.upsert_module(module("math", "s1")).await.unwrap();
        service.upsert_module(module("text", "s2")).await.unwrap();
        service.module(&t1, "math").await.unwrap();
        service.module(&t1, "text").await.unwrap();

        let report = service
            .upsert_setting(McpSetting {
                partition: t1.clone(),
                setting_id: "s1".into(),
                setting: Default::default(),
                updated_by: "test".into(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        assert!(report.purged_for(EntityKind::Module) >= 1);
        assert!(!service.cache().contains(EntityKind::Module, &t1, "math"));
        assert!(service.cache().contains(EntityKind::Module, &t1, "text"));
    }

    #[tokio::test]
    async fn observers_hear_about_mutations() {
        struct Recorder(Mutex<Vec<(EntityKind, EntityKeys)>>);
        impl MutationObserver for Recorder {
            fn entity_changed(&self, _: &Partition, kind: EntityKind, keys: &EntityKeys) {
                self.0.lock().unwrap().push((kind, keys.clone()));
            }
        }

        let (_, service) = service();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let weak: Weak<dyn MutationObserver> = Arc::downgrade(&recorder) as Weak<dyn MutationObserver>;
        service.add_observer(weak);

        service.delete_module(&Partition::new("t1"), "math").await.unwrap();

        let seen = recorder.0.lock().unwrap();
        assert_eq!(seen.as_slice(), &[(EntityKind::Module, entity_keys! { "module_name" => "math" })]);
    }

    #[tokio::test]
    async fn call_list_is_refreshed_by_call_writes() {
        let (_, service) = service();
        let t1 = Partition::new("t1");
        assert!(service.calls_for_function(&t1, "F").await.unwrap().is_empty());

        let call = McpFunctionCall::new(t1.clone(), "F", McpType::Tool, Default::default());
        service.write_call(&call).await.unwrap();

        let calls = service.calls_for_function(&t1, "F").await.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].call_uuid, call.call_uuid);
        assert_eq!(service.call(&t1, call.call_uuid).await.unwrap(), Some(call));
    }
}
