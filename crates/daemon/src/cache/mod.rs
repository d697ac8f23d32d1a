// TTL cache for entity reads, partition-scoped, with entity tags that drive
// cascading invalidation.

pub mod purge;
pub mod relations;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use mcpd_common::types::Partition;
use serde_json::Value;

use crate::store::EntityKind;

pub use purge::{CascadingPurger, InvalidationFailure, PurgeReport, RetryPolicy};
pub use relations::{Link, RelationshipGraph, Relationship};

/// Field → value selectors identifying the entities a purge targets.
/// An empty map is a wildcard over the whole partition.
pub type EntityKeys = BTreeMap<String, String>;

/// Build an [`EntityKeys`] map from `field => value` pairs.
#[macro_export]
macro_rules! entity_keys {
    ($($field:expr => $value:expr),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut keys = $crate::cache::EntityKeys::new();
        $(keys.insert(($field).to_string(), ($value).to_string());)*
        keys
    }};
}

/// Entity fields an entry was derived from. Multi-valued so a module can be
/// tagged with every setting its classes reference.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tags(BTreeMap<String, BTreeSet<String>>);

impl Tags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: &str, value: impl Into<String>) -> Self {
        self.0.entry(field.to_string()).or_default().insert(value.into());
        self
    }

    pub fn with_all<I, S>(mut self, field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set = self.0.entry(field.to_string()).or_default();
        set.extend(values.into_iter().map(Into::into));
        self
    }

    pub fn values(&self, field: &str) -> impl Iterator<Item = &str> {
        self.0.get(field).into_iter().flatten().map(String::as_str)
    }

    pub fn first(&self, field: &str) -> Option<&str> {
        self.values(field).next()
    }

    /// An entry matches when it shares at least one field with `keys` and
    /// every shared field agrees. Empty `keys` match everything.
    pub fn matches(&self, keys: &EntityKeys) -> bool {
        if keys.is_empty() {
            return true;
        }
        let mut shared = 0;
        for (field, wanted) in keys {
            if let Some(values) = self.0.get(field) {
                if !values.contains(wanted) {
                    return false;
                }
                shared += 1;
            }
        }
        shared > 0
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    tags: Tags,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

type Slot = (EntityKind, Partition);

#[derive(Debug, Default)]
struct Shelves {
    entries: HashMap<Slot, HashMap<String, CacheEntry>>,
    /// Bumped on every removal from a slot; read-through fills compare it to
    /// avoid reinstating a value purged while they were loading.
    generations: HashMap<Slot, u64>,
}

impl Shelves {
    fn bump(&mut self, slot: &Slot) {
        *self.generations.entry(slot.clone()).or_default() += 1;
    }
}

/// Namespaced key/value cache. Namespaces are entity kinds; keys never cross
/// partitions.
#[derive(Debug)]
pub struct TtlCache {
    shelves: RwLock<Shelves>,
    default_ttl: Duration,
}

impl TtlCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self { shelves: RwLock::new(Shelves::default()), default_ttl }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    fn read(&self) -> RwLockReadGuard<'_, Shelves> {
        self.shelves.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Shelves> {
        self.shelves.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Live value for a key. Expired entries read as a miss.
    pub fn get(&self, namespace: EntityKind, partition: &Partition, key: &str) -> Option<Value> {
        let shelves = self.read();
        let entry = shelves.entries.get(&(namespace, partition.clone()))?.get(key)?;
        if entry.is_expired(Instant::now()) {
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn contains(&self, namespace: EntityKind, partition: &Partition, key: &str) -> bool {
        self.get(namespace, partition, key).is_some()
    }

    pub fn put(
        &self,
        namespace: EntityKind,
        partition: &Partition,
        key: &str,
        value: Value,
        tags: Tags,
        ttl: Option<Duration>,
    ) {
        let entry = CacheEntry { value, tags, expires_at: Instant::now() + ttl.unwrap_or(self.default_ttl) };
        self.write().entries.entry((namespace, partition.clone())).or_default().insert(key.to_string(), entry);
    }

    /// Current generation of a namespace within a partition.
    pub fn generation(&self, namespace: EntityKind, partition: &Partition) -> u64 {
        self.read().generations.get(&(namespace, partition.clone())).copied().unwrap_or(0)
    }

    /// `put` that is skipped if anything in the slot was purged since
    /// `observed` was read. Returns whether the value was stored.
    pub fn put_if_current(
        &self,
        namespace: EntityKind,
        partition: &Partition,
        key: &str,
        value: Value,
        tags: Tags,
        observed: u64,
    ) -> bool {
        let slot = (namespace, partition.clone());
        let mut shelves = self.write();
        if shelves.generations.get(&slot).copied().unwrap_or(0) != observed {
            return false;
        }
        let entry = CacheEntry { value, tags, expires_at: Instant::now() + self.default_ttl };
        shelves.entries.entry(slot).or_default().insert(key.to_string(), entry);
        true
    }

    pub fn purge(&self, namespace: EntityKind, partition: &Partition, key: &str) -> bool {
        let slot = (namespace, partition.clone());
        let mut shelves = self.write();
        let removed = shelves.entries.get_mut(&slot).and_then(|entries| entries.remove(key)).is_some();
        shelves.bump(&slot);
        removed
    }

    /// Remove every entry whose tags match `keys`; returns the removed
    /// entries' tags so callers can follow the relationship graph.
    pub fn purge_matching(&self, namespace: EntityKind, partition: &Partition, keys: &EntityKeys) -> Vec<Tags> {
        let slot = (namespace, partition.clone());
        let mut shelves = self.write();
        shelves.bump(&slot);
        let Some(entries) = shelves.entries.get_mut(&slot) else {
            return Vec::new();
        };

        let doomed: Vec<String> =
            entries.iter().filter(|(_, entry)| entry.tags.matches(keys)).map(|(key, _)| key.clone()).collect();
        doomed.into_iter().filter_map(|key| entries.remove(&key)).map(|entry| entry.tags).collect()
    }

    /// Tags of live entries where `field` carries `value`, without removing them.
    pub fn tags_matching(&self, namespace: EntityKind, partition: &Partition, field: &str, value: &str) -> Vec<Tags> {
        let shelves = self.read();
        let Some(entries) = shelves.entries.get(&(namespace, partition.clone())) else {
            return Vec::new();
        };
        entries
            .values()
            .filter(|entry| entry.tags.values(field).any(|v| v == value))
            .map(|entry| entry.tags.clone())
            .collect()
    }

    /// Drop expired entries. TTL is the fallback when a purge was missed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut shelves = self.write();
        let mut swept = 0;
        for entries in shelves.entries.values_mut() {
            let before = entries.len();
            entries.retain(|_, entry| !entry.is_expired(now));
            swept += before - entries.len();
        }
        swept
    }

    pub fn len(&self) -> usize {
        self.read().entries.values().map(HashMap::len).sum()
    }

    pub fn len_in(&self, namespace: EntityKind, partition: &Partition) -> usize {
        self.read().entries.get(&(namespace, partition.clone())).map_or(0, HashMap::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache() -> TtlCache {
        TtlCache::new(Duration::from_secs(60))
    }

    #[test]
    fn entries_are_partition_scoped() {
        let cache = cache();
        let t1 = Partition::new("t1");
        let t2 = Partition::new("t2");
        cache.put(EntityKind::Function, &t1, "F", json!(1), Tags::new().with("name", "F"), None);

        assert_eq!(cache.get(EntityKind::Function, &t1, "F"), Some(json!(1)));
        assert_eq!(cache.get(EntityKind::Function, &t2, "F"), None);
        assert_eq!(cache.get(EntityKind::Module, &t1, "F"), None);
    }

    #[test]
    fn expired_entries_read_as_miss_and_get_swept() {
        let cache = cache();
        let t1 = Partition::new("t1");
        cache.put(EntityKind::Setting, &t1, "s1", json!({}), Tags::new(), Some(Duration::ZERO));

        assert!(cache.get(EntityKind::Setting, &t1, "s1").is_none());
        assert_eq!(cache.sweep_expired(), 1);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn tag_matching_requires_agreement_on_shared_fields() {
        let tags = Tags::new().with("name", "F").with("module_name", "M");

        assert!(tags.matches(&entity_keys! { "module_name" => "M" }));
        assert!(tags.matches(&entity_keys! { "name" => "F", "module_name" => "M" }));
        assert!(tags.matches(&EntityKeys::new()));
        assert!(!tags.matches(&entity_keys! { "name" => "G", "module_name" => "M" }));
        assert!(!tags.matches(&entity_keys! { "setting_id" => "s1" }));
    }

    #[test]
    fn purge_matching_returns_removed_tags() {
        let cache = cache();
        let t1 = Partition::new("t1");
        let tagged = |name: &str| Tags::new().with("name", name).with("module_name", "M");
        cache.put(EntityKind::Function, &t1, "F", json!("f"), tagged("F"), None);
        cache.put(EntityKind::Function, &t1, "G", json!("g"), tagged("G"), None);

        let removed = cache.purge_matching(EntityKind::Function, &t1, &entity_keys! { "name" => "F" });
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].first("name"), Some("F"));
        assert!(cache.contains(EntityKind::Function, &t1, "G"));
    }

    #[test]
    fn fill_after_purge_is_discarded() {
        let cache = cache();
        let t1 = Partition::new("t1");
        let observed = cache.generation(EntityKind::Module, &t1);

        cache.purge(EntityKind::Module, &t1, "math");
        let stored = cache.put_if_current(EntityKind::Module, &t1, "math", json!("stale"), Tags::new(), observed);

        assert!(!stored);
        assert!(!cache.contains(EntityKind::Module, &t1, "math"));
    }

    #[test]
    fn multi_valued_tags_match_any_member() {
        let tags = Tags::new().with("module_name", "math").with_all("classes.setting_id", ["s1", "s2"]);
        assert!(tags.matches(&entity_keys! { "classes.setting_id" => "s2" }));
        assert_eq!(tags.values("classes.setting_id").count(), 2);
    }
}
