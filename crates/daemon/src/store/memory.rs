// In-memory entity store: one ordered map per (partition, kind).

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use mcpd_common::types::Partition;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{field_values, EntityKind, EntityStore, StoreError};

#[derive(Debug, Default)]
pub struct InMemoryEntityStore {
    records: RwLock<HashMap<(Partition, EntityKind), BTreeMap<String, Value>>>,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, partition: &Partition, kind: EntityKind) -> usize {
        let records = self.records.read().await;
        records.get(&(partition.clone(), kind)).map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn get(&self, partition: &Partition, kind: EntityKind, key: &str) -> Result<Option<Value>, StoreError> {
        let records = self.records.read().await;
        Ok(records.get(&(partition.clone(), kind)).and_then(|table| table.get(key)).cloned())
    }

    async fn put(&self, partition: &Partition, kind: EntityKind, key: &str, record: Value) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        records.entry((partition.clone(), kind)).or_default().insert(key.to_string(), record);
        Ok(())
    }

    async fn delete(&self, partition: &Partition, kind: EntityKind, key: &str) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        Ok(records
            .get_mut(&(partition.clone(), kind))
            .and_then(|table| table.remove(key))
            .is_some())
    }

    async fn query_by_index(
        &self,
        partition: &Partition,
        kind: EntityKind,
        field: &str,
        value: &str,
    ) -> Result<Vec<Value>, StoreError> {
        let records = self.records.read().await;
        let Some(table) = records.get(&(partition.clone(), kind)) else {
            return Ok(Vec::new());
        };
        Ok(table
            .values()
            .filter(|record| field_values(record, field).iter().any(|v| v == value))
            .cloned()
            .collect())
    }

    async fn list(&self, partition: &Partition, kind: EntityKind) -> Result<Vec<Value>, StoreError> {
        let records = self.records.read().await;
        Ok(records.get(&(partition.clone(), kind)).map(|table| table.values().cloned().collect()).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn partitions_never_see_each_other() {
        let store = InMemoryEntityStore::new();
        let t1 = Partition::new("t1");
        let t2 = Partition::new("t2");

        store.put(&t1, EntityKind::Function, "F", json!({ "name": "F" })).await.unwrap();

        assert!(store.get(&t1, EntityKind::Function, "F").await.unwrap().is_some());
        assert!(store.get(&t2, EntityKind::Function, "F").await.unwrap().is_none());
        assert!(store.list(&t2, EntityKind::Function).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn query_by_index_matches_nested_fields() {
        let store = InMemoryEntityStore::new();
        let t1 = Partition::new("t1");
        store
            .put(&t1, EntityKind::Module, "math", json!({ "module_name": "math", "classes": [{ "setting_id": "s1" }] }))
            .await
            .unwrap();
        store
            .put(&t1, EntityKind::Module, "text", json!({ "module_name": "text", "classes": [{ "setting_id": "s2" }] }))
            .await
            .unwrap();

        let hits = store.query_by_index(&t1, EntityKind::Module, "classes.setting_id", "s1").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["module_name"], json!("math"));
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let store = InMemoryEntityStore::new();
        let t1 = Partition::new("t1");
        store.put(&t1, EntityKind::Setting, "s1", json!({})).await.unwrap();

        assert!(store.delete(&t1, EntityKind::Setting, "s1").await.unwrap());
        assert!(!store.delete(&t1, EntityKind::Setting, "s1").await.unwrap());
        assert_eq!(store.len(&t1, EntityKind::Setting).await, 0);
    }
}
