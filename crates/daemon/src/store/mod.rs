// Collaborator seams: the entity store (strongly consistent per partition)
// and the blob store holding bundle archives and externalized results.

pub mod blob;
pub mod memory;

use async_trait::async_trait;
use mcpd_common::types::Partition;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

pub use blob::{BlobError, BlobStore, LocalBlobStore, MemoryBlobStore};
pub use memory::InMemoryEntityStore;

/// Entity types known to the store and the cache layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Module,
    Function,
    FunctionCall,
    Setting,
    /// Assembled per-partition MCP configuration. Cache-only.
    Configuration,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] =
        [Self::Setting, Self::Module, Self::Function, Self::FunctionCall, Self::Configuration];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Module => "mcp_module",
            Self::Function => "mcp_function",
            Self::FunctionCall => "mcp_function_call",
            Self::Setting => "mcp_setting",
            Self::Configuration => "mcp_configuration",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }

    /// Field holding the primary key inside a record of this kind.
    pub const fn key_field(self) -> &'static str {
        match self {
            Self::Module => "module_name",
            Self::Function => "name",
            Self::FunctionCall => "call_uuid",
            Self::Setting => "setting_id",
            Self::Configuration => "partition",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("entity store unavailable: {0}")]
    Unavailable(String),

    #[error("failed to encode {kind} record `{key}`: {message}")]
    Encode { kind: EntityKind, key: String, message: String },

    #[error("failed to decode {kind} record `{key}`: {message}")]
    Decode { kind: EntityKind, key: String, message: String },
}

/// Record-level access to the backing entity store.
///
/// Records are JSON documents; `query_by_index` matches a (possibly dotted)
/// field path, descending into arrays, e.g. `classes.setting_id`.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get(&self, partition: &Partition, kind: EntityKind, key: &str) -> Result<Option<Value>, StoreError>;

    async fn put(&self, partition: &Partition, kind: EntityKind, key: &str, record: Value) -> Result<(), StoreError>;

    /// Returns `true` when a record existed.
    async fn delete(&self, partition: &Partition, kind: EntityKind, key: &str) -> Result<bool, StoreError>;

    async fn query_by_index(
        &self,
        partition: &Partition,
        kind: EntityKind,
        field: &str,
        value: &str,
    ) -> Result<Vec<Value>, StoreError>;

    /// Every record of a kind in a partition, ordered by key.
    async fn list(&self, partition: &Partition, kind: EntityKind) -> Result<Vec<Value>, StoreError>;
}

// ── Typed helpers ──────────────────────────────────────────────────

pub async fn get_record<T: DeserializeOwned>(
    store: &dyn EntityStore,
    partition: &Partition,
    kind: EntityKind,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(partition, kind, key).await? {
        Some(value) => decode(kind, key, value).map(Some),
        None => Ok(None),
    }
}

pub async fn put_record<T: Serialize>(
    store: &dyn EntityStore,
    partition: &Partition,
    kind: EntityKind,
    key: &str,
    record: &T,
) -> Result<(), StoreError> {
    let value = serde_json::to_value(record).map_err(|error| StoreError::Encode {
        kind,
        key: key.to_string(),
        message: error.to_string(),
    })?;
    store.put(partition, kind, key, value).await
}

pub fn decode<T: DeserializeOwned>(kind: EntityKind, key: &str, value: Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|error| StoreError::Decode {
        kind,
        key: key.to_string(),
        message: error.to_string(),
    })
}

/// String form of a record field, following dotted paths through objects and arrays.
pub fn field_values(record: &Value, path: &str) -> Vec<String> {
    let mut current = vec![record];
    for segment in path.split('.') {
        let mut next = Vec::new();
        for value in current {
            match value {
                Value::Array(items) => {
                    next.extend(items.iter().filter_map(|item| item.get(segment)));
                }
                other => next.extend(other.get(segment)),
            }
        }
        current = next;
    }

    let mut out = Vec::new();
    for value in current {
        match value {
            Value::String(s) => out.push(s.clone()),
            Value::Array(items) => out.extend(items.iter().filter_map(scalar_string)),
            other => out.extend(scalar_string(other)),
        }
    }
    out
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
