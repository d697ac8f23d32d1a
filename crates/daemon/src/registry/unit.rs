// Executable units: the contract a materialized class fulfils, the context
// it runs with, and the catalog that instantiates classes from bundles.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use mcpd_common::types::{JsonMap, Partition};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UnitError {
    #[error("function `{0}` is not exported by this unit")]
    UnknownFunction(String),

    #[error("unit does not support {0} invocation")]
    Unsupported(&'static str),

    #[error("invocation cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

impl UnitError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Best-effort cancellation flag shared between the engine and a running unit.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub type ProgressFn = Arc<dyn Fn(Value) + Send + Sync>;

/// Everything a unit gets to know about the invocation it serves.
#[derive(Clone)]
pub struct InvocationContext {
    pub partition: Partition,
    pub call_uuid: Uuid,
    /// Name the unit exports the function under.
    pub function_name: String,
    cancel: CancelSignal,
    progress: Option<ProgressFn>,
}

impl fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationContext")
            .field("partition", &self.partition)
            .field("call_uuid", &self.call_uuid)
            .field("function_name", &self.function_name)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl InvocationContext {
    pub fn new(partition: Partition, call_uuid: Uuid, function_name: impl Into<String>) -> Self {
        Self { partition, call_uuid, function_name: function_name.into(), cancel: CancelSignal::default(), progress: None }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Publish an intermediate progress event for this call.
    pub fn report_progress(&self, progress: Value) {
        if let Some(sink) = &self.progress {
            sink(progress);
        }
    }
}

/// A materialized class instance serving one or more functions.
///
/// Functions declared `is_async` go through `call_async`; the rest run on a
/// blocking pool worker through `call`.
#[async_trait]
pub trait McpUnit: Send + Sync {
    fn call(&self, ctx: &InvocationContext, arguments: &JsonMap) -> Result<Value, UnitError> {
        let _ = (ctx, arguments);
        Err(UnitError::Unsupported("blocking"))
    }

    async fn call_async(&self, ctx: InvocationContext, arguments: JsonMap) -> Result<Value, UnitError> {
        let _ = (ctx, arguments);
        Err(UnitError::Unsupported("async"))
    }
}

/// Inputs for instantiating one class out of an extracted bundle.
#[derive(Debug)]
pub struct UnitSpec<'a> {
    pub partition: &'a Partition,
    pub module_name: &'a str,
    pub package_name: &'a str,
    pub class_name: &'a str,
    pub setting: &'a JsonMap,
    pub bundle_dir: &'a Path,
}

pub type UnitFactory = Arc<dyn Fn(&UnitSpec<'_>) -> Result<Arc<dyn McpUnit>, UnitError> + Send + Sync>;

/// Class constructors the daemon can materialize, keyed by
/// `(package_name, class_name)`.
#[derive(Clone, Default)]
pub struct ClassCatalog {
    factories: HashMap<(String, String), UnitFactory>,
}

impl fmt::Debug for ClassCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.factories.keys().collect();
        keys.sort();
        f.debug_struct("ClassCatalog").field("classes", &keys).finish()
    }
}

impl ClassCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, package_name: &str, class_name: &str, factory: F) -> &mut Self
    where
        F: Fn(&UnitSpec<'_>) -> Result<Arc<dyn McpUnit>, UnitError> + Send + Sync + 'static,
    {
        self.factories.insert((package_name.to_string(), class_name.to_string()), Arc::new(factory));
        self
    }

    pub fn with_class<F>(mut self, package_name: &str, class_name: &str, factory: F) -> Self
    where
        F: Fn(&UnitSpec<'_>) -> Result<Arc<dyn McpUnit>, UnitError> + Send + Sync + 'static,
    {
        self.register(package_name, class_name, factory);
        self
    }

    pub fn get(&self, package_name: &str, class_name: &str) -> Option<UnitFactory> {
        self.factories.get(&(package_name.to_string(), class_name.to_string())).cloned()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }
}
