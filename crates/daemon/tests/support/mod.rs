// Shared fixtures: a calculator unit, its bundle, and a runtime wired to
// in-memory collaborators.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mcpd_common::types::{CallStatus, InboundRequest, JsonMap, McpFunctionCall, McpType, Partition};
use mcpd_daemon::config::EngineConfig;
use mcpd_daemon::entities::McpConfiguration;
use mcpd_daemon::registry::bundle::BundleArchive;
use mcpd_daemon::registry::{ClassCatalog, InvocationContext, McpUnit, UnitError, UnitSpec};
use mcpd_daemon::runtime::{Collaborators, EngineRuntime};
use mcpd_daemon::store::{BlobStore, InMemoryEntityStore, MemoryBlobStore};
use serde_json::{json, Value};
use tempfile::TempDir;

pub const PACKAGE: &str = "math_pkg";
pub const CLASS: &str = "Calculator";
pub const BUNDLE_KEY: &str = "bundles/math.json";

pub struct Calculator {
    offset: i64,
}

fn number(arguments: &JsonMap, key: &str) -> Result<i64, UnitError> {
    arguments.get(key).and_then(Value::as_i64).ok_or_else(|| UnitError::failed(format!("`{key}` is not an integer")))
}

#[async_trait]
impl McpUnit for Calculator {
    fn call(&self, ctx: &InvocationContext, arguments: &JsonMap) -> Result<Value, UnitError> {
        match ctx.function_name.as_str() {
            "add_numbers" => Ok(json!(number(arguments, "a")? + number(arguments, "b")? + self.offset)),
            "fail" => Err(UnitError::failed("boom")),
            "slow" => {
                for _ in 0..500 {
                    if ctx.is_cancelled() {
                        return Err(UnitError::Cancelled);
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Ok(json!("finished"))
            }
            "big" => Ok(json!("x".repeat(number(arguments, "size")? as usize))),
            "inventory" => Ok(json!({ "uri": arguments.get("uri"), "items": 3 })),
            "topic_prompt" => {
                let topic = arguments.get("topic").and_then(Value::as_str).unwrap_or_default();
                Ok(json!(format!("Write about {topic}")))
            }
            "bad_return" => Ok(json!("ignored")),
            other => Err(UnitError::UnknownFunction(other.to_string())),
        }
    }

    async fn call_async(&self, ctx: InvocationContext, arguments: JsonMap) -> Result<Value, UnitError> {
        match ctx.function_name.as_str() {
            "async_add" => {
                tokio::time::sleep(Duration::from_millis(5)).await;
                ctx.report_progress(json!({ "step": 1 }));
                Ok(json!(number(&arguments, "a")? + number(&arguments, "b")?))
            }
            "async_sleep" => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(json!("woke"))
            }
            other => Err(UnitError::UnknownFunction(other.to_string())),
        }
    }
}

pub fn catalog() -> ClassCatalog {
    ClassCatalog::new().with_class(PACKAGE, CLASS, |spec: &UnitSpec<'_>| {
        let offset = spec.setting.get("offset").and_then(Value::as_i64).unwrap_or(0);
        Ok(Arc::new(Calculator { offset }) as Arc<dyn McpUnit>)
    })
}

pub fn bundle_bytes() -> Vec<u8> {
    BundleArchive::new(PACKAGE)
        .with_class(CLASS)
        .with_file("calculator/main.py", b"class Calculator: ...")
        .to_bytes()
        .unwrap()
}

/// Configuration with every calculator function bound to module `math`.
pub fn configuration() -> McpConfiguration {
    let link = |mcp_type: &str, name: &str, return_type: &str, is_async: bool| {
        json!({
            "type": mcp_type,
            "name": name,
            "module_name": "math",
            "class_name": CLASS,
            "return_type": return_type,
            "is_async": is_async,
        })
    };
    serde_json::from_value(json!({
        "tools": [
            {
                "name": "add_numbers",
                "description": "Adds two numbers",
                "inputSchema": { "type": "object", "properties": { "a": {}, "b": {} } },
            },
            { "name": "fail", "inputSchema": { "type": "object", "properties": {} } },
            { "name": "slow", "inputSchema": { "type": "object", "properties": {} } },
            { "name": "big", "inputSchema": { "type": "object", "properties": { "size": {} } } },
            { "name": "bad_return", "inputSchema": { "type": "object", "properties": {} } },
            {
                "name": "async_add",
                "inputSchema": { "type": "object", "properties": { "a": {}, "b": {} } },
            },
            { "name": "async_sleep", "inputSchema": { "type": "object", "properties": {} } },
        ],
        "resources": [
            { "name": "inventory", "uri": "data://inventory", "mimeType": "application/json" },
        ],
        "prompts": [
            {
                "name": "topic_prompt",
                "description": "Writing prompt",
                "arguments": [{ "name": "topic", "required": true }],
            },
        ],
        "module_links": [
            link("tool", "add_numbers", "text", false),
            link("tool", "fail", "text", false),
            link("tool", "slow", "text", false),
            link("tool", "big", "text", false),
            link("tool", "bad_return", "xml", false),
            link("tool", "async_add", "text", true),
            link("tool", "async_sleep", "text", true),
            link("resource", "inventory", "json", false),
            link("prompt", "topic_prompt", "text", false),
        ],
        "modules": [{
            "module_name": "math",
            "package_name": PACKAGE,
            "class_name": CLASS,
            "setting": { "offset": 0 },
            "source": MemoryBlobStore::uri_for(BUNDLE_KEY),
        }],
    }))
    .unwrap()
}

pub fn args(value: Value) -> JsonMap {
    value.as_object().cloned().unwrap_or_default()
}

pub struct Harness {
    pub runtime: EngineRuntime,
    pub blobs: Arc<MemoryBlobStore>,
    pub store: Arc<InMemoryEntityStore>,
    pub dir: TempDir,
}

impl Harness {
    /// Runtime with a short call timeout and a small externalization
    /// threshold; `tweak` adjusts the config further.
    pub async fn start(tweak: impl FnOnce(&mut EngineConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::default();
        config.registry.bundle_root = Some(dir.path().join("bundles"));
        config.engine.call_timeout_ms = 2_000;
        config.engine.externalize_threshold_bytes = 1024;
        config.cache.purge_retry_base_ms = 1;
        tweak(&mut config);

        let blobs = Arc::new(MemoryBlobStore::new());
        let store = Arc::new(InMemoryEntityStore::new());
        let runtime = EngineRuntime::start(
            &config,
            Collaborators { store: store.clone(), blobs: blobs.clone(), catalog: catalog() },
        )
        .unwrap();
        Self { runtime, blobs, store, dir }
    }

    /// Upload the bundle and import the configuration into `partition`.
    pub async fn seed(&self, partition: &str) {
        self.blobs.put(BUNDLE_KEY, bundle_bytes()).await.unwrap();
        self.runtime
            .entities()
            .import_configuration(&Partition::new(partition), configuration(), "tests")
            .await
            .unwrap();
    }

    /// Dispatch, wait for the terminal status and return the stored call.
    pub async fn run(&self, partition: &str, mcp_type: McpType, name: &str, arguments: Value) -> McpFunctionCall {
        let request = InboundRequest::new(partition, mcp_type, name, args(arguments));
        let mut handle = self.runtime.dispatch(request).await.unwrap();
        let status = handle.wait().await.unwrap();
        assert!(status.is_terminal());
        self.call(partition, &handle).await
    }

    pub async fn call(&self, partition: &str, handle: &mcpd_daemon::engine::CallHandle) -> McpFunctionCall {
        self.runtime.entities().call(&Partition::new(partition), handle.call_uuid).await.unwrap().unwrap()
    }
}

pub fn completed_text(call: &McpFunctionCall) -> String {
    assert_eq!(call.status, CallStatus::Completed, "call failed: {:?}", call.error);
    call.content.as_ref().and_then(|c| c[0]["text"].as_str()).unwrap_or_default().to_string()
}
