use std::sync::Arc;

use mcpd_common::protocol::jsonrpc::{
    Request, RequestId, Response, RpcError, CALL_FAILED, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST,
    MCP_PROTOCOL_VERSION, METHOD_NOT_FOUND, NOT_FOUND, PARSE_ERROR,
};
use mcpd_common::protocol::methods;
use mcpd_common::types::{CallStatus, InboundRequest, JsonMap, McpFunctionCall, McpType, Partition};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::PurgeReport;
use crate::engine::{Engine, EngineError};
use crate::entities::EntityService;
use crate::store::EntityKind;

/// Everything the message handler needs from the running core.
#[derive(Clone)]
pub struct RpcServerState {
    engine: Arc<Engine>,
    entities: Arc<EntityService>,
    default_partition: Partition,
}

impl RpcServerState {
    pub fn new(engine: Arc<Engine>, entities: Arc<EntityService>, default_partition: Partition) -> Self {
        Self { engine, entities, default_partition }
    }

    fn partition(&self, requested: Option<Partition>) -> Partition {
        requested.unwrap_or_else(|| self.default_partition.clone())
    }
}

// ── Params ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ListParams {
    partition: Option<Partition>,
}

#[derive(Debug, Clone, Deserialize)]
struct NamedCallParams {
    #[serde(default)]
    partition: Option<Partition>,
    name: String,
    #[serde(default)]
    arguments: JsonMap,
}

#[derive(Debug, Clone, Deserialize)]
struct ResourceReadParams {
    #[serde(default)]
    partition: Option<Partition>,
    uri: String,
}

#[derive(Debug, Clone, Deserialize)]
struct DispatchParams {
    #[serde(default)]
    partition: Option<Partition>,
    mcp_type: McpType,
    name: String,
    #[serde(default)]
    arguments: JsonMap,
    #[serde(default)]
    dedupe_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct CallGetParams {
    #[serde(default)]
    partition: Option<Partition>,
    call_uuid: Uuid,
    #[serde(default)]
    include_content: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct CachePurgeParams {
    partition: Option<Partition>,
    entity_type: Option<String>,
}

// ── Entry points ───────────────────────────────────────────────────

pub async fn handle_raw_request(raw: &[u8], state: &RpcServerState) -> Response {
    let request = match serde_json::from_slice::<Request>(raw) {
        Ok(request) => request,
        Err(error) => {
            return Response::error(
                RequestId::Null,
                RpcError::new(PARSE_ERROR, "Parse error").with_data(json!({ "reason": error.to_string() })),
            );
        }
    };

    if request.jsonrpc != "2.0" {
        return Response::error(request.id, RpcError::new(INVALID_REQUEST, "Invalid Request"));
    }

    dispatch_request(request, state).await
}

pub async fn dispatch_request(request: Request, state: &RpcServerState) -> Response {
    debug!(method = %request.method, "rpc request");
    match request.method.as_str() {
        methods::INITIALIZE => handle_initialize(request),
        methods::PING => Response::success(request.id, json!({})),
        methods::TOOLS_LIST => handle_list(request, state, McpType::Tool).await,
        methods::TOOLS_CALL => handle_tools_call(request, state).await,
        methods::RESOURCES_LIST => handle_list(request, state, McpType::Resource).await,
        methods::RESOURCES_READ => handle_resources_read(request, state).await,
        methods::PROMPTS_LIST => handle_list(request, state, McpType::Prompt).await,
        methods::PROMPTS_GET => handle_prompts_get(request, state).await,
        methods::CALLS_DISPATCH => handle_calls_dispatch(request, state).await,
        methods::CALLS_GET => handle_calls_get(request, state).await,
        methods::CACHE_PURGE => handle_cache_purge(request, state).await,
        _ => Response::error(request.id, RpcError::new(METHOD_NOT_FOUND, "Method not found")),
    }
}

// ── Session ────────────────────────────────────────────────────────

fn handle_initialize(request: Request) -> Response {
    Response::success(
        request.id,
        json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {
                "tools": { "listChanged": false },
                "resources": { "subscribe": false, "listChanged": false },
                "prompts": { "listChanged": false },
            },
            "serverInfo": { "name": "mcpd", "version": env!("CARGO_PKG_VERSION") },
        }),
    )
}

// ── Listing ────────────────────────────────────────────────────────

async fn handle_list(request: Request, state: &RpcServerState, mcp_type: McpType) -> Response {
    let params: ListParams = match parse_optional_params(request.params, request.id.clone(), &request.method) {
        Ok(params) => params,
        Err(response) => return response,
    };
    let partition = state.partition(params.partition);

    match state.entities.configuration(&partition).await {
        Ok(configuration) => {
            let key = match mcp_type {
                McpType::Tool => "tools",
                McpType::Resource => "resources",
                McpType::Prompt => "prompts",
            };
            Response::success(request.id, json!({ key: configuration.definitions(mcp_type) }))
        }
        Err(error) => internal_error_response(request.id, error.to_string()),
    }
}

// ── Execution ──────────────────────────────────────────────────────

struct Finished {
    call: McpFunctionCall,
    content: Option<Value>,
}

/// Dispatch and wait for the terminal status, then load the stored call.
async fn execute(state: &RpcServerState, request_id: &RequestId, inbound: InboundRequest) -> Result<Finished, Response> {
    let mut handle = state.engine.dispatch(inbound).await.map_err(|e| engine_error_response(request_id.clone(), e))?;
    handle.wait().await.map_err(|e| engine_error_response(request_id.clone(), e))?;

    let call = state
        .entities
        .call(&handle.partition, handle.call_uuid)
        .await
        .map_err(|e| internal_error_response(request_id.clone(), e.to_string()))?
        .ok_or_else(|| internal_error_response(request_id.clone(), format!("call {} vanished", handle.call_uuid)))?;
    let content = if call.status == CallStatus::Completed {
        state
            .engine
            .load_call_content(&handle.partition, handle.call_uuid)
            .await
            .map_err(|e| engine_error_response(request_id.clone(), e))?
    } else {
        None
    };
    Ok(Finished { call, content })
}

async fn handle_tools_call(request: Request, state: &RpcServerState) -> Response {
    let params: NamedCallParams = match parse_params(request.params, request.id.clone(), &request.method) {
        Ok(params) => params,
        Err(response) => return response,
    };
    let inbound = InboundRequest::new(state.partition(params.partition), McpType::Tool, params.name, params.arguments);
    let finished = match execute(state, &request.id, inbound).await {
        Ok(finished) => finished,
        Err(response) => return response,
    };

    let call_uuid = finished.call.call_uuid;
    match finished.call.status {
        CallStatus::Completed => {
            let content = finished.content.unwrap_or(Value::Null);
            let content = if content.is_array() { content } else { json!([{ "type": "text", "text": content.to_string() }]) };
            Response::success(request.id, json!({ "content": content, "isError": false, "call_uuid": call_uuid }))
        }
        _ => {
            let error = finished.call.error.unwrap_or_default();
            Response::success(
                request.id,
                json!({ "content": [{ "type": "text", "text": error }], "isError": true, "call_uuid": call_uuid }),
            )
        }
    }
}

async fn handle_resources_read(request: Request, state: &RpcServerState) -> Response {
    let params: ResourceReadParams = match parse_params(request.params, request.id.clone(), &request.method) {
        Ok(params) => params,
        Err(response) => return response,
    };
    let partition = state.partition(params.partition);

    let resources = match state.entities.list_functions(&partition, Some(McpType::Resource)).await {
        Ok(resources) => resources,
        Err(error) => return internal_error_response(request.id, error.to_string()),
    };
    let Some(resource) = resources.into_iter().find(|resource| resource.resource_uri() == Some(params.uri.as_str()))
    else {
        return Response::error(
            request.id,
            RpcError::new(NOT_FOUND, "Resource not found").with_data(json!({ "uri": params.uri })),
        );
    };

    let mut arguments = JsonMap::new();
    arguments.insert("uri".to_string(), Value::String(params.uri.clone()));
    let inbound = InboundRequest::new(partition, McpType::Resource, resource.name.clone(), arguments);
    let finished = match execute(state, &request.id, inbound).await {
        Ok(finished) => finished,
        Err(response) => return response,
    };
    if finished.call.status != CallStatus::Completed {
        return call_failed_response(request.id, &finished.call);
    }

    let mime_type = resource.schema.get("mimeType").and_then(Value::as_str).map(str::to_string);
    let text = resource_text(finished.content.unwrap_or(Value::Null));
    let mut entry = json!({ "uri": params.uri, "text": text });
    if let Some(mime_type) = mime_type {
        entry["mimeType"] = Value::String(mime_type);
    }
    Response::success(request.id, json!({ "contents": [entry] }))
}

/// Text of a shaped resource result: the joined text parts of a text result,
/// or the serialized value of a json result.
fn resource_text(content: Value) -> String {
    match content {
        Value::String(text) => text,
        Value::Array(parts) if parts.iter().all(|part| part.get("text").is_some()) => {
            parts.iter().filter_map(|part| part.get("text").and_then(Value::as_str)).collect::<Vec<_>>().join("\n")
        }
        other => other.to_string(),
    }
}

async fn handle_prompts_get(request: Request, state: &RpcServerState) -> Response {
    let params: NamedCallParams = match parse_params(request.params, request.id.clone(), &request.method) {
        Ok(params) => params,
        Err(response) => return response,
    };
    let inbound = InboundRequest::new(state.partition(params.partition), McpType::Prompt, params.name, params.arguments);
    let finished = match execute(state, &request.id, inbound).await {
        Ok(finished) => finished,
        Err(response) => return response,
    };
    match finished.call.status {
        CallStatus::Completed => Response::success(request.id, finished.content.unwrap_or(Value::Null)),
        _ => call_failed_response(request.id, &finished.call),
    }
}

// ── Calls ──────────────────────────────────────────────────────────

async fn handle_calls_dispatch(request: Request, state: &RpcServerState) -> Response {
    let params: DispatchParams = match parse_params(request.params, request.id.clone(), &request.method) {
        Ok(params) => params,
        Err(response) => return response,
    };
    let mut inbound =
        InboundRequest::new(state.partition(params.partition), params.mcp_type, params.name, params.arguments);
    if let Some(key) = params.dedupe_key {
        inbound = inbound.with_dedupe_key(key);
    }

    match state.engine.dispatch(inbound).await {
        Ok(handle) => Response::success(
            request.id,
            json!({
                "call_uuid": handle.call_uuid,
                "status": handle.accepted_status(),
                "deduplicated": handle.was_deduplicated(),
            }),
        ),
        Err(error) => engine_error_response(request.id, error),
    }
}

async fn handle_calls_get(request: Request, state: &RpcServerState) -> Response {
    let params: CallGetParams = match parse_params(request.params, request.id.clone(), &request.method) {
        Ok(params) => params,
        Err(response) => return response,
    };
    let partition = state.partition(params.partition);

    let call = match state.entities.call(&partition, params.call_uuid).await {
        Ok(Some(call)) => call,
        Ok(None) => {
            return Response::error(
                request.id,
                RpcError::new(NOT_FOUND, "Call not found").with_data(json!({ "call_uuid": params.call_uuid })),
            );
        }
        Err(error) => return internal_error_response(request.id, error.to_string()),
    };

    let mut result = json!(call);
    if params.include_content && call.content_externalized {
        match state.engine.load_call_content(&partition, params.call_uuid).await {
            Ok(content) => result["content"] = content.unwrap_or(Value::Null),
            Err(error) => return engine_error_response(request.id, error),
        }
    }
    Response::success(request.id, result)
}

// ── Cache ──────────────────────────────────────────────────────────

async fn handle_cache_purge(request: Request, state: &RpcServerState) -> Response {
    let params: CachePurgeParams = match parse_optional_params(request.params, request.id.clone(), &request.method) {
        Ok(params) => params,
        Err(response) => return response,
    };
    let partition = state.partition(params.partition);
    let purger = state.entities.purger();

    let report = match params.entity_type.as_deref() {
        None => purger.purge_partition(&partition).await,
        Some(name) => match EntityKind::parse(name) {
            Some(kind) => purger.purge_entity_type(&partition, kind).await,
            None => {
                return invalid_params_response(request.id, format!("unknown entity_type `{name}`"));
            }
        },
    };
    if !report.is_clean() {
        warn!(partition = %partition, failures = report.failures.len(), "operator purge incomplete");
    }
    Response::success(request.id, purge_report_json(&report))
}

fn purge_report_json(report: &PurgeReport) -> Value {
    let by_kind: JsonMap = report.purged.iter().map(|(kind, count)| (kind.as_str().to_string(), json!(count))).collect();
    json!({
        "purged": report.total(),
        "by_entity_type": by_kind,
        "visited": report.visited,
        "failures": report.failures.len(),
    })
}

// ── Helpers ────────────────────────────────────────────────────────

fn parse_params<T: DeserializeOwned>(params: Option<Value>, request_id: RequestId, method: &str) -> Result<T, Response> {
    let Some(params) = params else {
        return Err(invalid_params_response(request_id, format!("{method} requires params")));
    };
    serde_json::from_value::<T>(params)
        .map_err(|error| invalid_params_response(request_id, format!("failed to decode {method} params: {error}")))
}

fn parse_optional_params<T: DeserializeOwned + Default>(
    params: Option<Value>,
    request_id: RequestId,
    method: &str,
) -> Result<T, Response> {
    match params {
        None | Some(Value::Null) => Ok(T::default()),
        Some(params) => parse_params(Some(params), request_id, method),
    }
}

fn invalid_params_response(request_id: RequestId, reason: String) -> Response {
    Response::error(request_id, RpcError::new(INVALID_PARAMS, "Invalid params").with_data(json!({ "reason": reason })))
}

fn internal_error_response(request_id: RequestId, reason: String) -> Response {
    Response::error(request_id, RpcError::new(INTERNAL_ERROR, "Internal error").with_data(json!({ "reason": reason })))
}

fn engine_error_response(request_id: RequestId, error: EngineError) -> Response {
    match error {
        EngineError::CallNotFound(call_uuid) => Response::error(
            request_id,
            RpcError::new(NOT_FOUND, "Call not found").with_data(json!({ "call_uuid": call_uuid })),
        ),
        other => internal_error_response(request_id, other.to_string()),
    }
}

fn call_failed_response(request_id: RequestId, call: &McpFunctionCall) -> Response {
    Response::error(
        request_id,
        RpcError::new(CALL_FAILED, call.error.clone().unwrap_or_else(|| "call failed".to_string())).with_data(json!({
            "call_uuid": call.call_uuid,
            "failure_kind": call.failure_kind,
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CascadingPurger, RelationshipGraph, TtlCache};
    use crate::config::ExecutionConfig;
    use crate::entities::McpConfiguration;
    use crate::events::EventBus;
    use crate::registry::{ClassCatalog, ModuleRegistry};
    use crate::store::{BlobStore, InMemoryEntityStore, MemoryBlobStore};
    use std::time::Duration;

    struct Fixture {
        state: RpcServerState,
        entities: Arc<EntityService>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryEntityStore::new());
        let cache = Arc::new(TtlCache::new(Duration::from_secs(60)));
        let purger = Arc::new(CascadingPurger::new(cache, store.clone(), RelationshipGraph::default()));
        let entities = Arc::new(EntityService::new(store, purger));
        let blobs: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let registry =
            Arc::new(ModuleRegistry::new(entities.clone(), blobs.clone(), ClassCatalog::new(), dir.path().join("bundles")));
        let bus = Arc::new(EventBus::default());
        let engine = Arc::new(Engine::start(ExecutionConfig::default(), registry, entities.clone(), bus, blobs));
        let state = RpcServerState::new(engine, entities.clone(), Partition::new("t1"));
        Fixture { state, entities, _dir: dir }
    }

    async fn seed(entities: &EntityService) {
        let document: McpConfiguration = serde_json::from_value(json!({
            "tools": [{
                "name": "add_numbers",
                "description": "Adds two numbers",
                "inputSchema": { "type": "object", "properties": { "a": {}, "b": {} } },
            }],
            "resources": [{ "name": "inventory", "uri": "data://inventory", "mimeType": "application/json" }],
            "module_links": [{
                "type": "tool",
                "name": "add_numbers",
                "module_name": "math",
                "class_name": "Calculator",
            }],
            "modules": [{
                "module_name": "math",
                "package_name": "math_pkg",
                "class_name": "Calculator",
                "source": "mem://bundles/missing.json",
            }],
        }))
        .unwrap();
        entities.import_configuration(&Partition::new("t1"), document, "tests").await.unwrap();
    }

    fn request(method: &str, params: Option<Value>) -> Request {
        Request::new(method, params, RequestId::Number(1))
    }

    #[tokio::test]
    async fn malformed_json_is_a_parse_error() {
        let f = fixture();
        let response = handle_raw_request(b"{ not json", &f.state).await;
        assert_eq!(response.error.unwrap().code, PARSE_ERROR);
        assert_eq!(response.id, RequestId::Null);
    }

    #[tokio::test]
    async fn wrong_jsonrpc_version_is_rejected() {
        let f = fixture();
        let raw = serde_json::to_vec(&json!({ "jsonrpc": "1.0", "method": "ping", "id": 4 })).unwrap();
        let response = handle_raw_request(&raw, &f.state).await;
        assert_eq!(response.error.unwrap().code, INVALID_REQUEST);
        assert_eq!(response.id, RequestId::Number(4));
    }

    #[tokio::test]
    async fn unknown_method_is_not_found() {
        let f = fixture();
        let response = dispatch_request(request("tools/explode", None), &f.state).await;
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn initialize_reports_protocol_and_server() {
        let f = fixture();
        let response = dispatch_request(request(methods::INITIALIZE, None), &f.state).await;
        let result = response.result.unwrap();
        assert_eq!(result["protocolVersion"], json!(MCP_PROTOCOL_VERSION));
        assert_eq!(result["serverInfo"]["name"], json!("mcpd"));
        assert!(result["capabilities"]["tools"].is_object());
    }

    #[tokio::test]
    async fn tools_list_serves_the_partition_configuration() {
        let f = fixture();
        seed(&f.entities).await;

        let response = dispatch_request(request(methods::TOOLS_LIST, None), &f.state).await;
        let tools = response.result.unwrap()["tools"].clone();
        assert_eq!(tools.as_array().unwrap().len(), 1);
        assert_eq!(tools[0]["name"], json!("add_numbers"));
        assert_eq!(tools[0]["inputSchema"]["properties"]["a"], json!({}));

        let other = dispatch_request(request(methods::TOOLS_LIST, Some(json!({ "partition": "t2" }))), &f.state).await;
        assert_eq!(other.result.unwrap()["tools"], json!([]));
    }

    #[tokio::test]
    async fn tools_call_surfaces_resolution_failures_as_tool_errors() {
        let f = fixture();
        seed(&f.entities).await;

        let params = json!({ "name": "add_numbers", "arguments": { "a": 2, "b": 3 } });
        let response = dispatch_request(request(methods::TOOLS_CALL, Some(params)), &f.state).await;
        let result = response.result.unwrap();
        assert_eq!(result["isError"], json!(true));
        assert!(result["content"][0]["text"].as_str().unwrap().starts_with("ResolutionError: "));
    }

    #[tokio::test]
    async fn tools_call_requires_params() {
        let f = fixture();
        let response = dispatch_request(request(methods::TOOLS_CALL, None), &f.state).await;
        let error = response.error.unwrap();
        assert_eq!(error.code, INVALID_PARAMS);
        assert_eq!(error.data.unwrap()["reason"], json!("tools/call requires params"));
    }

    #[tokio::test]
    async fn unknown_resource_uri_is_not_found() {
        let f = fixture();
        seed(&f.entities).await;
        let params = json!({ "uri": "data://nothing" });
        let response = dispatch_request(request(methods::RESOURCES_READ, Some(params)), &f.state).await;
        assert_eq!(response.error.unwrap().code, NOT_FOUND);
    }

    #[tokio::test]
    async fn dispatched_calls_can_be_fetched() {
        let f = fixture();
        let params = json!({ "mcp_type": "tool", "name": "missing", "arguments": {} });
        let response = dispatch_request(request(methods::CALLS_DISPATCH, Some(params)), &f.state).await;
        let result = response.result.unwrap();
        assert_eq!(result["status"], json!("initial"));
        assert_eq!(result["deduplicated"], json!(false));

        let params = json!({ "call_uuid": result["call_uuid"] });
        let response = dispatch_request(request(methods::CALLS_GET, Some(params)), &f.state).await;
        let call = response.result.unwrap();
        assert_eq!(call["name"], json!("missing"));
    }

    #[tokio::test]
    async fn unknown_call_is_not_found() {
        let f = fixture();
        let params = json!({ "call_uuid": Uuid::new_v4() });
        let response = dispatch_request(request(methods::CALLS_GET, Some(params)), &f.state).await;
        assert_eq!(response.error.unwrap().code, NOT_FOUND);
    }

    #[tokio::test]
    async fn cache_purge_validates_entity_type() {
        let f = fixture();
        seed(&f.entities).await;
        f.entities.function(&Partition::new("t1"), "add_numbers").await.unwrap();

        let params = json!({ "entity_type": "mcp_function" });
        let response = dispatch_request(request(methods::CACHE_PURGE, Some(params)), &f.state).await;
        let result = response.result.unwrap();
        assert!(result["purged"].as_u64().unwrap() >= 1);
        assert_eq!(result["failures"], json!(0));

        let params = json!({ "entity_type": "nonsense" });
        let response = dispatch_request(request(methods::CACHE_PURGE, Some(params)), &f.state).await;
        assert_eq!(response.error.unwrap().code, INVALID_PARAMS);
    }

    #[test]
    fn resource_text_joins_text_parts() {
        assert_eq!(resource_text(json!([{ "type": "text", "text": "a" }, { "type": "text", "text": "b" }])), "a\nb");
        assert_eq!(resource_text(json!({ "count": 3 })), "{\"count\":3}");
        assert_eq!(resource_text(json!("plain")), "plain");
    }
}
