mod support;

use mcpd_common::protocol::jsonrpc::{Request, RequestId, Response, CALL_FAILED, METHOD_NOT_FOUND};
use mcpd_common::protocol::methods::SUPPORTED_METHODS;
use mcpd_common::types::Partition;
use mcpd_daemon::rpc::methods::{handle_raw_request, RpcServerState};
use serde_json::{json, Value};
use support::Harness;

async fn call(state: &RpcServerState, method: &str, params: Option<Value>) -> Response {
    let request = Request::new(method, params, RequestId::Number(1));
    let raw = serde_json::to_vec(&request).expect("request should encode");
    handle_raw_request(&raw, state).await
}

async fn seeded() -> (Harness, RpcServerState) {
    let harness = Harness::start(|_| {}).await;
    harness.seed("t1").await;
    let state = harness.runtime.rpc_state(Partition::new("t1"));
    (harness, state)
}

#[tokio::test]
async fn every_supported_method_is_dispatched() {
    let (_harness, state) = seeded().await;
    for method in SUPPORTED_METHODS {
        let response = call(&state, method, None).await;
        if let Some(error) = response.error {
            assert_ne!(error.code, METHOD_NOT_FOUND, "method `{method}` must be dispatched");
        }
    }
}

#[tokio::test]
async fn tools_call_returns_text_content() {
    let (_harness, state) = seeded().await;
    let response = call(&state, "tools/call", Some(json!({ "name": "add_numbers", "arguments": { "a": 2, "b": 3 } }))).await;
    let result = response.result.expect("tools/call should succeed");
    assert_eq!(result["isError"], json!(false));
    assert_eq!(result["content"], json!([{ "type": "text", "text": "5" }]));
}

#[tokio::test]
async fn tools_call_reports_unit_failures_as_tool_errors() {
    let (_harness, state) = seeded().await;
    let response = call(&state, "tools/call", Some(json!({ "name": "fail" }))).await;
    let result = response.result.expect("tool errors are results");
    assert_eq!(result["isError"], json!(true));
    assert_eq!(result["content"][0]["text"], json!("ExecutionError: boom"));
}

#[tokio::test]
async fn resources_read_finds_the_resource_by_uri() {
    let (_harness, state) = seeded().await;
    let response = call(&state, "resources/read", Some(json!({ "uri": "data://inventory" }))).await;
    let result = response.result.expect("resources/read should succeed");
    let entry = &result["contents"][0];
    assert_eq!(entry["uri"], json!("data://inventory"));
    assert_eq!(entry["mimeType"], json!("application/json"));
    let body: Value = serde_json::from_str(entry["text"].as_str().unwrap()).unwrap();
    assert_eq!(body, json!({ "uri": "data://inventory", "items": 3 }));
}

#[tokio::test]
async fn prompts_get_shapes_messages_and_checks_required_arguments() {
    let (_harness, state) = seeded().await;
    let response = call(&state, "prompts/get", Some(json!({ "name": "topic_prompt", "arguments": { "topic": "rust" } }))).await;
    let result = response.result.expect("prompts/get should succeed");
    assert_eq!(result["description"], json!("Writing prompt"));
    assert_eq!(result["messages"][0]["content"]["text"], json!("Write about rust"));

    let response = call(&state, "prompts/get", Some(json!({ "name": "topic_prompt" }))).await;
    let error = response.error.expect("missing topic should fail");
    assert_eq!(error.code, CALL_FAILED);
    assert_eq!(error.message, "ValidationError: Missing required argument topic");
    assert_eq!(error.data.unwrap()["failure_kind"], json!("validation"));
}

#[tokio::test]
async fn listings_reflect_imported_configuration() {
    let (_harness, state) = seeded().await;
    let tools = call(&state, "tools/list", None).await.result.unwrap();
    assert_eq!(tools["tools"].as_array().unwrap().len(), 7);

    let resources = call(&state, "resources/list", None).await.result.unwrap();
    assert_eq!(resources["resources"][0]["uri"], json!("data://inventory"));

    let prompts = call(&state, "prompts/list", None).await.result.unwrap();
    assert_eq!(prompts["prompts"][0]["arguments"][0]["name"], json!("topic"));
}

#[tokio::test]
async fn calls_get_loads_externalized_content_on_request() {
    let (_harness, state) = seeded().await;
    let response = call(&state, "tools/call", Some(json!({ "name": "big", "arguments": { "size": 2048 } }))).await;
    let result = response.result.unwrap();
    assert_eq!(result["content"][0]["text"].as_str().unwrap().len(), 2048);
    let call_uuid = result["call_uuid"].clone();

    let bare = call(&state, "calls/get", Some(json!({ "call_uuid": call_uuid }))).await.result.unwrap();
    assert_eq!(bare["content_externalized"], json!(true));
    assert!(bare.get("content").is_none());

    let full =
        call(&state, "calls/get", Some(json!({ "call_uuid": call_uuid, "include_content": true }))).await.result.unwrap();
    assert_eq!(full["content"][0]["text"].as_str().unwrap().len(), 2048);
}

#[tokio::test]
async fn cache_purge_reports_the_partition_purge() {
    let (harness, state) = seeded().await;
    let partition = Partition::new("t1");
    harness.runtime.entities().function(&partition, "add_numbers").await.unwrap();
    harness.runtime.entities().configuration(&partition).await.unwrap();

    let result = call(&state, "cache/purge", None).await.result.unwrap();
    assert!(result["purged"].as_u64().unwrap() >= 2);
    assert_eq!(result["failures"], json!(0));
    assert_eq!(harness.runtime.cache().len_in(mcpd_daemon::store::EntityKind::Function, &partition), 0);
}
