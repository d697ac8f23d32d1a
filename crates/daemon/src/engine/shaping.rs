// Argument validation before a unit runs and MCP result shaping after.

use mcpd_common::types::{JsonMap, McpFunction, McpType};
use serde_json::{json, Value};

/// Check the call arguments against the function's declared schema.
///
/// Tools require every declared input property. Prompts require the
/// arguments flagged `required`. Resources take their `uri` from the engine
/// and are not checked.
pub fn validate_arguments(function: &McpFunction, arguments: &JsonMap) -> Result<(), String> {
    match function.mcp_type {
        McpType::Tool => {
            let properties = function
                .schema
                .get("inputSchema")
                .and_then(|schema| schema.get("properties"))
                .or_else(|| function.schema.get("properties"))
                .and_then(Value::as_object);
            if let Some(properties) = properties {
                if let Some(missing) = properties.keys().find(|key| !arguments.contains_key(*key)) {
                    return Err(format!("Missing argument {missing}"));
                }
            }
            Ok(())
        }
        McpType::Prompt => {
            let declared = function.schema.get("arguments").and_then(Value::as_array);
            for argument in declared.into_iter().flatten() {
                let required = argument.get("required").and_then(Value::as_bool).unwrap_or(false);
                let Some(name) = argument.get("name").and_then(Value::as_str) else {
                    continue;
                };
                if required && !arguments.contains_key(name) {
                    return Err(format!("Missing required argument {name}"));
                }
            }
            Ok(())
        }
        McpType::Resource => Ok(()),
    }
}

/// Arguments handed to the unit. Resources always see their own `uri`.
pub fn unit_arguments(function: &McpFunction, arguments: &JsonMap) -> JsonMap {
    if function.mcp_type != McpType::Resource {
        return arguments.clone();
    }
    let mut shaped = JsonMap::new();
    let uri = arguments
        .get("uri")
        .cloned()
        .or_else(|| function.resource_uri().map(|uri| Value::String(uri.to_string())))
        .unwrap_or(Value::Null);
    shaped.insert("uri".to_string(), uri);
    shaped
}

/// Wrap a unit's raw output in the shape its MCP type and return type call for.
pub fn shape_result(function: &McpFunction, output: Value) -> Result<Value, String> {
    if function.mcp_type == McpType::Prompt {
        return Ok(json!({
            "description": function.description.clone().unwrap_or_default(),
            "messages": [{
                "role": "user",
                "content": { "type": "text", "text": as_text(output) },
            }],
        }));
    }
    match function.return_type.as_str() {
        "text" => Ok(json!([{ "type": "text", "text": as_text(output) }])),
        "json" => Ok(output),
        other => Err(format!("Invalid return type {other}")),
    }
}

fn as_text(value: Value) -> String {
    match value {
        Value::String(text) => text,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mcpd_common::types::Partition;

    fn function(mcp_type: McpType, return_type: &str, schema: Value) -> McpFunction {
        McpFunction {
            partition: Partition::new("t1"),
            name: "add_numbers".into(),
            mcp_type,
            description: Some("Adds two numbers".into()),
            module_name: Some("math".into()),
            class_name: Some("Calculator".into()),
            function_name: None,
            is_async: false,
            return_type: return_type.into(),
            schema: schema.as_object().cloned().unwrap_or_default(),
            updated_by: "tests".into(),
            updated_at: Utc::now(),
        }
    }

    fn args(value: Value) -> JsonMap {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn tool_requires_every_declared_property() {
        let schema = json!({ "inputSchema": { "type": "object", "properties": { "a": {}, "b": {} } } });
        let tool = function(McpType::Tool, "text", schema);

        assert!(validate_arguments(&tool, &args(json!({ "a": 2, "b": 3 }))).is_ok());
        assert_eq!(validate_arguments(&tool, &args(json!({ "a": 2 }))), Err("Missing argument b".to_string()));
    }

    #[test]
    fn tool_without_schema_accepts_anything() {
        let tool = function(McpType::Tool, "text", json!({}));
        assert!(validate_arguments(&tool, &JsonMap::new()).is_ok());
    }

    #[test]
    fn prompt_checks_only_required_arguments() {
        let schema = json!({ "arguments": [
            { "name": "topic", "required": true },
            { "name": "tone", "required": false },
        ] });
        let prompt = function(McpType::Prompt, "text", schema);

        assert!(validate_arguments(&prompt, &args(json!({ "topic": "rust" }))).is_ok());
        assert_eq!(
            validate_arguments(&prompt, &args(json!({ "tone": "dry" }))),
            Err("Missing required argument topic".to_string())
        );
    }

    #[test]
    fn resource_arguments_fall_back_to_declared_uri() {
        let resource = function(McpType::Resource, "json", json!({ "uri": "data://inventory" }));
        let shaped = unit_arguments(&resource, &JsonMap::new());
        assert_eq!(shaped.get("uri"), Some(&json!("data://inventory")));

        let shaped = unit_arguments(&resource, &args(json!({ "uri": "data://other", "extra": 1 })));
        assert_eq!(Value::Object(shaped), json!({ "uri": "data://other" }));
    }

    #[test]
    fn text_results_are_wrapped() {
        let tool = function(McpType::Tool, "text", json!({}));
        assert_eq!(shape_result(&tool, json!("5")).unwrap(), json!([{ "type": "text", "text": "5" }]));
        assert_eq!(shape_result(&tool, json!(5)).unwrap(), json!([{ "type": "text", "text": "5" }]));
    }

    #[test]
    fn json_results_pass_through() {
        let tool = function(McpType::Tool, "json", json!({}));
        assert_eq!(shape_result(&tool, json!({ "sum": 5 })).unwrap(), json!({ "sum": 5 }));
    }

    #[test]
    fn unknown_return_type_is_rejected() {
        let tool = function(McpType::Tool, "xml", json!({}));
        assert_eq!(shape_result(&tool, json!("5")), Err("Invalid return type xml".to_string()));
    }

    #[test]
    fn prompts_become_a_single_user_message() {
        let prompt = function(McpType::Prompt, "text", json!({}));
        let shaped = shape_result(&prompt, json!("Write about rust")).unwrap();
        assert_eq!(shaped["description"], json!("Adds two numbers"));
        assert_eq!(shaped["messages"][0]["role"], json!("user"));
        assert_eq!(shaped["messages"][0]["content"], json!({ "type": "text", "text": "Write about rust" }));
    }
}
