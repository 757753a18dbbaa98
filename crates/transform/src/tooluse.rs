//! Tool-call hygiene.
//!
//! `tooluse` normalizes tool declarations and tool-call message parts to the
//! provider's convention after the dialect head has run. `enhancetool`
//! hardens schemas against strict validators on the way out and repairs
//! malformed tool-call arguments on the way back.

use crate::{RequestOverrides, Transformer};
use ccproxy_core::config::ProviderConfig;
use ccproxy_core::error::ProxyError;
use serde_json::{Value, json};

pub struct ToolUse;

impl Transformer for ToolUse {
    fn name(&self) -> &'static str {
        "tooluse"
    }

    fn transform_request_in(
        &self,
        doc: &mut Value,
        _provider: &ProviderConfig,
    ) -> Result<Option<RequestOverrides>, ProxyError> {
        normalize_tool_declarations(doc);
        normalize_tool_calls(doc);
        Ok(None)
    }
}

/// Ensure every tool declaration carries a parameter schema object,
/// whichever dialect shape the document is in.
fn normalize_tool_declarations(doc: &mut Value) {
    let Some(tools) = doc.get_mut("tools").and_then(|t| t.as_array_mut()) else {
        return;
    };
    for tool in tools {
        if let Some(function) = tool.get_mut("function") {
            // chat-completions shape
            ensure_schema_object(function, "parameters");
        } else if let Some(declarations) = tool
            .get_mut("functionDeclarations")
            .and_then(|d| d.as_array_mut())
        {
            // Gemini shape
            for decl in declarations {
                ensure_schema_object(decl, "parameters");
            }
        } else if tool.get("name").is_some() {
            // Anthropic shape
            ensure_schema_object(tool, "input_schema");
        }
    }
}

fn ensure_schema_object(owner: &mut Value, key: &str) {
    let schema = owner.get(key);
    if !schema.is_some_and(|s| s.is_object()) {
        owner[key] = json!({"type": "object", "properties": {}});
    }
}

/// Chat-completions requires tool_call arguments as JSON-encoded strings;
/// rewrap any structured arguments a client slipped through.
fn normalize_tool_calls(doc: &mut Value) {
    let Some(messages) = doc.get_mut("messages").and_then(|m| m.as_array_mut()) else {
        return;
    };
    for msg in messages {
        let Some(tool_calls) = msg.get_mut("tool_calls").and_then(|tc| tc.as_array_mut()) else {
            continue;
        };
        for tc in tool_calls {
            let Some(arguments) = tc.get_mut("function").and_then(|f| f.get_mut("arguments"))
            else {
                continue;
            };
            if !arguments.is_string() {
                let encoded = serde_json::to_string(arguments).unwrap_or_else(|_| "{}".into());
                *arguments = Value::String(encoded);
            }
        }
    }
}

pub struct EnhanceTool;

impl Transformer for EnhanceTool {
    fn name(&self) -> &'static str {
        "enhancetool"
    }

    fn transform_request_in(
        &self,
        doc: &mut Value,
        _provider: &ProviderConfig,
    ) -> Result<Option<RequestOverrides>, ProxyError> {
        if let Some(tools) = doc.get_mut("tools") {
            strip_unsupported_schema_keys(tools);
        }
        Ok(None)
    }

    fn transform_response_in(&self, resp: &mut Value) -> Result<(), ProxyError> {
        repair_tool_call_arguments(resp);
        Ok(())
    }
}

/// Remove draft-specific JSON-schema keys that strict provider validators
/// reject. Applied recursively through the declaration tree.
fn strip_unsupported_schema_keys(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.remove("$schema");
            map.remove("additionalProperties");
            // Non-standard format values trip strict validators; keep the
            // universally supported ones.
            if let Some(format) = map.get("format").and_then(|f| f.as_str())
                && format != "date-time"
            {
                map.remove("format");
            }
            for (_, nested) in map.iter_mut() {
                strip_unsupported_schema_keys(nested);
            }
        }
        Value::Array(items) => {
            for item in items {
                strip_unsupported_schema_keys(item);
            }
        }
        _ => {}
    }
}

/// Models occasionally emit tool-call arguments wrapped in code fences or as
/// truncated JSON; replace anything unparseable with an empty object so the
/// client-side decode does not fail.
fn repair_tool_call_arguments(resp: &mut Value) {
    let Some(choices) = resp.get_mut("choices").and_then(|c| c.as_array_mut()) else {
        return;
    };
    for choice in choices {
        let Some(tool_calls) = choice
            .get_mut("message")
            .and_then(|m| m.get_mut("tool_calls"))
            .and_then(|tc| tc.as_array_mut())
        else {
            continue;
        };
        for tc in tool_calls {
            let Some(arguments) = tc.get_mut("function").and_then(|f| f.get_mut("arguments"))
            else {
                continue;
            };
            let Some(raw) = arguments.as_str() else {
                continue;
            };
            if serde_json::from_str::<Value>(raw).is_ok() {
                continue;
            }
            let stripped = raw
                .trim()
                .trim_start_matches("```json")
                .trim_start_matches("```")
                .trim_end_matches("```")
                .trim();
            *arguments = if serde_json::from_str::<Value>(stripped).is_ok() {
                Value::String(stripped.to_string())
            } else {
                Value::String("{}".to_string())
            };
        }
    }
}
