//! Approximate input-token cost of a request document.
//!
//! Used only to classify requests for routing (the long-context rule); it is
//! not an authoritative token price. The heuristic is deterministic and
//! monotone in message size: text weighs one unit per character plus one
//! extra per punctuation character, structured values weigh the length of
//! their compact JSON serialization, and four units make a token.

use serde_json::Value;

const CHARS_PER_TOKEN: u64 = 4;

/// Estimate input tokens across messages, system preamble, and tools.
pub fn estimate_request_tokens(doc: &Value) -> u64 {
    let mut weight: u64 = 0;

    if let Some(messages) = doc.get("messages").and_then(|m| m.as_array()) {
        for message in messages {
            weight += content_weight(message.get("content"));
        }
    }

    weight += content_weight(doc.get("system"));

    if let Some(tools) = doc.get("tools").and_then(|t| t.as_array()) {
        for tool in tools {
            if let Some(name) = tool.get("name").and_then(|n| n.as_str()) {
                weight += text_weight(name);
            }
            if let Some(desc) = tool.get("description").and_then(|d| d.as_str()) {
                weight += text_weight(desc);
            }
            if let Some(schema) = tool.get("input_schema") {
                weight += json_weight(schema);
            }
        }
    }

    weight.div_ceil(CHARS_PER_TOKEN)
}

fn content_weight(content: Option<&Value>) -> u64 {
    match content {
        Some(Value::String(s)) => text_weight(s),
        Some(Value::Array(parts)) => parts.iter().map(part_weight).sum(),
        _ => 0,
    }
}

fn part_weight(part: &Value) -> u64 {
    match part.get("type").and_then(|t| t.as_str()) {
        Some("text") => text_weight(part.get("text").and_then(|t| t.as_str()).unwrap_or("")),
        // tool_use, tool_result, images: weigh the structure as serialized.
        _ => json_weight(part),
    }
}

fn text_weight(text: &str) -> u64 {
    let chars = text.chars().count() as u64;
    let punctuation = text.chars().filter(|c| c.is_ascii_punctuation()).count() as u64;
    chars + punctuation
}

fn json_weight(value: &Value) -> u64 {
    serde_json::to_string(value).map(|s| s.len() as u64).unwrap_or(0)
}
