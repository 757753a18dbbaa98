//! Dialect head for Gemini: Anthropic Messages in, `generateContent` out.
//! Gemini keys the model in the URL rather than the body, so this head also
//! attaches an outbound URL override (`:streamGenerateContent?alt=sse` for
//! streams).

use crate::{RequestOverrides, StreamContext, Transformer};
use ccproxy_core::config::ProviderConfig;
use ccproxy_core::error::ProxyError;
use ccproxy_core::sse::SseEvent;
use serde_json::{Value, json};
use std::collections::HashMap;

pub struct GeminiDialect;

impl Transformer for GeminiDialect {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn transform_request_in(
        &self,
        doc: &mut Value,
        provider: &ProviderConfig,
    ) -> Result<Option<RequestOverrides>, ProxyError> {
        let model = doc
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string();
        let stream = doc.get("stream").and_then(|s| s.as_bool()).unwrap_or(false);

        *doc = request_to_gemini(doc)?;

        let verb = if stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        Ok(Some(RequestOverrides {
            url: Some(format!(
                "{}/v1beta/models/{model}:{verb}",
                provider.base_url
            )),
            ..Default::default()
        }))
    }

    fn transform_response_out(&self, resp: &mut Value) -> Result<(), ProxyError> {
        *resp = response_to_anthropic(resp)?;
        Ok(())
    }

    fn transform_stream_chunk(
        &self,
        event: SseEvent,
        ctx: &mut StreamContext,
    ) -> Result<Vec<SseEvent>, ProxyError> {
        stream_chunk_to_anthropic(event, ctx)
    }

    fn transforms_stream(&self) -> bool {
        true
    }
}

// ─── Request: Anthropic Messages → generateContent ─────────────────────────

fn request_to_gemini(doc: &Value) -> Result<Value, ProxyError> {
    let messages = doc
        .get("messages")
        .and_then(|m| m.as_array())
        .ok_or_else(|| ProxyError::transform("missing messages field"))?;

    // tool_result blocks carry only the tool_use id; Gemini wants the
    // function name back, so index tool_use blocks up front.
    let tool_names = collect_tool_names(messages);

    let mut contents: Vec<Value> = Vec::new();
    for msg in messages {
        let role = msg.get("role").and_then(|r| r.as_str()).unwrap_or("user");
        let gemini_role = if role == "assistant" { "model" } else { "user" };
        let parts = convert_parts(msg.get("content"), &tool_names);
        if parts.is_empty() {
            continue;
        }

        // Merge consecutive same-role turns, which Gemini requires.
        if let Some(last) = contents.last_mut()
            && last.get("role").and_then(|r| r.as_str()) == Some(gemini_role)
            && let Some(existing) = last.get_mut("parts").and_then(|p| p.as_array_mut())
        {
            existing.extend(parts);
            continue;
        }
        contents.push(json!({"role": gemini_role, "parts": parts}));
    }

    let mut out = json!({"contents": contents});

    if let Some(system) = doc.get("system") {
        let text = match system {
            Value::String(s) => s.clone(),
            Value::Array(parts) => parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n\n"),
            _ => String::new(),
        };
        if !text.is_empty() {
            out["systemInstruction"] = json!({"parts": [{"text": text}]});
        }
    }

    if let Some(config) = build_generation_config(doc) {
        out["generationConfig"] = config;
    }
    if let Some(tools) = convert_tools(doc) {
        out["tools"] = tools;
    }

    Ok(out)
}

fn collect_tool_names(messages: &[Value]) -> HashMap<String, String> {
    let mut names = HashMap::new();
    for msg in messages {
        if let Some(blocks) = msg.get("content").and_then(|c| c.as_array()) {
            for block in blocks {
                if block.get("type").and_then(|t| t.as_str()) == Some("tool_use")
                    && let (Some(id), Some(name)) = (
                        block.get("id").and_then(|i| i.as_str()),
                        block.get("name").and_then(|n| n.as_str()),
                    )
                {
                    names.insert(id.to_string(), name.to_string());
                }
            }
        }
    }
    names
}

fn convert_parts(content: Option<&Value>, tool_names: &HashMap<String, String>) -> Vec<Value> {
    let mut parts = Vec::new();
    match content {
        Some(Value::String(s)) => {
            if !s.is_empty() {
                parts.push(json!({"text": s}));
            }
        }
        Some(Value::Array(blocks)) => {
            for block in blocks {
                match block.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                            parts.push(json!({"text": text}));
                        }
                    }
                    Some("tool_use") => parts.push(json!({
                        "functionCall": {
                            "name": block.get("name").cloned().unwrap_or(json!("")),
                            "args": block.get("input").cloned().unwrap_or(json!({})),
                        }
                    })),
                    Some("tool_result") => {
                        let id = block
                            .get("tool_use_id")
                            .and_then(|i| i.as_str())
                            .unwrap_or_default();
                        let name = tool_names
                            .get(id)
                            .cloned()
                            .unwrap_or_else(|| "function".to_string());
                        let response = tool_result_value(block.get("content"));
                        parts.push(json!({
                            "functionResponse": {"name": name, "response": response}
                        }));
                    }
                    Some("image") => {
                        if let Some(part) = convert_image_block(block) {
                            parts.push(part);
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
    parts
}

fn tool_result_value(content: Option<&Value>) -> Value {
    match content {
        Some(Value::String(s)) => {
            serde_json::from_str(s).unwrap_or_else(|_| json!({"result": s}))
        }
        Some(Value::Array(blocks)) => {
            let text: String = blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n");
            json!({"result": text})
        }
        Some(other) => json!({"result": other.clone()}),
        None => json!({"result": ""}),
    }
}

fn convert_image_block(block: &Value) -> Option<Value> {
    let source = block.get("source")?;
    if source.get("type").and_then(|t| t.as_str()) == Some("base64") {
        return Some(json!({
            "inlineData": {
                "mimeType": source.get("media_type").cloned().unwrap_or(json!("image/png")),
                "data": source.get("data").cloned().unwrap_or(json!("")),
            }
        }));
    }
    None
}

fn build_generation_config(doc: &Value) -> Option<Value> {
    let mut config = json!({});
    let mut has_any = false;

    if let Some(max) = doc.get("max_tokens") {
        config["maxOutputTokens"] = max.clone();
        has_any = true;
    }
    if let Some(temp) = doc.get("temperature") {
        config["temperature"] = temp.clone();
        has_any = true;
    }
    if let Some(top_p) = doc.get("top_p") {
        config["topP"] = top_p.clone();
        has_any = true;
    }
    if let Some(stop) = doc.get("stop_sequences")
        && stop.is_array()
    {
        config["stopSequences"] = stop.clone();
        has_any = true;
    }

    has_any.then_some(config)
}

fn convert_tools(doc: &Value) -> Option<Value> {
    let tools = doc.get("tools")?.as_array()?;
    let declarations: Vec<Value> = tools
        .iter()
        .filter_map(|tool| {
            let name = tool.get("name")?.as_str()?;
            let mut decl = json!({
                "name": name,
                "description": tool.get("description").cloned().unwrap_or(json!("")),
            });
            if let Some(schema) = tool.get("input_schema") {
                decl["parameters"] = schema.clone();
            }
            Some(decl)
        })
        .collect();
    if declarations.is_empty() {
        None
    } else {
        Some(json!([{"functionDeclarations": declarations}]))
    }
}

// ─── Response: generateContent → Anthropic Messages ────────────────────────

fn response_to_anthropic(resp: &Value) -> Result<Value, ProxyError> {
    let candidate = resp
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .ok_or_else(|| ProxyError::transform("upstream response has no candidates"))?;

    let mut content: Vec<Value> = Vec::new();
    let mut saw_tool_use = false;
    if let Some(parts) = candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
    {
        for part in parts {
            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                content.push(json!({"type": "text", "text": text}));
            } else if let Some(call) = part.get("functionCall") {
                saw_tool_use = true;
                content.push(json!({
                    "type": "tool_use",
                    "id": new_tool_id(),
                    "name": call.get("name").cloned().unwrap_or(json!("")),
                    "input": call.get("args").cloned().unwrap_or(json!({})),
                }));
            }
        }
    }

    let stop_reason = if saw_tool_use {
        "tool_use"
    } else {
        map_finish_reason(candidate.get("finishReason").and_then(|f| f.as_str()))
    };

    let mut out = json!({
        "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
        "type": "message",
        "role": "assistant",
        "model": resp.get("modelVersion").cloned().unwrap_or(json!("gemini")),
        "content": content,
        "stop_reason": stop_reason,
        "stop_sequence": Value::Null,
    });

    if let Some(usage) = resp.get("usageMetadata") {
        let input = usage.get("promptTokenCount").and_then(|v| v.as_u64());
        let output = usage.get("candidatesTokenCount").and_then(|v| v.as_u64());
        if let (Some(input), Some(output)) = (input, output) {
            out["usage"] = json!({"input_tokens": input, "output_tokens": output});
        }
    }

    Ok(out)
}

fn map_finish_reason(finish_reason: Option<&str>) -> &'static str {
    match finish_reason {
        Some("MAX_TOKENS") => "max_tokens",
        _ => "end_turn",
    }
}

fn new_tool_id() -> String {
    format!("toolu_{}", uuid::Uuid::new_v4().simple())
}

// ─── Stream: generateContent chunks → Anthropic events ─────────────────────

/// Each Gemini stream chunk is a partial `GenerateContentResponse`. Text
/// parts stream into one text block; functionCall parts arrive whole and are
/// emitted as a complete tool_use block.
fn stream_chunk_to_anthropic(
    event: SseEvent,
    ctx: &mut StreamContext,
) -> Result<Vec<SseEvent>, ProxyError> {
    if event.is_done() {
        let mut out = Vec::new();
        close_open_block(ctx, &mut out);
        out.push(SseEvent::done());
        return Ok(out);
    }

    let chunk: Value = serde_json::from_slice(event.data.as_bytes())?;
    let mut out: Vec<SseEvent> = Vec::new();

    if !ctx.started {
        ctx.started = true;
        ctx.message_id = format!("msg_{}", uuid::Uuid::new_v4().simple());
        ctx.model = chunk
            .get("modelVersion")
            .and_then(|m| m.as_str())
            .unwrap_or("gemini")
            .to_string();
        out.push(named_json(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": ctx.message_id,
                    "type": "message",
                    "role": "assistant",
                    "model": ctx.model,
                    "content": [],
                    "stop_reason": Value::Null,
                    "usage": {"input_tokens": 0, "output_tokens": 0},
                },
            }),
        ));
    }

    if let Some(usage) = chunk.get("usageMetadata") {
        if let Some(input) = usage.get("promptTokenCount").and_then(|v| v.as_u64()) {
            ctx.input_tokens = input;
        }
        if let Some(output) = usage.get("candidatesTokenCount").and_then(|v| v.as_u64()) {
            ctx.output_tokens = output;
        }
    }

    let Some(candidate) = chunk
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
    else {
        return Ok(out);
    };

    if let Some(parts) = candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
    {
        for part in parts {
            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                if !ctx.block_open || ctx.block_is_tool {
                    close_open_block(ctx, &mut out);
                    ctx.content_index += 1;
                    ctx.block_open = true;
                    ctx.block_is_tool = false;
                    out.push(named_json(
                        "content_block_start",
                        json!({
                            "type": "content_block_start",
                            "index": ctx.content_index,
                            "content_block": {"type": "text", "text": ""},
                        }),
                    ));
                }
                out.push(named_json(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": ctx.content_index,
                        "delta": {"type": "text_delta", "text": text},
                    }),
                ));
            } else if let Some(call) = part.get("functionCall") {
                close_open_block(ctx, &mut out);
                ctx.content_index += 1;
                ctx.tool_use_seen = true;
                let args = call.get("args").cloned().unwrap_or(json!({}));
                out.push(named_json(
                    "content_block_start",
                    json!({
                        "type": "content_block_start",
                        "index": ctx.content_index,
                        "content_block": {
                            "type": "tool_use",
                            "id": new_tool_id(),
                            "name": call.get("name").cloned().unwrap_or(json!("")),
                            "input": {},
                        },
                    }),
                ));
                out.push(named_json(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": ctx.content_index,
                        "delta": {
                            "type": "input_json_delta",
                            "partial_json": args.to_string(),
                        },
                    }),
                ));
                out.push(named_json(
                    "content_block_stop",
                    json!({"type": "content_block_stop", "index": ctx.content_index}),
                ));
            }
        }
    }

    if let Some(finish_reason) = candidate.get("finishReason").and_then(|f| f.as_str())
        && !ctx.finish_emitted
    {
        close_open_block(ctx, &mut out);
        ctx.finish_emitted = true;
        let stop_reason = if ctx.tool_use_seen {
            "tool_use"
        } else {
            map_finish_reason(Some(finish_reason))
        };
        out.push(named_json(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason, "stop_sequence": Value::Null},
                "usage": {
                    "input_tokens": ctx.input_tokens,
                    "output_tokens": ctx.output_tokens,
                },
            }),
        ));
        out.push(named_json("message_stop", json!({"type": "message_stop"})));
    }

    Ok(out)
}

fn close_open_block(ctx: &mut StreamContext, out: &mut Vec<SseEvent>) {
    if ctx.block_open {
        out.push(named_json(
            "content_block_stop",
            json!({"type": "content_block_stop", "index": ctx.content_index}),
        ));
        ctx.block_open = false;
        ctx.block_is_tool = false;
    }
}

fn named_json(event: &str, value: Value) -> SseEvent {
    SseEvent::named(event, value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> ProviderConfig {
        ProviderConfig {
            name: "gemini".into(),
            base_url: "https://generativelanguage.googleapis.com".into(),
            api_key: "k".into(),
            models: vec![],
            enabled: true,
            transformers: vec![],
        }
    }

    #[test]
    fn test_request_conversion_and_url_override() {
        let mut doc = json!({
            "model": "gemini-2.0-flash",
            "system": "Be terse.",
            "messages": [{"role": "user", "content": "Hi"}],
            "max_tokens": 128,
            "temperature": 0.3,
            "stream": true,
        });
        let overrides = GeminiDialect
            .transform_request_in(&mut doc, &provider())
            .unwrap()
            .unwrap();

        assert_eq!(
            overrides.url.as_deref(),
            Some(
                "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:streamGenerateContent?alt=sse"
            )
        );
        assert_eq!(doc["contents"][0]["role"], "user");
        assert_eq!(doc["contents"][0]["parts"][0]["text"], "Hi");
        assert_eq!(doc["systemInstruction"]["parts"][0]["text"], "Be terse.");
        assert_eq!(doc["generationConfig"]["maxOutputTokens"], 128);
        assert!(doc.get("messages").is_none());
        assert!(doc.get("model").is_none());
    }

    #[test]
    fn test_request_tool_conversion() {
        let mut doc = json!({
            "model": "gemini-2.0-flash",
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "toolu_1", "name": "get_weather",
                     "input": {"location": "Paris"}},
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "22C"},
                ]},
            ],
            "tools": [{"name": "get_weather", "description": "d",
                       "input_schema": {"type": "object"}}],
        });
        GeminiDialect
            .transform_request_in(&mut doc, &provider())
            .unwrap();

        assert_eq!(
            doc["contents"][0]["parts"][0]["functionCall"]["name"],
            "get_weather"
        );
        let response_part = &doc["contents"][1]["parts"][0]["functionResponse"];
        assert_eq!(response_part["name"], "get_weather");
        assert_eq!(response_part["response"]["result"], "22C");
        assert_eq!(
            doc["tools"][0]["functionDeclarations"][0]["name"],
            "get_weather"
        );
    }

    #[test]
    fn test_response_conversion() {
        let mut resp = json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "Hello"}]},
                "finishReason": "STOP",
            }],
            "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 2},
            "modelVersion": "gemini-2.0-flash",
        });
        GeminiDialect.transform_response_out(&mut resp).unwrap();

        assert_eq!(resp["type"], "message");
        assert_eq!(resp["content"][0]["text"], "Hello");
        assert_eq!(resp["stop_reason"], "end_turn");
        assert_eq!(resp["usage"]["input_tokens"], 4);
        assert_eq!(resp["usage"]["output_tokens"], 2);
    }

    #[test]
    fn test_stream_synthesis() {
        let mut ctx = StreamContext::new();
        let d = GeminiDialect;

        let first = d
            .transform_stream_chunk(
                SseEvent::new(
                    json!({
                        "candidates": [{"content": {"parts": [{"text": "He"}]}}],
                        "modelVersion": "gemini-2.0-flash",
                    })
                    .to_string(),
                ),
                &mut ctx,
            )
            .unwrap();
        let types: Vec<_> = first.iter().filter_map(|e| e.event.clone()).collect();
        assert_eq!(
            types,
            ["message_start", "content_block_start", "content_block_delta"]
        );

        let last = d
            .transform_stream_chunk(
                SseEvent::new(
                    json!({
                        "candidates": [{
                            "content": {"parts": [{"text": "llo"}]},
                            "finishReason": "STOP",
                        }],
                        "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 2},
                    })
                    .to_string(),
                ),
                &mut ctx,
            )
            .unwrap();
        let types: Vec<_> = last.iter().filter_map(|e| e.event.clone()).collect();
        assert_eq!(
            types,
            [
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
    }
}
