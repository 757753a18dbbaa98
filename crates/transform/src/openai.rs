//! Dialect head for OpenAI-compatible providers: Anthropic Messages in,
//! OpenAI chat-completions out, and the reverse for responses and streams.

use crate::{RequestOverrides, StreamContext, Transformer};
use ccproxy_core::config::ProviderConfig;
use ccproxy_core::error::ProxyError;
use ccproxy_core::sse::SseEvent;
use serde_json::{Value, json};

pub struct OpenAiDialect;

impl Transformer for OpenAiDialect {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn transform_request_in(
        &self,
        doc: &mut Value,
        _provider: &ProviderConfig,
    ) -> Result<Option<RequestOverrides>, ProxyError> {
        *doc = request_to_openai(doc)?;
        Ok(None)
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

// ─── Request: Anthropic Messages → chat-completions ────────────────────────

fn request_to_openai(doc: &Value) -> Result<Value, ProxyError> {
    let mut messages: Vec<Value> = Vec::new();

    if let Some(system) = doc.get("system") {
        let text = system_text(system);
        if !text.is_empty() {
            messages.push(json!({"role": "system", "content": text}));
        }
    }

    let source = doc
        .get("messages")
        .and_then(|m| m.as_array())
        .ok_or_else(|| ProxyError::transform("missing messages field"))?;

    for msg in source {
        let role = msg.get("role").and_then(|r| r.as_str()).unwrap_or("user");
        match role {
            "assistant" => messages.push(convert_assistant_message(msg)),
            _ => convert_user_message(msg, &mut messages),
        }
    }

    let mut out = json!({
        "model": doc.get("model").cloned().unwrap_or(Value::Null),
        "messages": messages,
    });

    if let Some(tools) = convert_tools(doc) {
        out["tools"] = tools;
    }
    if let Some(tc) = doc.get("tool_choice") {
        out["tool_choice"] = convert_tool_choice(tc);
    }
    for key in ["max_tokens", "temperature", "top_p", "stream"] {
        if let Some(v) = doc.get(key) {
            out[key] = v.clone();
        }
    }
    if let Some(stop) = doc.get("stop_sequences")
        && stop.is_array()
    {
        out["stop"] = stop.clone();
    }

    Ok(out)
}

fn system_text(system: &Value) -> String {
    match system {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n\n"),
        _ => String::new(),
    }
}

/// Assistant turns: text blocks concatenate into `content`, tool_use blocks
/// become `tool_calls` with string-encoded arguments.
fn convert_assistant_message(msg: &Value) -> Value {
    let mut text = String::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    match msg.get("content") {
        Some(Value::String(s)) => text.push_str(s),
        Some(Value::Array(blocks)) => {
            for block in blocks {
                match block.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
                            text.push_str(t);
                        }
                    }
                    Some("tool_use") => {
                        let arguments = block
                            .get("input")
                            .map(|i| serde_json::to_string(i).unwrap_or_else(|_| "{}".into()))
                            .unwrap_or_else(|| "{}".into());
                        tool_calls.push(json!({
                            "id": block.get("id").cloned().unwrap_or(json!("")),
                            "type": "function",
                            "function": {
                                "name": block.get("name").cloned().unwrap_or(json!("")),
                                "arguments": arguments,
                            },
                        }));
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }

    let mut out = json!({
        "role": "assistant",
        "content": if text.is_empty() && !tool_calls.is_empty() {
            Value::Null
        } else {
            Value::String(text)
        },
    });
    if !tool_calls.is_empty() {
        out["tool_calls"] = Value::Array(tool_calls);
    }
    out
}

/// User turns: tool_result blocks become standalone `tool` messages (they
/// must precede the text per chat-completions ordering rules), remaining
/// text/image blocks form one user message.
fn convert_user_message(msg: &Value, messages: &mut Vec<Value>) {
    let mut parts: Vec<Value> = Vec::new();
    let mut plain_text: Option<String> = None;

    match msg.get("content") {
        Some(Value::String(s)) => plain_text = Some(s.clone()),
        Some(Value::Array(blocks)) => {
            for block in blocks {
                match block.get("type").and_then(|t| t.as_str()) {
                    Some("tool_result") => messages.push(json!({
                        "role": "tool",
                        "tool_call_id": block.get("tool_use_id").cloned().unwrap_or(json!("")),
                        "content": tool_result_text(block.get("content")),
                    })),
                    Some("text") => parts.push(json!({
                        "type": "text",
                        "text": block.get("text").cloned().unwrap_or(json!("")),
                    })),
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

    if let Some(text) = plain_text {
        messages.push(json!({"role": "user", "content": text}));
    } else if !parts.is_empty() {
        // Collapse a single text part back to a plain string.
        if parts.len() == 1 && parts[0]["type"] == "text" {
            messages.push(json!({"role": "user", "content": parts[0]["text"].clone()}));
        } else {
            messages.push(json!({"role": "user", "content": parts}));
        }
    }
}

fn tool_result_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => serde_json::to_string(other).unwrap_or_default(),
        None => String::new(),
    }
}

fn convert_image_block(block: &Value) -> Option<Value> {
    let source = block.get("source")?;
    let url = match source.get("type").and_then(|t| t.as_str()) {
        Some("base64") => {
            let media_type = source
                .get("media_type")
                .and_then(|m| m.as_str())
                .unwrap_or("image/png");
            let data = source.get("data").and_then(|d| d.as_str())?;
            format!("data:{media_type};base64,{data}")
        }
        Some("url") => source.get("url").and_then(|u| u.as_str())?.to_string(),
        _ => return None,
    };
    Some(json!({"type": "image_url", "image_url": {"url": url}}))
}

fn convert_tools(doc: &Value) -> Option<Value> {
    let tools = doc.get("tools")?.as_array()?;
    let converted: Vec<Value> = tools
        .iter()
        .filter_map(|tool| {
            let name = tool.get("name")?.as_str()?;
            Some(json!({
                "type": "function",
                "function": {
                    "name": name,
                    "description": tool.get("description").cloned().unwrap_or(json!("")),
                    "parameters": tool
                        .get("input_schema")
                        .cloned()
                        .unwrap_or(json!({"type": "object", "properties": {}})),
                },
            }))
        })
        .collect();
    if converted.is_empty() {
        None
    } else {
        Some(Value::Array(converted))
    }
}

fn convert_tool_choice(tc: &Value) -> Value {
    match tc.get("type").and_then(|t| t.as_str()) {
        Some("any") => json!("required"),
        Some("none") => json!("none"),
        Some("tool") => match tc.get("name").and_then(|n| n.as_str()) {
            Some(name) => json!({"type": "function", "function": {"name": name}}),
            None => json!("auto"),
        },
        _ => json!("auto"),
    }
}

// ─── Response: chat-completions → Anthropic Messages ───────────────────────

fn map_finish_reason(finish_reason: Option<&str>) -> &'static str {
    match finish_reason {
        Some("length") => "max_tokens",
        Some("tool_calls") => "tool_use",
        _ => "end_turn",
    }
}

fn response_to_anthropic(resp: &Value) -> Result<Value, ProxyError> {
    let choice = resp
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .ok_or_else(|| ProxyError::transform("upstream response has no choices"))?;
    let message = choice.get("message").cloned().unwrap_or(json!({}));

    let mut content: Vec<Value> = Vec::new();
    if let Some(text) = message.get("content").and_then(|c| c.as_str())
        && !text.is_empty()
    {
        content.push(json!({"type": "text", "text": text}));
    }
    if let Some(tool_calls) = message.get("tool_calls").and_then(|tc| tc.as_array()) {
        for tc in tool_calls {
            let arguments = tc
                .get("function")
                .and_then(|f| f.get("arguments"))
                .and_then(|a| a.as_str())
                .unwrap_or("{}");
            let input: Value = serde_json::from_str(arguments).unwrap_or(json!({}));
            content.push(json!({
                "type": "tool_use",
                "id": tc.get("id").cloned().unwrap_or(json!("")),
                "name": tc
                    .get("function")
                    .and_then(|f| f.get("name"))
                    .cloned()
                    .unwrap_or(json!("")),
                "input": input,
            }));
        }
    }

    let stop_reason =
        map_finish_reason(choice.get("finish_reason").and_then(|f| f.as_str()));

    let mut out = json!({
        "id": format!(
            "msg_{}",
            resp.get("id").and_then(|i| i.as_str()).unwrap_or("unknown")
        ),
        "type": "message",
        "role": "assistant",
        "model": resp.get("model").cloned().unwrap_or(json!("unknown")),
        "content": content,
        "stop_reason": stop_reason,
        "stop_sequence": Value::Null,
    });

    if let Some(usage) = resp.get("usage") {
        let input = usage.get("prompt_tokens").and_then(|v| v.as_u64());
        let output = usage.get("completion_tokens").and_then(|v| v.as_u64());
        if let (Some(input), Some(output)) = (input, output) {
            out["usage"] = json!({"input_tokens": input, "output_tokens": output});
        }
    }

    Ok(out)
}

// ─── Stream: chat-completion chunks → Anthropic events ─────────────────────

/// Rewrites one chat-completion chunk into the Anthropic event sequence,
/// synthesizing `message_start` / `content_block_*` framing as blocks open
/// and close. One chunk may expand into several frames.
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
        ctx.message_id = format!(
            "msg_{}",
            chunk.get("id").and_then(|i| i.as_str()).unwrap_or("unknown")
        );
        ctx.model = chunk
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown")
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

    // Usage may arrive on any chunk (typically the last).
    if let Some(usage) = chunk.get("usage") {
        if let Some(input) = usage.get("prompt_tokens").and_then(|v| v.as_u64()) {
            ctx.input_tokens = input;
        }
        if let Some(output) = usage.get("completion_tokens").and_then(|v| v.as_u64()) {
            ctx.output_tokens = output;
        }
    }

    let Some(choice) = chunk
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
    else {
        return Ok(out);
    };

    if let Some(delta) = choice.get("delta") {
        if let Some(text) = delta.get("content").and_then(|c| c.as_str())
            && !text.is_empty()
        {
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
        }

        if let Some(tool_calls) = delta.get("tool_calls").and_then(|tc| tc.as_array()) {
            for tc in tool_calls {
                // A fragment with a name opens a new tool_use block;
                // argument fragments stream into the open one.
                if let Some(name) = tc
                    .get("function")
                    .and_then(|f| f.get("name"))
                    .and_then(|n| n.as_str())
                {
                    close_open_block(ctx, &mut out);
                    ctx.content_index += 1;
                    ctx.block_open = true;
                    ctx.block_is_tool = true;
                    out.push(named_json(
                        "content_block_start",
                        json!({
                            "type": "content_block_start",
                            "index": ctx.content_index,
                            "content_block": {
                                "type": "tool_use",
                                "id": tc.get("id").cloned().unwrap_or(json!("")),
                                "name": name,
                                "input": {},
                            },
                        }),
                    ));
                }
                if let Some(arguments) = tc
                    .get("function")
                    .and_then(|f| f.get("arguments"))
                    .and_then(|a| a.as_str())
                    && !arguments.is_empty()
                {
                    out.push(named_json(
                        "content_block_delta",
                        json!({
                            "type": "content_block_delta",
                            "index": ctx.content_index,
                            "delta": {"type": "input_json_delta", "partial_json": arguments},
                        }),
                    ));
                }
            }
        }
    }

    if let Some(finish_reason) = choice.get("finish_reason").and_then(|f| f.as_str()) {
        close_open_block(ctx, &mut out);
        ctx.finish_emitted = true;
        out.push(named_json(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {
                    "stop_reason": map_finish_reason(Some(finish_reason)),
                    "stop_sequence": Value::Null,
                },
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
    use assert_json_diff::assert_json_include;

    fn provider() -> ProviderConfig {
        ProviderConfig {
            name: "openai".into(),
            base_url: "https://api.openai.com".into(),
            api_key: "k".into(),
            models: vec![],
            enabled: true,
            transformers: vec![],
        }
    }

    #[test]
    fn test_request_basic_conversion() {
        let mut doc = json!({
            "model": "gpt-4",
            "system": "Be terse.",
            "messages": [{"role": "user", "content": "Hi"}],
            "max_tokens": 256,
            "temperature": 0.7,
            "stop_sequences": ["END"],
            "stream": true,
        });
        OpenAiDialect
            .transform_request_in(&mut doc, &provider())
            .unwrap();

        assert_eq!(doc["model"], "gpt-4");
        assert_eq!(doc["messages"][0]["role"], "system");
        assert_eq!(doc["messages"][0]["content"], "Be terse.");
        assert_eq!(doc["messages"][1]["role"], "user");
        assert_eq!(doc["messages"][1]["content"], "Hi");
        assert_eq!(doc["max_tokens"], 256);
        assert_eq!(doc["stop"], json!(["END"]));
        assert_eq!(doc["stream"], true);
        assert!(doc.get("stop_sequences").is_none());
        assert!(doc.get("system").is_none());
    }

    #[test]
    fn test_request_tool_round_trip_shapes() {
        let mut doc = json!({
            "model": "gpt-4",
            "messages": [
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "toolu_1", "name": "get_weather",
                     "input": {"location": "Paris"}},
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "22C"},
                    {"type": "text", "text": "and tomorrow?"},
                ]},
            ],
            "tools": [{
                "name": "get_weather",
                "description": "Current weather",
                "input_schema": {"type": "object", "properties": {"location": {"type": "string"}}},
            }],
            "tool_choice": {"type": "any"},
        });
        OpenAiDialect
            .transform_request_in(&mut doc, &provider())
            .unwrap();

        let messages = doc["messages"].as_array().unwrap();
        assert_eq!(messages[1]["role"], "assistant");
        assert_eq!(messages[1]["content"], Value::Null);
        assert_eq!(messages[1]["tool_calls"][0]["function"]["name"], "get_weather");
        assert_eq!(
            messages[1]["tool_calls"][0]["function"]["arguments"],
            "{\"location\":\"Paris\"}"
        );
        assert_eq!(messages[2]["role"], "tool");
        assert_eq!(messages[2]["tool_call_id"], "toolu_1");
        assert_eq!(messages[2]["content"], "22C");
        assert_eq!(messages[3]["role"], "user");
        assert_eq!(messages[3]["content"], "and tomorrow?");

        assert_eq!(doc["tools"][0]["type"], "function");
        assert_eq!(doc["tools"][0]["function"]["name"], "get_weather");
        assert_eq!(doc["tool_choice"], "required");
    }

    #[test]
    fn test_response_conversion() {
        let mut resp = json!({
            "id": "abc123",
            "model": "gpt-4",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Hello"},
                "finish_reason": "stop",
            }],
            "usage": {"prompt_tokens": 2, "completion_tokens": 1, "total_tokens": 3},
        });
        OpenAiDialect.transform_response_out(&mut resp).unwrap();

        assert_json_include!(
            actual: resp.clone(),
            expected: json!({
                "type": "message",
                "role": "assistant",
                "model": "gpt-4",
                "content": [{"type": "text", "text": "Hello"}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 2, "output_tokens": 1},
            })
        );
        assert!(resp["id"].as_str().unwrap().starts_with("msg_"));
    }

    #[test]
    fn test_response_with_tool_calls() {
        let mut resp = json!({
            "id": "abc",
            "model": "gpt-4",
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "get_weather", "arguments": "{\"location\":\"Paris\"}"},
                    }],
                },
                "finish_reason": "tool_calls",
            }],
        });
        OpenAiDialect.transform_response_out(&mut resp).unwrap();

        assert_eq!(resp["stop_reason"], "tool_use");
        assert_eq!(resp["content"][0]["type"], "tool_use");
        assert_eq!(resp["content"][0]["input"]["location"], "Paris");
    }

    #[test]
    fn test_round_trip_preserves_text_and_usage() {
        // Property: response-out ∘ request-in keeps message text and usage.
        let mut doc = json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "Hi"}],
        });
        OpenAiDialect
            .transform_request_in(&mut doc, &provider())
            .unwrap();
        assert_eq!(doc["messages"][0]["content"], "Hi");

        let mut resp = json!({
            "id": "r1",
            "model": "gpt-4",
            "choices": [{"message": {"role": "assistant", "content": "Hello"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 2, "completion_tokens": 1},
        });
        OpenAiDialect.transform_response_out(&mut resp).unwrap();
        assert_eq!(resp["content"][0]["text"], "Hello");
        assert_eq!(resp["usage"]["input_tokens"], 2);
        assert_eq!(resp["usage"]["output_tokens"], 1);
    }

    fn chunk(data: Value) -> SseEvent {
        SseEvent::new(data.to_string())
    }

    fn collect_types(events: &[SseEvent]) -> Vec<String> {
        events
            .iter()
            .map(|e| e.event.clone().unwrap_or_else(|| e.data.clone()))
            .collect()
    }

    #[test]
    fn test_stream_text_synthesis() {
        let mut ctx = StreamContext::new();
        let d = OpenAiDialect;

        let first = d
            .transform_stream_chunk(
                chunk(json!({
                    "id": "c1", "model": "gpt-4",
                    "choices": [{"delta": {"role": "assistant", "content": "He"}}],
                })),
                &mut ctx,
            )
            .unwrap();
        assert_eq!(
            collect_types(&first),
            ["message_start", "content_block_start", "content_block_delta"]
        );

        let second = d
            .transform_stream_chunk(
                chunk(json!({"choices": [{"delta": {"content": "llo"}}]})),
                &mut ctx,
            )
            .unwrap();
        assert_eq!(collect_types(&second), ["content_block_delta"]);

        let finish = d
            .transform_stream_chunk(
                chunk(json!({
                    "choices": [{"delta": {}, "finish_reason": "stop"}],
                    "usage": {"prompt_tokens": 2, "completion_tokens": 1},
                })),
                &mut ctx,
            )
            .unwrap();
        assert_eq!(
            collect_types(&finish),
            ["content_block_stop", "message_delta", "message_stop"]
        );
        let delta: Value = serde_json::from_str(&finish[1].data).unwrap();
        assert_eq!(delta["delta"]["stop_reason"], "end_turn");
        assert_eq!(delta["usage"]["input_tokens"], 2);
        assert_eq!(delta["usage"]["output_tokens"], 1);

        let done = d.transform_stream_chunk(SseEvent::done(), &mut ctx).unwrap();
        assert_eq!(done.len(), 1);
        assert!(done[0].is_done());
    }

    #[test]
    fn test_stream_tool_call_synthesis() {
        let mut ctx = StreamContext::new();
        let d = OpenAiDialect;

        let open = d
            .transform_stream_chunk(
                chunk(json!({
                    "id": "c1", "model": "gpt-4",
                    "choices": [{"delta": {"tool_calls": [{
                        "index": 0, "id": "call_1",
                        "function": {"name": "get_weather", "arguments": ""},
                    }]}}],
                })),
                &mut ctx,
            )
            .unwrap();
        assert_eq!(collect_types(&open), ["message_start", "content_block_start"]);
        let start: Value = serde_json::from_str(&open[1].data).unwrap();
        assert_eq!(start["content_block"]["type"], "tool_use");
        assert_eq!(start["content_block"]["name"], "get_weather");

        let args = d
            .transform_stream_chunk(
                chunk(json!({"choices": [{"delta": {"tool_calls": [{
                    "index": 0, "function": {"arguments": "{\"loc"},
                }]}}]})),
                &mut ctx,
            )
            .unwrap();
        let delta: Value = serde_json::from_str(&args[0].data).unwrap();
        assert_eq!(delta["delta"]["type"], "input_json_delta");
        assert_eq!(delta["delta"]["partial_json"], "{\"loc");
    }
}
