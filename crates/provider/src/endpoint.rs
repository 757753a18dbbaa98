//! Outbound HTTP request construction: endpoint paths, auth header
//! variants, content headers, and transformer overrides.

use ccproxy_core::config::ProviderConfig;
use ccproxy_core::error::ProxyError;
use ccproxy_transform::RequestConfig;
use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::time::Duration;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const USER_AGENT: &str = concat!("ccproxy/", env!("CARGO_PKG_VERSION"));

/// Fixed per-provider endpoint path. Unknown providers are assumed
/// OpenAI-compatible.
pub fn endpoint_path(provider: &str) -> &'static str {
    match provider {
        "anthropic" => "/v1/messages",
        "groq" => "/openai/v1/chat/completions",
        "gemini" => "/v1beta/models/generateContent",
        "openrouter" => "/api/v1/chat/completions",
        "ollama" => "/api/chat",
        _ => "/v1/chat/completions",
    }
}

/// Assemble the outbound request: URL (override or base + path), method,
/// auth variant, content headers, then custom overrides last so they may
/// overwrite anything.
pub fn build_request(
    client: &reqwest::Client,
    provider: &ProviderConfig,
    request: &RequestConfig,
    streaming: bool,
) -> Result<reqwest::RequestBuilder, ProxyError> {
    let url = match &request.url {
        Some(url) => url.clone(),
        None => format!("{}{}", provider.base_url, endpoint_path(&provider.name)),
    };

    let method = match &request.method {
        Some(m) => Method::from_bytes(m.as_bytes())
            .map_err(|_| ProxyError::transform(format!("invalid method override: {m}")))?,
        None => Method::POST,
    };

    // Composed with insert semantics so later entries (custom overrides
    // last) replace earlier ones instead of duplicating them.
    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    headers.insert("user-agent", HeaderValue::from_static(USER_AGENT));
    if streaming {
        headers.insert("accept", HeaderValue::from_static("text/event-stream"));
    }

    if !provider.api_key.is_empty() {
        match provider.name.as_str() {
            "anthropic" => {
                headers.insert("x-api-key", header_value(&provider.api_key)?);
                headers.insert(
                    "anthropic-version",
                    HeaderValue::from_static(ANTHROPIC_VERSION),
                );
            }
            _ => {
                headers.insert(
                    "authorization",
                    header_value(&format!("Bearer {}", provider.api_key))?,
                );
            }
        }
    }

    for (key, value) in &request.headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|_| ProxyError::transform(format!("invalid header override: {key}")))?;
        headers.insert(name, header_value(value)?);
    }

    let mut builder = client.request(method, &url).headers(headers);
    if let Some(timeout_ms) = request.timeout_ms {
        builder = builder.timeout(Duration::from_millis(timeout_ms));
    }

    Ok(builder.json(&request.body))
}

fn header_value(value: &str) -> Result<HeaderValue, ProxyError> {
    HeaderValue::from_str(value)
        .map_err(|_| ProxyError::transform("header value contains invalid characters"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn provider(name: &str, api_key: &str) -> ProviderConfig {
        ProviderConfig {
            name: name.into(),
            base_url: format!("https://{name}.example.com"),
            api_key: api_key.into(),
            models: vec![],
            enabled: true,
            transformers: vec![],
        }
    }

    fn request_config(body: serde_json::Value) -> RequestConfig {
        RequestConfig {
            body,
            url: None,
            method: None,
            headers: HashMap::new(),
            timeout_ms: None,
        }
    }

    fn build(provider: &ProviderConfig, request: &RequestConfig, streaming: bool) -> reqwest::Request {
        let client = reqwest::Client::new();
        build_request(&client, provider, request, streaming)
            .unwrap()
            .build()
            .unwrap()
    }

    #[test]
    fn test_endpoint_paths() {
        assert_eq!(endpoint_path("anthropic"), "/v1/messages");
        assert_eq!(endpoint_path("openai"), "/v1/chat/completions");
        assert_eq!(endpoint_path("groq"), "/openai/v1/chat/completions");
        assert_eq!(endpoint_path("deepseek"), "/v1/chat/completions");
        assert_eq!(endpoint_path("gemini"), "/v1beta/models/generateContent");
        assert_eq!(endpoint_path("openrouter"), "/api/v1/chat/completions");
        assert_eq!(endpoint_path("mistral"), "/v1/chat/completions");
        assert_eq!(endpoint_path("xai"), "/v1/chat/completions");
        assert_eq!(endpoint_path("ollama"), "/api/chat");
        assert_eq!(endpoint_path("somewhere-else"), "/v1/chat/completions");
    }

    #[test]
    fn test_anthropic_auth_variant() {
        let req = build(&provider("anthropic", "sk-ant-key"), &request_config(json!({})), false);
        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.url().as_str(), "https://anthropic.example.com/v1/messages");
        assert_eq!(req.headers()["x-api-key"], "sk-ant-key");
        assert_eq!(req.headers()["anthropic-version"], ANTHROPIC_VERSION);
        assert!(req.headers().get("authorization").is_none());
    }

    #[test]
    fn test_bearer_auth_variant() {
        let req = build(&provider("openai", "sk-oai"), &request_config(json!({})), false);
        assert_eq!(req.headers()["authorization"], "Bearer sk-oai");
        assert_eq!(req.headers()["content-type"], "application/json");
        assert!(req.headers()["user-agent"]
            .to_str()
            .unwrap()
            .starts_with("ccproxy/"));
    }

    #[test]
    fn test_no_key_means_no_auth_header() {
        let req = build(&provider("ollama", ""), &request_config(json!({})), false);
        assert!(req.headers().get("authorization").is_none());
        assert!(req.headers().get("x-api-key").is_none());
    }

    #[test]
    fn test_streaming_accept_header() {
        let req = build(&provider("openai", "k"), &request_config(json!({})), true);
        assert_eq!(req.headers()["accept"], "text/event-stream");
        let req = build(&provider("openai", "k"), &request_config(json!({})), false);
        assert!(req.headers().get("accept").is_none());
    }

    #[test]
    fn test_overrides_win() {
        let mut rc = request_config(json!({}));
        rc.url = Some("https://other.example.com/custom".into());
        rc.method = Some("PUT".into());
        rc.headers.insert("authorization".into(), "Bearer override".into());
        rc.timeout_ms = Some(1500);

        let req = build(&provider("openai", "sk-oai"), &rc, false);
        assert_eq!(req.url().as_str(), "https://other.example.com/custom");
        assert_eq!(req.method(), Method::PUT);
        assert_eq!(req.headers()["authorization"], "Bearer override");
        assert_eq!(req.timeout(), Some(&Duration::from_millis(1500)));
    }
}
