//! Dialect head for Anthropic-native providers. The client already speaks
//! Anthropic Messages, so both directions are near-passthrough; only
//! proxy-local hint fields are normalized away.

use crate::{RequestOverrides, Transformer};
use ccproxy_core::config::ProviderConfig;
use ccproxy_core::error::ProxyError;
use serde_json::Value;

pub struct AnthropicDialect;

impl Transformer for AnthropicDialect {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn transform_request_in(
        &self,
        doc: &mut Value,
        _provider: &ProviderConfig,
    ) -> Result<Option<RequestOverrides>, ProxyError> {
        if let Some(obj) = doc.as_object_mut() {
            // A boolean `thinking` is a routing hint, not valid upstream
            // schema; the object form passes through untouched.
            if obj.get("thinking").is_some_and(|t| t.is_boolean()) {
                obj.remove("thinking");
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn provider() -> ProviderConfig {
        ProviderConfig {
            name: "anthropic".into(),
            base_url: "https://api.anthropic.com".into(),
            api_key: "k".into(),
            models: vec![],
            enabled: true,
            transformers: vec![],
        }
    }

    #[test]
    fn test_passthrough_keeps_document() {
        let mut doc = json!({
            "model": "claude-3-opus",
            "messages": [{"role": "user", "content": "Hi"}],
            "max_tokens": 100,
        });
        let expected = doc.clone();
        AnthropicDialect
            .transform_request_in(&mut doc, &provider())
            .unwrap();
        assert_eq!(doc, expected);
    }

    #[test]
    fn test_boolean_thinking_hint_is_stripped() {
        let mut doc = json!({"model": "m", "messages": [], "thinking": true});
        AnthropicDialect
            .transform_request_in(&mut doc, &provider())
            .unwrap();
        assert!(doc.get("thinking").is_none());

        let mut doc = json!({
            "model": "m", "messages": [],
            "thinking": {"type": "enabled", "budget_tokens": 4096},
        });
        AnthropicDialect
            .transform_request_in(&mut doc, &provider())
            .unwrap();
        assert_eq!(doc["thinking"]["type"], "enabled");
    }
}
