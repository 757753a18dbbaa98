//! Token-limit hygiene: guarantees `max_tokens` on the way out and a
//! complete usage total on the way back.

use crate::{RequestOverrides, Transformer};
use ccproxy_core::config::ProviderConfig;
use ccproxy_core::error::ProxyError;
use serde_json::{Value, json};

const FALLBACK_MAX_TOKENS: u64 = 8192;

pub struct MaxToken {
    /// Injected when the request carries no limit.
    default: u64,
    /// Ceiling applied when the request asks for more.
    max: Option<u64>,
}

impl MaxToken {
    pub fn from_options(options: &Value) -> Self {
        let max = options.get("max").and_then(|v| v.as_u64());
        let default = options
            .get("default")
            .and_then(|v| v.as_u64())
            .or(max)
            .unwrap_or(FALLBACK_MAX_TOKENS);
        Self { default, max }
    }
}

impl Transformer for MaxToken {
    fn name(&self) -> &'static str {
        "maxtoken"
    }

    fn transform_request_in(
        &self,
        doc: &mut Value,
        _provider: &ProviderConfig,
    ) -> Result<Option<RequestOverrides>, ProxyError> {
        // Runs after the dialect head, so the limit may live at the top
        // level (OpenAI/Anthropic) or under generationConfig (Gemini).
        let slot = if doc.get("generationConfig").is_some() {
            &mut doc["generationConfig"]["maxOutputTokens"]
        } else {
            &mut doc["max_tokens"]
        };

        match slot.as_u64() {
            None => *slot = json!(self.default),
            Some(requested) => {
                if let Some(max) = self.max
                    && requested > max
                {
                    *slot = json!(max);
                }
            }
        }
        Ok(None)
    }

    fn transform_response_out(&self, resp: &mut Value) -> Result<(), ProxyError> {
        let Some(usage) = resp.get_mut("usage").and_then(|u| u.as_object_mut()) else {
            return Ok(());
        };
        if usage.contains_key("total_tokens") {
            return Ok(());
        }
        let input = usage
            .get("input_tokens")
            .or_else(|| usage.get("prompt_tokens"))
            .and_then(|v| v.as_u64());
        let output = usage
            .get("output_tokens")
            .or_else(|| usage.get("completion_tokens"))
            .and_then(|v| v.as_u64());
        if let (Some(input), Some(output)) = (input, output) {
            usage.insert("total_tokens".to_string(), json!(input + output));
        }
        Ok(())
    }
}
