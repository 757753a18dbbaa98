pub mod anthropic;
pub mod gemini;
pub mod maxtoken;
pub mod openai;
pub mod parameters;
pub mod tooluse;

use ccproxy_core::config::{ProviderConfig, TransformerSpec};
use ccproxy_core::error::{ErrorKind, ProxyError};
use ccproxy_core::sse::SseEvent;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

// ─── Transformer contract ──────────────────────────────────────────────────

/// HTTP-level overrides a transformer may attach to the outbound request.
#[derive(Debug, Clone, Default)]
pub struct RequestOverrides {
    pub url: Option<String>,
    pub method: Option<String>,
    pub headers: HashMap<String, String>,
    pub timeout_ms: Option<u64>,
}

/// Product of the request-in chain: the rewritten body plus accumulated
/// overrides for URL, method, headers, and per-attempt timeout.
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub body: Value,
    pub url: Option<String>,
    pub method: Option<String>,
    pub headers: HashMap<String, String>,
    pub timeout_ms: Option<u64>,
}

impl RequestConfig {
    fn from_body(body: Value) -> Self {
        Self {
            body,
            url: None,
            method: None,
            headers: HashMap::new(),
            timeout_ms: None,
        }
    }

    fn apply(&mut self, overrides: RequestOverrides) {
        if overrides.url.is_some() {
            self.url = overrides.url;
        }
        if overrides.method.is_some() {
            self.method = overrides.method;
        }
        self.headers.extend(overrides.headers);
        if overrides.timeout_ms.is_some() {
            self.timeout_ms = overrides.timeout_ms;
        }
    }
}

/// Mutable per-stream translation state threaded through stream-chunk hooks.
/// One instance lives per relayed response stream.
#[derive(Debug, Default)]
pub struct StreamContext {
    pub message_id: String,
    pub model: String,
    pub started: bool,
    /// Index of the currently open content block, -1 before the first.
    pub content_index: i64,
    pub block_open: bool,
    pub block_is_tool: bool,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tool_use_seen: bool,
    pub finish_emitted: bool,
}

impl StreamContext {
    pub fn new() -> Self {
        Self {
            content_index: -1,
            ..Default::default()
        }
    }
}

/// A named, bidirectional rewrite step. Hooks default to passthrough so an
/// implementation overrides only the directions it participates in.
pub trait Transformer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Client dialect → provider dialect, mutating the request document in
    /// place. May attach HTTP overrides for the outbound request.
    fn transform_request_in(
        &self,
        doc: &mut Value,
        provider: &ProviderConfig,
    ) -> Result<Option<RequestOverrides>, ProxyError> {
        let _ = (doc, provider);
        Ok(None)
    }

    /// Provider response → intermediate form, before response-in.
    fn transform_request_out(&self, resp: &mut Value) -> Result<(), ProxyError> {
        let _ = resp;
        Ok(())
    }

    /// Provider-side response adjustments.
    fn transform_response_in(&self, resp: &mut Value) -> Result<(), ProxyError> {
        let _ = resp;
        Ok(())
    }

    /// Provider dialect → client dialect.
    fn transform_response_out(&self, resp: &mut Value) -> Result<(), ProxyError> {
        let _ = resp;
        Ok(())
    }

    /// Rewrite one upstream SSE frame. Return the frame unchanged, an empty
    /// vec to drop it, or several frames to split it.
    fn transform_stream_chunk(
        &self,
        event: SseEvent,
        ctx: &mut StreamContext,
    ) -> Result<Vec<SseEvent>, ProxyError> {
        let _ = ctx;
        Ok(vec![event])
    }

    /// Whether this transformer rewrites stream frames at all. A chain with
    /// no stream participants can relay upstream bytes verbatim.
    fn transforms_stream(&self) -> bool {
        false
    }
}

// ─── Registry ──────────────────────────────────────────────────────────────

type TransformerFactory = fn(&Value) -> Result<Arc<dyn Transformer>, ProxyError>;

/// Immutable-after-init table of transformer constructors, keyed by the
/// stable names used in provider configuration.
pub struct TransformerRegistry {
    factories: HashMap<&'static str, TransformerFactory>,
}

impl Default for TransformerRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl TransformerRegistry {
    pub fn builtin() -> Self {
        let mut factories: HashMap<&'static str, TransformerFactory> = HashMap::new();
        factories.insert("anthropic", |_| Ok(Arc::new(anthropic::AnthropicDialect)));
        factories.insert("openai", |_| Ok(Arc::new(openai::OpenAiDialect)));
        factories.insert("gemini", |_| Ok(Arc::new(gemini::GeminiDialect)));
        factories.insert("maxtoken", |opts| {
            Ok(Arc::new(maxtoken::MaxToken::from_options(opts)))
        });
        factories.insert("parameters", |opts| {
            Ok(Arc::new(parameters::Parameters::from_options(opts)))
        });
        factories.insert("tooluse", |_| Ok(Arc::new(tooluse::ToolUse)));
        factories.insert("enhancetool", |_| Ok(Arc::new(tooluse::EnhanceTool)));
        Self { factories }
    }

    pub fn build(&self, spec: &TransformerSpec) -> Result<Arc<dyn Transformer>, ProxyError> {
        let factory = self.factories.get(spec.name.as_str()).ok_or_else(|| {
            ProxyError::new(
                ErrorKind::Config,
                format!("unknown transformer: {}", spec.name),
            )
        })?;
        factory(&spec.options)
    }

    /// Build the ordered chain for a provider. An empty configured list
    /// selects the default chain for the provider family.
    pub fn chain_for(&self, provider: &ProviderConfig) -> Result<TransformerChain, ProxyError> {
        let specs = if provider.transformers.is_empty() {
            default_chain(&provider.name)
        } else {
            provider.transformers.clone()
        };
        let entries = specs
            .iter()
            .map(|spec| self.build(spec))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(TransformerChain { entries })
    }
}

/// Default chain by provider family: dialect head, then token and parameter
/// hygiene. The family is inferred from the provider name.
fn default_chain(provider_name: &str) -> Vec<TransformerSpec> {
    let head = match provider_name {
        "anthropic" => "anthropic",
        "gemini" => "gemini",
        _ => "openai",
    };
    vec![
        TransformerSpec::new(head),
        TransformerSpec::new("maxtoken"),
        TransformerSpec::new("parameters"),
    ]
}

// ─── Chain ─────────────────────────────────────────────────────────────────

/// Ordered transformer sequence for one provider. Requests traverse
/// head→tail; responses and stream frames traverse tail→head so each
/// transformer sees a matched pair of dialects.
pub struct TransformerChain {
    entries: Vec<Arc<dyn Transformer>>,
}

impl std::fmt::Debug for TransformerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformerChain")
            .field("entries", &self.names())
            .finish()
    }
}

impl TransformerChain {
    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|t| t.name()).collect()
    }

    pub fn transform_request_in(
        &self,
        mut doc: Value,
        provider: &ProviderConfig,
    ) -> Result<RequestConfig, ProxyError> {
        let mut overrides = Vec::new();
        for transformer in &self.entries {
            if let Some(o) = transformer.transform_request_in(&mut doc, provider)? {
                overrides.push(o);
            }
        }
        let mut config = RequestConfig::from_body(doc);
        for o in overrides {
            config.apply(o);
        }
        Ok(config)
    }

    pub fn transform_response_out(&self, resp: &mut Value) -> Result<(), ProxyError> {
        for transformer in self.entries.iter().rev() {
            transformer.transform_request_out(resp)?;
            transformer.transform_response_in(resp)?;
            transformer.transform_response_out(resp)?;
        }
        Ok(())
    }

    /// Whether any entry rewrites stream frames; when false the relay may
    /// copy upstream bytes verbatim.
    pub fn has_stream_transforms(&self) -> bool {
        self.entries.iter().any(|t| t.transforms_stream())
    }

    pub fn transform_stream_chunk(
        &self,
        event: SseEvent,
        ctx: &mut StreamContext,
    ) -> Result<Vec<SseEvent>, ProxyError> {
        let mut events = vec![event];
        for transformer in self.entries.iter().rev() {
            let mut next = Vec::new();
            for event in events {
                next.extend(transformer.transform_stream_chunk(event, ctx)?);
            }
            events = next;
            if events.is_empty() {
                break;
            }
        }
        Ok(events)
    }
}
