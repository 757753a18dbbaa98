//! Request routing: a pure function from request shape, token estimate, and
//! policy to a `(provider, model)` decision.

use ccproxy_core::config::{
    Config, ProviderConfig, ROUTE_BACKGROUND, ROUTE_DEFAULT, ROUTE_LONG_CONTEXT, ROUTE_THINK,
    RouteEntry,
};
use ccproxy_core::error::ProxyError;
use serde_json::{Map, Value};

/// Requests estimated above this many input tokens take the `longContext`
/// route. Deliberately coarse; the counter is advisory.
pub const LONG_CONTEXT_TOKEN_THRESHOLD: u64 = 60_000;

/// Model-name prefix that marks cheap background work.
pub const BACKGROUND_MODEL_PREFIX: &str = "claude-3-5-haiku";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteReason {
    Explicit,
    Direct,
    LongContext,
    Background,
    Think,
    Default,
}

impl RouteReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::Direct => "direct",
            Self::LongContext => "longContext",
            Self::Background => "background",
            Self::Think => "think",
            Self::Default => "default",
        }
    }
}

impl std::fmt::Display for RouteReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub provider: String,
    pub model: String,
    /// Route parameters to merge into the request (missing keys only).
    /// Always empty for explicit overrides.
    pub parameters: Map<String, Value>,
    pub reason: RouteReason,
}

/// Select a provider and model. Rules are evaluated in strict order; the
/// first that fires wins:
///
/// 1. explicit `"provider,model"` override
/// 2. route keyed by the exact model name
/// 3. `longContext` when the token estimate exceeds the threshold
/// 4. `background` for the haiku model-name prefix
/// 5. `think` when the request asks for extended reasoning
/// 6. `default`
///
/// Rules 1, 2, and 6 fail when their provider is missing or disabled
/// (explicit intent must not silently degrade); rules 3–5 are skipped when
/// their route is unusable.
pub fn route(doc: &Value, tokens: u64, config: &Config) -> Result<RoutingDecision, ProxyError> {
    let model = doc.get("model").and_then(|m| m.as_str()).unwrap_or_default();

    // 1. Explicit "provider,model" override bypasses parameter injection.
    if let Some((provider, explicit_model)) = model.split_once(',') {
        require_provider(config, provider)?;
        return Ok(RoutingDecision {
            provider: provider.to_string(),
            model: explicit_model.to_string(),
            parameters: Map::new(),
            reason: RouteReason::Explicit,
        });
    }

    // 2. Direct route keyed by the exact model name.
    if let Some(entry) = config.route(model) {
        require_provider(config, &entry.provider)?;
        return Ok(decision_from(entry, RouteReason::Direct));
    }

    // 3. Long context.
    if tokens > LONG_CONTEXT_TOKEN_THRESHOLD
        && let Some(entry) = usable_route(config, ROUTE_LONG_CONTEXT)
    {
        return Ok(decision_from(entry, RouteReason::LongContext));
    }

    // 4. Background.
    if model.starts_with(BACKGROUND_MODEL_PREFIX)
        && let Some(entry) = usable_route(config, ROUTE_BACKGROUND)
    {
        return Ok(decision_from(entry, RouteReason::Background));
    }

    // 5. Thinking.
    if thinking_requested(doc)
        && let Some(entry) = usable_route(config, ROUTE_THINK)
    {
        return Ok(decision_from(entry, RouteReason::Think));
    }

    // 6. Default.
    let entry = config
        .route(ROUTE_DEFAULT)
        .ok_or_else(|| ProxyError::routing("no default route configured"))?;
    require_provider(config, &entry.provider)?;
    Ok(decision_from(entry, RouteReason::Default))
}

/// The extended-reasoning hint: boolean `true` or the Anthropic object form.
fn thinking_requested(doc: &Value) -> bool {
    match doc.get("thinking") {
        Some(Value::Bool(b)) => *b,
        Some(Value::Object(_)) => true,
        _ => false,
    }
}

fn decision_from(entry: &RouteEntry, reason: RouteReason) -> RoutingDecision {
    RoutingDecision {
        provider: entry.provider.clone(),
        model: entry.model.clone(),
        parameters: entry.parameters.clone(),
        reason,
    }
}

fn require_provider<'a>(config: &'a Config, name: &str) -> Result<&'a ProviderConfig, ProxyError> {
    match config.find_provider(name) {
        Some(provider) if provider.enabled => Ok(provider),
        Some(_) => Err(ProxyError::routing(format!("provider {name} is disabled"))),
        None => Err(ProxyError::routing(format!("unknown provider: {name}"))),
    }
}

fn usable_route<'a>(config: &'a Config, key: &str) -> Option<&'a RouteEntry> {
    let entry = config.route(key)?;
    config
        .find_provider(&entry.provider)
        .filter(|p| p.enabled)
        .map(|_| entry)
}
