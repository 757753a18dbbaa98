//! The forwarding pipeline: routing → transform-in → outbound dispatch with
//! retry and circuit breaking → transform-out or stream handoff.

use crate::client::BreakerRegistry;
use crate::endpoint;
use crate::router::{RouteReason, route};
use crate::sse::{ByteStream, EventStream, parse_sse_stream, passthrough_stream};
use arc_swap::ArcSwap;
use ccproxy_core::breaker::CircuitState;
use ccproxy_core::config::{Config, ProviderConfig};
use ccproxy_core::context::RequestContext;
use ccproxy_core::error::ProxyError;
use ccproxy_core::sse::SseEvent;
use ccproxy_core::tokens::estimate_request_tokens;
use ccproxy_transform::{StreamContext, TransformerChain, TransformerRegistry};
use serde_json::{Map, Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

/// What came back from upstream, post-transformation.
pub enum UpstreamBody {
    /// Rewritten non-streaming response.
    Json(Value),
    /// Per-event rewritten SSE stream.
    Events(EventStream),
    /// Verbatim SSE bytes; the chain had no stream participants.
    Raw(ByteStream),
}

/// Outcome of one forwarded request; owns the upstream body until relayed.
pub struct ResponseContext {
    pub provider: String,
    pub model: String,
    pub token_count: u64,
    pub routing_reason: RouteReason,
    pub body: UpstreamBody,
}

pub struct Pipeline {
    config: Arc<ArcSwap<Config>>,
    registry: TransformerRegistry,
    client: reqwest::Client,
    breakers: BreakerRegistry,
}

impl Pipeline {
    pub fn new(config: Arc<ArcSwap<Config>>) -> Result<Self, ProxyError> {
        let client = crate::client::build_http_client(config.load().proxy_url.as_deref())?;
        Ok(Self {
            config,
            registry: TransformerRegistry::builtin(),
            client,
            breakers: BreakerRegistry::new(),
        })
    }

    /// Circuit state per provider, for the status endpoint.
    pub fn breaker_states(&self) -> HashMap<String, CircuitState> {
        self.breakers.states()
    }

    /// Drive one request through the full pipeline. Every error surfaces
    /// with the request id attached.
    pub async fn handle(
        &self,
        ctx: &RequestContext,
        doc: Value,
        cancel: &CancellationToken,
    ) -> Result<ResponseContext, ProxyError> {
        let config = self.config.load_full();
        self.run(&config, doc, cancel)
            .await
            .map_err(|e| e.with_request_id(&ctx.request_id))
    }

    async fn run(
        &self,
        config: &Config,
        mut doc: Value,
        cancel: &CancellationToken,
    ) -> Result<ResponseContext, ProxyError> {
        let streaming = doc.get("stream").and_then(|s| s.as_bool()).unwrap_or(false);
        let token_count = estimate_request_tokens(&doc);

        let decision = route(&doc, token_count, config)?;
        let provider = load_provider(config, &decision.provider)?;
        if !provider.allows_model(&decision.model) {
            return Err(ProxyError::routing(format!(
                "provider {} does not serve model {}",
                provider.name, decision.model
            )));
        }

        tracing::info!(
            provider = %decision.provider,
            model = %decision.model,
            reason = %decision.reason,
            tokens = token_count,
            streaming,
            "routed request"
        );

        // Route parameters fill in only what the request left unset; an
        // explicit override bypasses injection entirely.
        if decision.reason != RouteReason::Explicit {
            merge_missing_keys(&mut doc, &decision.parameters);
        }
        doc["model"] = json!(decision.model.clone());

        let chain = Arc::new(self.registry.chain_for(provider)?);
        let request = chain.transform_request_in(doc, provider)?;
        let request = &request;

        let breaker_enabled = config.performance.circuit_breaker.enabled;
        let breaker = breaker_enabled
            .then(|| self.breakers.get_or_create(&provider.name, config.breaker_config()));
        let retry = config.retry_policy();

        let response = retry
            .execute(cancel, || {
                let breaker = breaker.clone();
                async move {
                    match breaker {
                        Some(b) => {
                            b.execute(|| self.send_once(provider, request, streaming, cancel))
                                .await
                        }
                        None => self.send_once(provider, request, streaming, cancel).await,
                    }
                }
            })
            .await?;

        let body = if streaming {
            let bytes = response.bytes_stream();
            if chain.has_stream_transforms() {
                UpstreamBody::Events(transform_event_stream(parse_sse_stream(bytes), chain))
            } else {
                UpstreamBody::Raw(passthrough_stream(bytes))
            }
        } else {
            let mut value: Value = response
                .json()
                .await
                .map_err(|e| ProxyError::transform(format!("invalid upstream JSON: {e}")))?;
            chain.transform_response_out(&mut value)?;
            UpstreamBody::Json(value)
        };

        Ok(ResponseContext {
            provider: decision.provider,
            model: decision.model,
            token_count,
            routing_reason: decision.reason,
            body,
        })
    }

    /// One outbound attempt: build, send, classify. Cancellation closes the
    /// attempt and is not retryable.
    async fn send_once(
        &self,
        provider: &ProviderConfig,
        request: &ccproxy_transform::RequestConfig,
        streaming: bool,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, ProxyError> {
        let builder = endpoint::build_request(&self.client, provider, request, streaming)?;

        let send = async {
            let response = builder
                .send()
                .await
                .map_err(|e| ProxyError::from(e).with_provider(&provider.name))?;
            let status = response.status().as_u16();
            if status >= 400 {
                let headers = crate::extract_headers(&response);
                let retry_after = crate::parse_retry_after(&headers);
                let body = response.bytes().await.unwrap_or_default();
                return Err(ProxyError::from_upstream(
                    &provider.name,
                    status,
                    &body,
                    retry_after,
                ));
            }
            Ok(response)
        };

        tokio::select! {
            result = send => result,
            _ = cancel.cancelled() => {
                Err(ProxyError::gateway_timeout("request cancelled").with_retryable(false))
            }
        }
    }
}

fn load_provider<'a>(config: &'a Config, name: &str) -> Result<&'a ProviderConfig, ProxyError> {
    match config.find_provider(name) {
        Some(provider) if provider.enabled => Ok(provider),
        Some(_) => Err(ProxyError::routing(format!("provider {name} is disabled"))),
        None => Err(ProxyError::routing(format!("unknown provider: {name}"))),
    }
}

/// Deep-merge route parameters into the document for keys the request does
/// not already define; existing values always win.
fn merge_missing_keys(doc: &mut Value, parameters: &Map<String, Value>) {
    let Some(obj) = doc.as_object_mut() else {
        return;
    };
    merge_into(obj, parameters);
}

fn merge_into(target: &mut Map<String, Value>, source: &Map<String, Value>) {
    for (key, value) in source {
        match target.get_mut(key) {
            None => {
                target.insert(key.clone(), value.clone());
            }
            Some(existing) => {
                if let (Some(existing_obj), Some(value_obj)) =
                    (existing.as_object_mut(), value.as_object())
                {
                    merge_into(existing_obj, value_obj);
                }
                // Scalars and arrays already present are kept.
            }
        }
    }
}

/// Apply the chain's stream hooks over upstream events, flattening splits
/// and ending after a `[DONE]` sentinel has been flushed.
fn transform_event_stream(upstream: EventStream, chain: Arc<TransformerChain>) -> EventStream {
    struct RelayState {
        upstream: EventStream,
        chain: Arc<TransformerChain>,
        ctx: StreamContext,
        queue: VecDeque<SseEvent>,
        done: bool,
    }

    let stream = futures::stream::unfold(
        RelayState {
            upstream,
            chain,
            ctx: StreamContext::new(),
            queue: VecDeque::new(),
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(event) = state.queue.pop_front() {
                    return Some((Ok(event), state));
                }
                if state.done {
                    return None;
                }
                match state.upstream.next().await {
                    Some(Ok(event)) => {
                        match state.chain.transform_stream_chunk(event, &mut state.ctx) {
                            Ok(events) => {
                                for event in events {
                                    if event.is_empty() {
                                        continue;
                                    }
                                    if event.is_done() {
                                        state.done = true;
                                    }
                                    state.queue.push_back(event);
                                }
                            }
                            Err(e) => return Some((Err(e), state)),
                        }
                    }
                    Some(Err(e)) => return Some((Err(e), state)),
                    None => state.done = true,
                }
            }
        },
    );
    Box::pin(stream)
}
