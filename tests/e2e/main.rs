//! End-to-end scenarios: the full axum surface driven against a stub
//! upstream provider bound on a loopback listener.

use arc_swap::ArcSwap;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode, header};
use axum::response::IntoResponse;
use ccproxy_core::config::{Config, ProviderConfig, RouteEntry};
use ccproxy_provider::pipeline::Pipeline;
use ccproxy_server::AppState;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tower::ServiceExt;

#[derive(Clone, Default)]
struct Captured {
    requests: Arc<Mutex<Vec<(HeaderMap, Value)>>>,
    hits: Arc<AtomicU32>,
}

impl Captured {
    fn record(&self, headers: HeaderMap, body: Value) {
        self.hits.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push((headers, body));
    }

    fn last(&self) -> (HeaderMap, Value) {
        self.requests.lock().unwrap().last().cloned().unwrap()
    }
}

async fn spawn_upstream(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn provider(name: &str, base_url: &str, api_key: &str) -> ProviderConfig {
    ProviderConfig {
        name: name.into(),
        base_url: base_url.into(),
        api_key: api_key.into(),
        models: vec![],
        enabled: true,
        transformers: vec![],
    }
}

fn route_entry(provider: &str, model: &str) -> RouteEntry {
    RouteEntry {
        provider: provider.into(),
        model: model.into(),
        parameters: Default::default(),
    }
}

fn proxy_config(providers: Vec<ProviderConfig>, default_route: RouteEntry) -> Config {
    let mut config = Config {
        providers,
        ..Config::default()
    };
    config.routes.insert("default".into(), default_route);
    // Keep test retries fast.
    config.performance.retry.initial_delay = 1;
    config.performance.retry.max_delay = 5;
    config.performance.retry.jitter = false;
    config
}

fn build_proxy(config: Config) -> axum::Router {
    let config = Arc::new(ArcSwap::from_pointee(config));
    let pipeline = Arc::new(Pipeline::new(config.clone()).unwrap());
    ccproxy_server::build_router(AppState {
        config,
        pipeline,
        start_time: Instant::now(),
    })
}

async fn post_messages(proxy: &axum::Router, body: Value) -> axum::response::Response {
    let request = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    proxy.clone().oneshot(request).await.unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

// ─── S1: default OpenAI route, non-streaming ───────────────────────────────

#[tokio::test]
async fn test_default_openai_route_non_streaming() {
    let captured = Captured::default();
    let upstream = axum::Router::new()
        .route(
            "/v1/chat/completions",
            axum::routing::post(
                |State(captured): State<Captured>, headers: HeaderMap, body: String| async move {
                    captured.record(headers, serde_json::from_str(&body).unwrap());
                    axum::Json(json!({
                        "id": "cmpl-1",
                        "object": "chat.completion",
                        "model": "gpt-4",
                        "choices": [{
                            "index": 0,
                            "message": {"role": "assistant", "content": "Hello"},
                            "finish_reason": "stop",
                        }],
                        "usage": {"prompt_tokens": 2, "completion_tokens": 1, "total_tokens": 3},
                    }))
                },
            ),
        )
        .with_state(captured.clone());
    let base_url = spawn_upstream(upstream).await;

    let proxy = build_proxy(proxy_config(
        vec![provider("openai", &base_url, "sk-test")],
        route_entry("openai", "gpt-4"),
    ));

    let response = post_messages(
        &proxy,
        json!({"model": "gpt-4", "messages": [{"role": "user", "content": "Hi"}]}),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));

    let body = body_json(response).await;
    assert_eq!(body["type"], "message");
    assert_eq!(body["role"], "assistant");
    assert_eq!(body["content"], json!([{"type": "text", "text": "Hello"}]));
    assert_eq!(body["stop_reason"], "end_turn");
    assert_eq!(body["usage"]["input_tokens"], 2);
    assert_eq!(body["usage"]["output_tokens"], 1);

    let (headers, outbound) = captured.last();
    assert_eq!(headers["authorization"], "Bearer sk-test");
    assert_eq!(headers["content-type"], "application/json");
    assert_eq!(outbound["model"], "gpt-4");
    assert_eq!(outbound["messages"][0]["role"], "user");
    assert_eq!(outbound["messages"][0]["content"], "Hi");
    // maxtoken injected its default.
    assert!(outbound["max_tokens"].as_u64().unwrap() > 0);
}

// ─── S3/S4: explicit override, streaming pass-through ──────────────────────

const ANTHROPIC_FRAMES: &str = concat!(
    "event: message_start\ndata: {\"type\":\"message_start\"}\n\n",
    "event: content_block_delta\ndata: {\"delta\":{\"type\":\"text_delta\",\"text\":\"He\"}}\n\n",
    "event: content_block_delta\ndata: {\"delta\":{\"type\":\"text_delta\",\"text\":\"llo\"}}\n\n",
    "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
    "data: [DONE]\n\n",
);

#[tokio::test]
async fn test_streaming_passthrough_to_anthropic() {
    let captured = Captured::default();
    let upstream = axum::Router::new()
        .route(
            "/v1/messages",
            axum::routing::post(
                |State(captured): State<Captured>, headers: HeaderMap, body: String| async move {
                    captured.record(headers, serde_json::from_str(&body).unwrap());
                    (
                        [(header::CONTENT_TYPE, "text/event-stream")],
                        ANTHROPIC_FRAMES,
                    )
                },
            ),
        )
        .with_state(captured.clone());
    let base_url = spawn_upstream(upstream).await;

    let proxy = build_proxy(proxy_config(
        vec![provider("anthropic", &base_url, "sk-ant-test")],
        route_entry("anthropic", "claude-3-opus"),
    ));

    // Explicit "provider,model" override selects anthropic verbatim.
    let response = post_messages(
        &proxy,
        json!({
            "model": "anthropic,claude-3-haiku",
            "messages": [{"role": "user", "content": "Hi"}],
            "max_tokens": 64,
            "stream": true,
        }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/event-stream"
    );
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");

    let body = body_string(response).await;
    assert_eq!(body, ANTHROPIC_FRAMES);

    let (headers, outbound) = captured.last();
    assert_eq!(headers["x-api-key"], "sk-ant-test");
    assert_eq!(headers["anthropic-version"], "2023-06-01");
    assert_eq!(headers["accept"], "text/event-stream");
    assert_eq!(outbound["model"], "claude-3-haiku");
}

// ─── Streaming translation: OpenAI chunks → Anthropic events ───────────────

const OPENAI_CHUNKS: &str = concat!(
    "data: {\"id\":\"c1\",\"model\":\"gpt-4\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"He\"}}]}\n\n",
    "data: {\"id\":\"c1\",\"model\":\"gpt-4\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"llo\"}}]}\n\n",
    "data: {\"id\":\"c1\",\"model\":\"gpt-4\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}],\"usage\":{\"prompt_tokens\":2,\"completion_tokens\":1}}\n\n",
    "data: [DONE]\n\n",
);

#[tokio::test]
async fn test_streaming_translation_from_openai() {
    let upstream = axum::Router::new().route(
        "/v1/chat/completions",
        axum::routing::post(|| async {
            ([(header::CONTENT_TYPE, "text/event-stream")], OPENAI_CHUNKS)
        }),
    );
    let base_url = spawn_upstream(upstream).await;

    let proxy = build_proxy(proxy_config(
        vec![provider("openai", &base_url, "sk-test")],
        route_entry("openai", "gpt-4"),
    ));

    let response = post_messages(
        &proxy,
        json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "Hi"}],
            "stream": true,
        }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;

    assert!(body.contains("event: message_start"));
    assert!(body.contains("event: content_block_start"));
    assert!(body.contains("\"text\":\"He\""));
    assert!(body.contains("\"text\":\"llo\""));
    assert!(body.contains("event: message_delta"));
    assert!(body.contains("\"stop_reason\":\"end_turn\""));
    assert!(body.contains("event: message_stop"));
    assert!(body.trim_end().ends_with("data: [DONE]"));
}

// ─── S5: rate-limit retry ──────────────────────────────────────────────────

#[tokio::test]
async fn test_retry_on_rate_limit() {
    let captured = Captured::default();
    let upstream = axum::Router::new()
        .route(
            "/v1/chat/completions",
            axum::routing::post(
                |State(captured): State<Captured>, headers: HeaderMap, body: String| async move {
                    captured.record(headers, serde_json::from_str(&body).unwrap());
                    if captured.hits.load(Ordering::SeqCst) == 1 {
                        (
                            StatusCode::TOO_MANY_REQUESTS,
                            [(header::RETRY_AFTER, "0")],
                            json!({"error": {"type": "rate_limit_error", "message": "slow down"}})
                                .to_string(),
                        )
                            .into_response()
                    } else {
                        axum::Json(json!({
                            "id": "cmpl-2",
                            "model": "gpt-4",
                            "choices": [{
                                "message": {"role": "assistant", "content": "ok"},
                                "finish_reason": "stop",
                            }],
                            "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2},
                        }))
                        .into_response()
                    }
                },
            ),
        )
        .with_state(captured.clone());
    let base_url = spawn_upstream(upstream).await;

    let proxy = build_proxy(proxy_config(
        vec![provider("openai", &base_url, "sk-test")],
        route_entry("openai", "gpt-4"),
    ));

    let response = post_messages(
        &proxy,
        json!({"model": "gpt-4", "messages": [{"role": "user", "content": "Hi"}]}),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["content"][0]["text"], "ok");
    assert_eq!(captured.hits.load(Ordering::SeqCst), 2);
}

// ─── S6: circuit opens after repeated upstream failures ────────────────────

#[tokio::test]
async fn test_circuit_opens_after_failures() {
    let captured = Captured::default();
    let upstream = axum::Router::new()
        .route(
            "/v1/chat/completions",
            axum::routing::post(
                |State(captured): State<Captured>, headers: HeaderMap, body: String| async move {
                    captured.record(headers, serde_json::from_str(&body).unwrap());
                    (
                        StatusCode::SERVICE_UNAVAILABLE,
                        json!({"error": {"type": "overloaded", "message": "down"}}).to_string(),
                    )
                },
            ),
        )
        .with_state(captured.clone());
    let base_url = spawn_upstream(upstream).await;

    let mut config = proxy_config(
        vec![provider("openai", &base_url, "sk-test")],
        route_entry("openai", "gpt-4"),
    );
    config.performance.circuit_breaker.threshold = 2;
    let proxy = build_proxy(config);

    let request = json!({"model": "gpt-4", "messages": [{"role": "user", "content": "Hi"}]});

    // First request: two failing attempts trip the breaker, the third
    // short-circuits with the open-circuit error.
    let response = post_messages(&proxy, request.clone()).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "service_unavailable");
    assert_eq!(body["error"]["details"]["circuit"], "openai");
    assert_eq!(body["error"]["details"]["state"], "open");
    let hits_after_first = captured.hits.load(Ordering::SeqCst);
    assert_eq!(hits_after_first, 2);

    // Second request: the breaker is open, the network is never touched.
    let response = post_messages(&proxy, request).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["error"]["details"]["state"], "open");
    assert_eq!(captured.hits.load(Ordering::SeqCst), hits_after_first);
}

// ─── Error surface ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_routing_error_envelope() {
    let mut config = Config::default();
    config.providers.push(provider(
        "openai",
        "http://127.0.0.1:9",
        "sk-test",
    ));
    // No routes at all: routing must fail fast.
    let proxy = build_proxy(config);

    let response = post_messages(
        &proxy,
        json!({"model": "gpt-4", "messages": [{"role": "user", "content": "Hi"}]}),
    )
    .await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "routing_error");
    assert!(body["error"]["request_id"].as_str().is_some());
}

#[tokio::test]
async fn test_bad_request_envelope() {
    let proxy = build_proxy(proxy_config(
        vec![provider("openai", "http://127.0.0.1:9", "sk-test")],
        route_entry("openai", "gpt-4"),
    ));

    let response = post_messages(&proxy, json!({"messages": []})).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "bad_request");
}

#[tokio::test]
async fn test_health_and_status() {
    let proxy = build_proxy(proxy_config(
        vec![provider("openai", "http://127.0.0.1:9", "sk-test")],
        route_entry("openai", "gpt-4"),
    ));

    let response = proxy
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");

    let response = proxy
        .clone()
        .oneshot(
            Request::builder()
                .uri("/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["providers"][0]["name"], "openai");
    assert_eq!(body["routes"]["default"], "openai,gpt-4");
}
