use crate::AppState;
use axum::Json;
use axum::extract::State;
use axum::response::IntoResponse;
use serde_json::json;

/// Liveness.
pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Readiness and routing introspection: configured providers with circuit
/// state, plus the route table summary.
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let config = state.config.load();
    let breakers = state.pipeline.breaker_states();

    let providers: Vec<_> = config
        .providers
        .iter()
        .map(|p| {
            json!({
                "name": p.name,
                "enabled": p.enabled,
                "models": p.models,
                "circuit": breakers
                    .get(&p.name)
                    .map(|s| s.as_str())
                    .unwrap_or("closed"),
            })
        })
        .collect();

    let routes: serde_json::Map<String, serde_json::Value> = config
        .routes
        .iter()
        .map(|(key, route)| {
            (
                key.clone(),
                json!(format!("{},{}", route.provider, route.model)),
            )
        })
        .collect();

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "providers": providers,
        "routes": routes,
    }))
}
