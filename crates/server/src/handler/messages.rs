use crate::AppState;
use crate::streaming;
use axum::Extension;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use ccproxy_core::context::RequestContext;
use ccproxy_core::error::ProxyError;
use ccproxy_provider::pipeline::UpstreamBody;
use tokio_util::sync::CancellationToken;

/// Primary translation endpoint (`POST /v1/messages`). Accepts an Anthropic
/// Messages body and honors its `stream` field.
pub async fn messages(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let parsed = super::parse_request(&body).map_err(|e| e.with_request_id(&ctx.request_id))?;

    let config = state.config.load();
    let error_budget = config.performance.stream_error_budget;
    let timeout = config.request_timeout();
    drop(config);

    // One cancellation signal covers retry sleeps, the outbound attempt, and
    // the relay. The watchdog turns the request deadline into a cancel.
    let cancel = CancellationToken::new();
    let watchdog = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => watchdog.cancel(),
            _ = watchdog.cancelled() => {}
        }
    });

    let response = state.pipeline.handle(&ctx, parsed.doc, &cancel).await;

    match response {
        Ok(outcome) => match outcome.body {
            UpstreamBody::Json(value) => {
                cancel.cancel();
                Ok((
                    StatusCode::OK,
                    [(header::CONTENT_TYPE, "application/json")],
                    value.to_string(),
                )
                    .into_response())
            }
            UpstreamBody::Events(events) => {
                Ok(streaming::relay_events(events, error_budget, cancel))
            }
            UpstreamBody::Raw(bytes) => Ok(streaming::relay_raw(bytes, error_budget, cancel)),
        },
        Err(e) => {
            cancel.cancel();
            Err(e)
        }
    }
}
