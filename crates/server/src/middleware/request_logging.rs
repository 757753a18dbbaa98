use axum::{extract::Request, middleware::Next, response::Response};
use ccproxy_core::context::RequestContext;

/// One structured log event per request: method, path, status, latency,
/// request id. Emitted after the response headers are decided; streaming
/// bodies keep flowing afterwards.
pub async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let ctx = request.extensions().get::<RequestContext>().cloned();

    let response = next.run(request).await;

    let (request_id, elapsed_ms) = match &ctx {
        Some(ctx) => (ctx.request_id.as_str(), ctx.elapsed_ms()),
        None => ("", 0),
    };
    tracing::info!(
        %method,
        path,
        status = response.status().as_u16(),
        elapsed_ms,
        request_id,
        "request"
    );
    response
}
