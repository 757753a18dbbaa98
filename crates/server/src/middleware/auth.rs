use crate::AppState;
use axum::{extract::Request, extract::State, middleware::Next, response::Response};
use ccproxy_core::context::RequestContext;
use ccproxy_core::error::ProxyError;

/// Inbound authentication.
///
/// With `security.api-key` configured, the client must present it via
/// `Authorization: Bearer` or `x-api-key`. Without a key, only loopback
/// clients (plus any `security.ip-allowlist` entries) are accepted.
pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ProxyError> {
    let config = state.config.load();

    match &config.security.api_key {
        Some(expected) => {
            let token = request
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .or_else(|| {
                    request
                        .headers()
                        .get("x-api-key")
                        .and_then(|v| v.to_str().ok())
                });
            if token != Some(expected.as_str()) {
                return Err(unauthorized(&request, "invalid API key"));
            }
        }
        None => {
            let client_ip = request
                .extensions()
                .get::<RequestContext>()
                .and_then(|ctx| ctx.client_ip.clone());
            let allowed = match client_ip.as_deref() {
                // No forwarding headers: a direct local connection.
                None => true,
                Some(ip) => {
                    is_loopback(ip) || config.security.ip_allowlist.iter().any(|a| a == ip)
                }
            };
            if !allowed {
                return Err(unauthorized(
                    &request,
                    "no API key configured; refusing non-loopback origin",
                ));
            }
        }
    }

    Ok(next.run(request).await)
}

fn unauthorized(request: &Request, message: &str) -> ProxyError {
    let mut err = ProxyError::unauthorized(message);
    if let Some(ctx) = request.extensions().get::<RequestContext>() {
        err = err.with_request_id(&ctx.request_id);
    }
    err
}

fn is_loopback(ip: &str) -> bool {
    ip.parse::<std::net::IpAddr>()
        .map(|addr| addr.is_loopback())
        .unwrap_or(ip == "localhost")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_detection() {
        assert!(is_loopback("127.0.0.1"));
        assert!(is_loopback("::1"));
        assert!(is_loopback("localhost"));
        assert!(!is_loopback("10.0.0.4"));
        assert!(!is_loopback("not-an-ip"));
    }
}
