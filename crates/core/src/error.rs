use crate::sanitize::sanitize_message;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::time::Duration;

/// Classified error kinds understood by retries, breakers, and clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    Conflict,
    UnprocessableEntity,
    TooManyRequests,
    Internal,
    NotImplemented,
    BadGateway,
    ServiceUnavailable,
    GatewayTimeout,
    Provider,
    Transform,
    Routing,
    Streaming,
    Config,
    Validation,
    RateLimit,
    Proxy,
    Tool,
    ResourceExhausted,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::MethodNotAllowed => "method_not_allowed",
            Self::Conflict => "conflict",
            Self::UnprocessableEntity => "unprocessable_entity",
            Self::TooManyRequests => "too_many_requests",
            Self::Internal => "internal",
            Self::NotImplemented => "not_implemented",
            Self::BadGateway => "bad_gateway",
            Self::ServiceUnavailable => "service_unavailable",
            Self::GatewayTimeout => "gateway_timeout",
            Self::Provider => "provider_error",
            Self::Transform => "transform_error",
            Self::Routing => "routing_error",
            Self::Streaming => "streaming_error",
            Self::Config => "config_error",
            Self::Validation => "validation_error",
            Self::RateLimit => "rate_limit",
            Self::Proxy => "proxy_error",
            Self::Tool => "tool_error",
            Self::ResourceExhausted => "resource_exhausted",
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::BadRequest | Self::Validation => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::Conflict => StatusCode::CONFLICT,
            Self::UnprocessableEntity | Self::Tool => StatusCode::UNPROCESSABLE_ENTITY,
            Self::TooManyRequests | Self::RateLimit | Self::ResourceExhausted => {
                StatusCode::TOO_MANY_REQUESTS
            }
            Self::Internal | Self::Transform | Self::Routing | Self::Streaming | Self::Config => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            Self::BadGateway | Self::Provider | Self::Proxy => StatusCode::BAD_GATEWAY,
            Self::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Whether errors of this kind are retried unless overridden per-error.
    pub fn default_retryable(&self) -> bool {
        matches!(
            self,
            Self::TooManyRequests
                | Self::RateLimit
                | Self::ResourceExhausted
                | Self::BadGateway
                | Self::Provider
                | Self::Proxy
                | Self::ServiceUnavailable
                | Self::GatewayTimeout
                | Self::Internal
        )
    }

    /// Canonical kind for an upstream HTTP status. Statuses with several
    /// associated kinds map to the canonical one so that
    /// `kind_to_status(status_to_kind(s)) == s` for every supported status.
    pub fn from_status(status: u16) -> Self {
        match status {
            400 => Self::BadRequest,
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            405 => Self::MethodNotAllowed,
            409 => Self::Conflict,
            422 => Self::UnprocessableEntity,
            429 => Self::TooManyRequests,
            500 => Self::Internal,
            501 => Self::NotImplemented,
            502 => Self::BadGateway,
            503 => Self::ServiceUnavailable,
            504 => Self::GatewayTimeout,
            _ => Self::Provider,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn kind_to_status(kind: ErrorKind) -> u16 {
    kind.http_status().as_u16()
}

pub fn status_to_kind(status: u16) -> ErrorKind {
    ErrorKind::from_status(status)
}

/// Unified error value for all proxy operations.
///
/// Messages are sanitized at construction; augmentation is builder-style and
/// consumes/returns the same value.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ProxyError {
    pub kind: ErrorKind,
    pub message: String,
    pub code: Option<String>,
    pub provider: Option<String>,
    pub request_id: Option<String>,
    pub details: Option<Value>,
    pub retryable: bool,
    pub retry_after: Option<Duration>,
    pub timestamp: DateTime<Utc>,
    pub wrapped: Option<Box<ProxyError>>,
}

impl ProxyError {
    pub fn new(kind: ErrorKind, message: impl AsRef<str>) -> Self {
        Self {
            kind,
            message: sanitize_message(message.as_ref()),
            code: None,
            provider: None,
            request_id: None,
            details: None,
            retryable: kind.default_retryable(),
            retry_after: None,
            timestamp: Utc::now(),
            wrapped: None,
        }
    }

    pub fn bad_request(message: impl AsRef<str>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn unauthorized(message: impl AsRef<str>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn internal(message: impl AsRef<str>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn routing(message: impl AsRef<str>) -> Self {
        Self::new(ErrorKind::Routing, message)
    }

    pub fn transform(message: impl AsRef<str>) -> Self {
        Self::new(ErrorKind::Transform, message)
    }

    pub fn streaming(message: impl AsRef<str>) -> Self {
        Self::new(ErrorKind::Streaming, message)
    }

    pub fn config(message: impl AsRef<str>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    pub fn gateway_timeout(message: impl AsRef<str>) -> Self {
        Self::new(ErrorKind::GatewayTimeout, message)
    }

    pub fn service_unavailable(message: impl AsRef<str>) -> Self {
        Self::new(ErrorKind::ServiceUnavailable, message)
    }

    // ─── Builder-style augmentation ────────────────────────────────────────

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Replace kind and message while preserving the original's code,
    /// provider, request id, details, and retry-after. The original is kept
    /// as the wrapped cause.
    pub fn wrap(self, kind: ErrorKind, message: impl AsRef<str>) -> Self {
        let mut out = Self::new(kind, message);
        out.code = self.code.clone();
        out.provider = self.provider.clone();
        out.request_id = self.request_id.clone();
        out.details = self.details.clone();
        out.retry_after = self.retry_after;
        out.wrapped = Some(Box::new(self));
        out
    }

    pub fn http_status(&self) -> StatusCode {
        self.kind.http_status()
    }

    /// Map an upstream 4xx/5xx response into a typed error. Parses the
    /// conventional `{error: {type, message, code}}` envelope when present.
    pub fn from_upstream(
        provider: &str,
        status: u16,
        body: &[u8],
        retry_after_secs: Option<u64>,
    ) -> Self {
        let parsed: Option<Value> = serde_json::from_slice(body).ok();
        let upstream_error = parsed.as_ref().and_then(|v| v.get("error"));

        let message = upstream_error
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
            .map(|m| m.to_string())
            .unwrap_or_else(|| format!("Provider returned status {status}"));
        let code = upstream_error
            .and_then(|e| e.get("code"))
            .and_then(|c| c.as_str())
            .map(|c| c.to_string());

        let mut err = Self::new(ErrorKind::from_status(status), message)
            .with_provider(provider)
            .with_details(json!({"http_status": status}))
            .with_retryable(status == 429 || (500..=599).contains(&status));
        if let Some(code) = code {
            err = err.with_code(code);
        }
        if let Some(secs) = retry_after_secs {
            err = err.with_retry_after(Duration::from_secs(secs));
        }
        err
    }

    fn envelope(&self) -> Value {
        let mut error = json!({
            "type": self.kind.as_str(),
            "message": self.message,
        });
        if let Some(ref code) = self.code {
            error["code"] = json!(code);
        }
        if let Some(ref provider) = self.provider {
            error["provider"] = json!(provider);
        }
        if let Some(ref request_id) = self.request_id {
            error["request_id"] = json!(request_id);
        }
        if let Some(ref details) = self.details {
            error["details"] = details.clone();
        }
        json!({ "error": error })
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.http_status();
        let mut response = (
            status,
            [("content-type", "application/json")],
            self.envelope().to_string(),
        )
            .into_response();

        // Retry-After is advertised only where clients expect it.
        if matches!(status.as_u16(), 429 | 503 | 504)
            && let Some(retry_after) = self.retry_after
            && let Ok(value) = retry_after.as_secs().to_string().parse()
        {
            response.headers_mut().insert("retry-after", value);
        }
        response
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::new(ErrorKind::GatewayTimeout, format!("request timed out: {e}"))
        } else if e.is_connect() {
            Self::new(ErrorKind::BadGateway, format!("connection failed: {e}"))
        } else {
            Self::new(ErrorKind::BadGateway, e.to_string())
        }
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(ErrorKind::Transform, format!("JSON error: {e}"))
    }
}
