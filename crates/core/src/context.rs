use std::time::Instant;

/// Per-request context carrying identity and timing for the pipeline, logs,
/// and errors. Injected as an axum `Extension` by the request-context
/// middleware; lives exactly as long as one inbound request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Unique request identifier (UUID v4), propagated to errors and logs.
    pub request_id: String,
    /// When the request was received.
    pub start_time: Instant,
    /// Client IP address, if available.
    pub client_ip: Option<String>,
}

impl RequestContext {
    pub fn new(client_ip: Option<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            start_time: Instant::now(),
            client_ip,
        }
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.start_time.elapsed().as_millis()
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new(None)
    }
}
