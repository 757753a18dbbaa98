pub mod client;
pub mod endpoint;
pub mod pipeline;
pub mod router;
pub mod sse;

use std::collections::HashMap;

/// Extract response headers from a reqwest Response into a HashMap.
pub fn extract_headers(resp: &reqwest::Response) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for (key, value) in resp.headers().iter() {
        if let Ok(v) = value.to_str() {
            headers.insert(key.as_str().to_string(), v.to_string());
        }
    }
    headers
}

/// Parse the `Retry-After` header value as seconds.
/// Handles integer seconds only (ignores HTTP-date format).
pub fn parse_retry_after(headers: &HashMap<String, String>) -> Option<u64> {
    headers
        .get("retry-after")
        .and_then(|v| v.parse::<u64>().ok())
}
