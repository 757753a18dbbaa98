pub mod health;
pub mod messages;

use bytes::Bytes;
use ccproxy_core::error::ProxyError;
use serde_json::Value;

#[derive(Debug)]
pub(crate) struct ParsedRequest {
    pub doc: Value,
    pub stream: bool,
}

pub(crate) fn parse_request(body: &Bytes) -> Result<ParsedRequest, ProxyError> {
    let doc: Value = serde_json::from_slice(body)
        .map_err(|e| ProxyError::bad_request(format!("invalid JSON body: {e}")))?;
    if !doc.is_object() {
        return Err(ProxyError::bad_request("request body must be a JSON object"));
    }
    if doc.get("model").and_then(|m| m.as_str()).is_none() {
        return Err(ProxyError::bad_request("missing model field"));
    }

    let stream = doc.get("stream").and_then(|s| s.as_bool()).unwrap_or(false);
    Ok(ParsedRequest { doc, stream })
}
