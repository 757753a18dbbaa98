//! Async SSE decoding: turns an upstream byte stream into frame-level
//! [`SseEvent`]s, plus a raw passthrough mode for streams that need no
//! rewriting.

use bytes::Bytes;
use ccproxy_core::error::ProxyError;
use ccproxy_core::sse::{SseEvent, parse_event_block};
use futures::Stream;
use std::pin::Pin;
use tokio_stream::StreamExt;

pub type EventStream = Pin<Box<dyn Stream<Item = Result<SseEvent, ProxyError>> + Send>>;
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProxyError>> + Send>>;

/// Parse a byte stream into SSE events, framed by blank lines.
/// The `[DONE]` sentinel is surfaced as a normal event; callers decide when
/// to stop reading.
pub fn parse_sse_stream(
    byte_stream: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
) -> EventStream {
    struct SseState {
        stream: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
        buffer: String,
    }

    let stream = futures::stream::unfold(
        SseState {
            stream: Box::pin(byte_stream),
            buffer: String::new(),
        },
        |mut state| async move {
            loop {
                // A complete event block ends at a double newline.
                if let Some((pos, skip)) = find_event_boundary(&state.buffer) {
                    let block = state.buffer[..pos].to_string();
                    state.buffer = state.buffer[pos + skip..].to_string();

                    if let Some(event) = parse_event_block(&block) {
                        return Some((Ok(event), state));
                    }
                    // Comment-only block, keep scanning.
                    continue;
                }

                match state.stream.next().await {
                    Some(Ok(bytes)) => match std::str::from_utf8(&bytes) {
                        Ok(text) => state.buffer.push_str(text),
                        Err(e) => {
                            return Some((
                                Err(ProxyError::streaming(format!(
                                    "invalid UTF-8 in SSE stream: {e}"
                                ))),
                                state,
                            ));
                        }
                    },
                    Some(Err(e)) => {
                        return Some((Err(ProxyError::from(e)), state));
                    }
                    None => {
                        // Stream ended; flush any trailing partial block.
                        if !state.buffer.trim().is_empty() {
                            let block = std::mem::take(&mut state.buffer);
                            if let Some(event) = parse_event_block(&block) {
                                return Some((Ok(event), state));
                            }
                        }
                        return None;
                    }
                }
            }
        },
    );
    Box::pin(stream)
}

/// Position and length of the first blank-line boundary.
fn find_event_boundary(s: &str) -> Option<(usize, usize)> {
    let lf = s.find("\n\n").map(|pos| (pos, 2));
    let crlf = s.find("\r\n\r\n").map(|pos| (pos, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// Raw passthrough: copy upstream bytes unmodified until EOF or drop.
pub fn passthrough_stream(
    byte_stream: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
) -> ByteStream {
    Box::pin(byte_stream.map(|result| result.map_err(ProxyError::from)))
}
