//! Streaming relay: encodes transformed SSE frames (or verbatim upstream
//! bytes) onto the client connection, with a bounded budget for transient
//! read errors and prompt teardown on cancellation.

use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::Response;
use bytes::Bytes;
use ccproxy_core::error::ProxyError;
use ccproxy_core::sse::SseEvent;
use ccproxy_provider::sse::{ByteStream, EventStream};
use serde_json::json;
use std::convert::Infallible;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

fn sse_response(body: Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("x-accel-buffering", "no")
        .body(body)
        .expect("static SSE response parts")
}

/// `event: error` frame plus the `[DONE]` terminator. The HTTP status is
/// already 200 by the time a stream fails, so the client learns about the
/// failure from this terminal frame.
fn error_terminator(error: &ProxyError) -> Bytes {
    let payload = json!({
        "error": {"type": error.kind.as_str(), "message": error.message}
    });
    let mut wire = SseEvent::named("error", payload.to_string()).encode();
    wire.push_str(&SseEvent::done().encode());
    Bytes::from(wire)
}

struct EventRelay {
    events: EventStream,
    cancel: CancellationToken,
    /// Cancels the request token when the body is dropped, whether by normal
    /// completion or client disconnection; that tears down the upstream read
    /// and reaps the deadline watchdog.
    _guard: tokio_util::sync::DropGuard,
    error_budget: u32,
    errors: u32,
    done_sent: bool,
    finished: bool,
}

/// Relay transformed frames one per write. Terminates on the `[DONE]`
/// sentinel, upstream EOF (synthesizing the sentinel), cancellation, or an
/// exhausted error budget.
pub fn relay_events(events: EventStream, error_budget: u32, cancel: CancellationToken) -> Response {
    let state = EventRelay {
        events,
        _guard: cancel.clone().drop_guard(),
        cancel,
        error_budget,
        errors: 0,
        done_sent: false,
        finished: false,
    };

    let stream = futures::stream::unfold(state, |mut state| async move {
        loop {
            if state.finished {
                return None;
            }
            tokio::select! {
                biased;
                _ = state.cancel.cancelled() => {
                    state.finished = true;
                    if state.done_sent {
                        return None;
                    }
                    let err = ProxyError::gateway_timeout("stream cancelled");
                    return Some((Ok::<_, Infallible>(error_terminator(&err)), state));
                }
                item = state.events.next() => match item {
                    Some(Ok(event)) => {
                        if event.is_empty() {
                            continue;
                        }
                        if event.is_done() {
                            state.done_sent = true;
                            state.finished = true;
                        }
                        return Some((Ok(Bytes::from(event.encode())), state));
                    }
                    Some(Err(error)) => {
                        state.errors += 1;
                        if state.errors > state.error_budget {
                            let err = error.wrap(
                                ccproxy_core::error::ErrorKind::Streaming,
                                "stream error budget exceeded",
                            );
                            tracing::warn!(errors = state.errors, "aborting relay: {err}");
                            state.finished = true;
                            return Some((Ok(error_terminator(&err)), state));
                        }
                        tracing::debug!(errors = state.errors, "transient stream error: {error}");
                    }
                    None => {
                        state.finished = true;
                        if state.done_sent {
                            return None;
                        }
                        state.done_sent = true;
                        return Some((Ok(Bytes::from(SseEvent::done().encode())), state));
                    }
                }
            }
        }
    });

    sse_response(Body::from_stream(stream))
}

struct RawRelay {
    bytes: ByteStream,
    cancel: CancellationToken,
    _guard: tokio_util::sync::DropGuard,
    error_budget: u32,
    errors: u32,
    finished: bool,
}

/// Passthrough relay: upstream bytes are copied unmodified until EOF,
/// cancellation, or an exhausted error budget.
pub fn relay_raw(bytes: ByteStream, error_budget: u32, cancel: CancellationToken) -> Response {
    let state = RawRelay {
        bytes,
        _guard: cancel.clone().drop_guard(),
        cancel,
        error_budget,
        errors: 0,
        finished: false,
    };

    let stream = futures::stream::unfold(state, |mut state| async move {
        loop {
            if state.finished {
                return None;
            }
            tokio::select! {
                biased;
                _ = state.cancel.cancelled() => {
                    state.finished = true;
                    let err = ProxyError::gateway_timeout("stream cancelled");
                    return Some((Ok::<_, Infallible>(error_terminator(&err)), state));
                }
                item = state.bytes.next() => match item {
                    Some(Ok(chunk)) => return Some((Ok(chunk), state)),
                    Some(Err(error)) => {
                        state.errors += 1;
                        if state.errors > state.error_budget {
                            let err = error.wrap(
                                ccproxy_core::error::ErrorKind::Streaming,
                                "stream error budget exceeded",
                            );
                            tracing::warn!(errors = state.errors, "aborting relay: {err}");
                            state.finished = true;
                            return Some((Ok(error_terminator(&err)), state));
                        }
                        tracing::debug!(errors = state.errors, "transient stream error: {error}");
                    }
                    None => return None,
                }
            }
        }
    });

    sse_response(Body::from_stream(stream))
}
