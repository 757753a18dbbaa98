//! Frame-level Server-Sent-Events model shared by the codec and the
//! transformer chain. Byte-stream decoding lives in the provider crate.

pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Value of the `event:` field, when the frame is named.
    pub event: Option<String>,
    /// `data:` lines joined with newlines.
    pub data: String,
}

impl SseEvent {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
        }
    }

    /// The terminal `data: [DONE]` sentinel.
    pub fn done() -> Self {
        Self::new(DONE_SENTINEL)
    }

    pub fn is_done(&self) -> bool {
        self.data == DONE_SENTINEL
    }

    pub fn is_empty(&self) -> bool {
        self.event.is_none() && self.data.is_empty()
    }

    /// Wire form of this frame: `event:` line when named, one `data:` line
    /// per data line, terminating blank line. Empty events encode to nothing.
    pub fn encode(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        let mut out = String::new();
        if let Some(ref event) = self.event {
            out.push_str("event: ");
            out.push_str(event);
            out.push('\n');
        }
        if !self.data.is_empty() {
            for line in self.data.split('\n') {
                out.push_str("data: ");
                out.push_str(line);
                out.push('\n');
            }
        }
        out.push('\n');
        out
    }
}

/// Parse one blank-line-delimited SSE block into an event.
/// Comment lines (leading `:`) and `id:`/`retry:` fields are ignored.
/// Returns `None` for blocks with no event name and no data.
pub fn parse_event_block(block: &str) -> Option<SseEvent> {
    let mut event_name: Option<String> = None;
    let mut data_lines: Vec<String> = Vec::new();

    for line in block.lines() {
        let line = line.trim_end_matches('\r');
        if line.starts_with(':') {
            continue;
        }
        if let Some(value) = line.strip_prefix("event:") {
            event_name = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value).to_string());
        }
    }

    if event_name.is_none() && data_lines.is_empty() {
        return None;
    }

    Some(SseEvent {
        event: event_name,
        data: data_lines.join("\n"),
    })
}
