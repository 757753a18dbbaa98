//! Redaction of secrets and identifying data from error messages.
//!
//! Every message that can reach a client body or a log line goes through
//! [`sanitize_message`] first.

use regex::Regex;
use std::sync::LazyLock;

const REDACTED: &str = "[REDACTED]";
const MAX_MESSAGE_LEN: usize = 500;

static KEY_VALUE_SECRET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(api[_-]?key|secret|password|token)\b\s*[=:]\s*"?[^\s",;]+"#)
        .expect("key-value secret pattern")
});

static AUTHORIZATION_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    // Consume through end-of-segment so multi-word values (`Basic xyz`)
    // are fully covered.
    Regex::new(r"(?i)\b(authorization|x-api-key)\s*:\s*[^\n;,]+").expect("auth header pattern")
});

static BEARER_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bbearer\s+[A-Za-z0-9._~+/=\-]+").expect("bearer pattern"));

static API_KEY_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bsk-[A-Za-z0-9_\-]{8,}").expect("api key pattern"));

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").expect("email pattern")
});

static IP_PORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}(:\d+)?\b").expect("ip pattern")
});

/// Redact secret-shaped substrings and truncate overlong messages.
pub fn sanitize_message(message: &str) -> String {
    let mut out = KEY_VALUE_SECRET
        .replace_all(message, |caps: &regex::Captures| {
            format!("{}={REDACTED}", &caps[1])
        })
        .into_owned();
    out = AUTHORIZATION_HEADER
        .replace_all(&out, |caps: &regex::Captures| {
            format!("{}: {REDACTED}", &caps[1])
        })
        .into_owned();
    out = BEARER_TOKEN.replace_all(&out, REDACTED).into_owned();
    out = API_KEY_TOKEN.replace_all(&out, REDACTED).into_owned();
    out = EMAIL.replace_all(&out, REDACTED).into_owned();
    out = IP_PORT.replace_all(&out, REDACTED).into_owned();

    if out.chars().count() > MAX_MESSAGE_LEN {
        let mut truncated: String = out.chars().take(MAX_MESSAGE_LEN).collect();
        truncated.push('…');
        truncated
    } else {
        out
    }
}
