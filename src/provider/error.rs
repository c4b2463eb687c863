//! Classified provider errors
//!
//! Every failure at the provider boundary is mapped to a [`ProviderErrorKind`]
//! so the retry layer can decide whether the same request is worth repeating.

use thiserror::Error;

/// Longest error body kept in messages
const MAX_BODY_CHARS: usize = 300;

/// Why a model call failed
#[derive(Debug, Clone, Error)]
#[error("provider error ({kind:?}{}): {message}", status_suffix(.status))]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub status: Option<u16>,
    pub message: String,
    /// Seconds to wait before retrying (from the 429 body or header)
    pub retry_after_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// 401/403 - bad API key or permissions
    Auth,
    /// 402 - billing or quota exhausted
    Billing,
    /// 429 - rate limited; check retry_after_secs
    RateLimit,
    /// 404 - unknown model or endpoint
    NotFound,
    /// 408, or the request took longer than its deadline
    Timeout,
    /// Connection refused, DNS failure, reset
    Network,
    /// 500/502/503/504
    ServerError,
    /// Conversation no longer fits the model's context window
    ContextOverflow,
    /// Response could not be decoded
    Malformed,
    /// Invalid local configuration (missing key, bad base URL)
    Configuration,
    Unknown,
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(", {}", s)).unwrap_or_default()
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
            retry_after_secs: None,
        }
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        let kind = match status {
            401 | 403 => ProviderErrorKind::Auth,
            402 => ProviderErrorKind::Billing,
            404 => ProviderErrorKind::NotFound,
            408 => ProviderErrorKind::Timeout,
            429 => ProviderErrorKind::RateLimit,
            400 | 413 if mentions_context_length(body) => ProviderErrorKind::ContextOverflow,
            500 | 502 | 503 | 504 => ProviderErrorKind::ServerError,
            _ => ProviderErrorKind::Unknown,
        };

        let retry_after_secs = if kind == ProviderErrorKind::RateLimit {
            extract_retry_after(body)
        } else {
            None
        };

        Self {
            kind,
            status: Some(status),
            message: truncate_body(body),
            retry_after_secs,
        }
    }

    pub fn network(err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ProviderErrorKind::Timeout
        } else if err.is_decode() {
            ProviderErrorKind::Malformed
        } else {
            ProviderErrorKind::Network
        };
        Self::new(kind, err.to_string())
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Malformed, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Configuration, message)
    }

    pub fn timeout(after: std::time::Duration) -> Self {
        Self::new(
            ProviderErrorKind::Timeout,
            format!("no response within {:.1}s", after.as_secs_f64()),
        )
    }

    pub fn context_overflow(chars: usize, limit: usize) -> Self {
        Self::new(
            ProviderErrorKind::ContextOverflow,
            format!(
                "conversation is {} characters, context window allows {}",
                chars, limit
            ),
        )
    }

    /// Whether the same request is worth repeating
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ProviderErrorKind::RateLimit
                | ProviderErrorKind::Timeout
                | ProviderErrorKind::Network
                | ProviderErrorKind::ServerError
        )
    }

    /// Prefer a Retry-After header when the body carried no hint
    pub fn with_retry_after_header(mut self, header: Option<&str>) -> Self {
        if self.retry_after_secs.is_none() && self.kind == ProviderErrorKind::RateLimit {
            self.retry_after_secs = header.and_then(|h| h.trim().parse().ok());
        }
        self
    }
}

fn mentions_context_length(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("context_length")
        || lower.contains("context length")
        || lower.contains("context window")
        || lower.contains("maximum context")
        || lower.contains("prompt is too long")
        || lower.contains("too many tokens")
}

/// Parse retry_after from `{"error": {"retry_after": 5}}` or `{"retry_after": 5}`
fn extract_retry_after(body: &str) -> Option<u64> {
    let v: serde_json::Value = serde_json::from_str(body).ok()?;
    v["error"]["retry_after"]
        .as_u64()
        .or_else(|| v["retry_after"].as_u64())
        .or_else(|| {
            v["error"]["retry_after"]
                .as_f64()
                .or_else(|| v["retry_after"].as_f64())
                .map(|f| f.ceil() as u64)
        })
}

fn truncate_body(body: &str) -> String {
    match body.char_indices().nth(MAX_BODY_CHARS) {
        Some((cut, _)) => format!("{}...", &body[..cut]),
        None => body.to_string(),
    }
}
