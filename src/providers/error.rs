//! Closed model-error taxonomy.
//!
//! Provider failures are classified here, at the model-client boundary, from
//! the HTTP status when one is available and from phrase heuristics when the
//! failure never produced a response. Nothing above this boundary inspects
//! error strings.

use thiserror::Error;

/// What kind of failure the provider reported. Drives the worker's retry
/// decision; see the error path in `crate::worker`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 401, bad credentials. Permanent.
    Auth,
    /// 402, out of credits. Permanent.
    Payment,
    /// 403, content flagged. Permanent.
    Moderation,
    /// 400 with a context-length complaint. One adaptive retry with a
    /// narrower history window.
    ContextLength,
    /// 408/429/502/503, timeouts, rate limits. Transient.
    Retryable,
    /// The circuit breaker refused the call. Transient.
    BreakerOpen,
    /// Everything else. Permanent.
    Other,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("[model {code}] {message}")]
pub struct ModelError {
    pub kind: ErrorKind,
    pub code: u16,
    pub message: String,
}

impl ModelError {
    pub fn new(kind: ErrorKind, code: u16, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
        }
    }

    pub fn timeout() -> Self {
        Self::new(ErrorKind::Retryable, 408, "request timeout")
    }

    pub fn breaker_open(name: &str, remaining_secs: u64) -> Self {
        Self::new(
            ErrorKind::BreakerOpen,
            0,
            format!("circuit breaker {name} is open (cooldown {remaining_secs}s remaining)"),
        )
    }

    /// True for kinds that must never be retried.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Auth | ErrorKind::Payment | ErrorKind::Moderation | ErrorKind::Other
        )
    }

    /// Classify from an HTTP status plus the response body.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = match status {
            401 => ErrorKind::Auth,
            402 => ErrorKind::Payment,
            403 => ErrorKind::Moderation,
            400 if mentions_context_length(&message) => ErrorKind::ContextLength,
            408 | 429 | 502 | 503 => ErrorKind::Retryable,
            _ => ErrorKind::Other,
        };
        Self::new(kind, status, message)
    }

    /// Classify a transport-level failure that never got an HTTP status.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        if lower.contains("timeout") || lower.contains("deadline exceeded") {
            return Self::timeout();
        }
        if mentions_context_length(&lower) {
            return Self::new(ErrorKind::ContextLength, 400, message);
        }
        if lower.contains("unauthorized") || lower.contains("invalid api key") {
            return Self::new(ErrorKind::Auth, 401, "authentication failed");
        }
        if lower.contains("insufficient") || lower.contains("quota") || lower.contains("billing") {
            return Self::new(ErrorKind::Payment, 402, "insufficient credits or quota exceeded");
        }
        if lower.contains("rate limit") || lower.contains("too many requests") {
            return Self::new(ErrorKind::Retryable, 429, "rate limit exceeded");
        }
        if lower.contains("bad gateway") {
            return Self::new(ErrorKind::Retryable, 502, "bad gateway");
        }
        if lower.contains("service unavailable") || lower.contains("temporarily unavailable") {
            return Self::new(ErrorKind::Retryable, 503, "service temporarily unavailable");
        }

        Self::new(ErrorKind::Other, 500, message)
    }
}

fn mentions_context_length(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("context")
        && (lower.contains("length") || lower.contains("exceeded") || lower.contains("too long"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(ModelError::from_status(401, "nope").kind, ErrorKind::Auth);
        assert_eq!(ModelError::from_status(402, "pay").kind, ErrorKind::Payment);
        assert_eq!(
            ModelError::from_status(403, "flagged").kind,
            ErrorKind::Moderation
        );
        for status in [408, 429, 502, 503] {
            assert_eq!(
                ModelError::from_status(status, "busy").kind,
                ErrorKind::Retryable
            );
        }
        assert_eq!(ModelError::from_status(500, "boom").kind, ErrorKind::Other);
    }

    #[test]
    fn context_length_needs_both_words() {
        let err = ModelError::from_status(400, "maximum context length exceeded");
        assert_eq!(err.kind, ErrorKind::ContextLength);

        // "context" alone is not enough
        let err = ModelError::from_status(400, "invalid context parameter");
        assert_eq!(err.kind, ErrorKind::Other);

        // only a 400 can be a context-length error
        let err = ModelError::from_status(500, "context length exceeded");
        assert_eq!(err.kind, ErrorKind::Other);
    }

    #[test]
    fn context_length_phrase_variants() {
        for msg in [
            "context length exceeded",
            "this model's context was exceeded",
            "prompt context too long",
        ] {
            assert_eq!(
                ModelError::from_status(400, msg).kind,
                ErrorKind::ContextLength,
                "{msg}"
            );
        }
    }

    #[test]
    fn phrase_heuristics() {
        assert_eq!(
            ModelError::from_message("connection timeout after 120s").kind,
            ErrorKind::Retryable
        );
        assert_eq!(
            ModelError::from_message("401 unauthorized").kind,
            ErrorKind::Auth
        );
        assert_eq!(
            ModelError::from_message("monthly quota exhausted").kind,
            ErrorKind::Payment
        );
        assert_eq!(
            ModelError::from_message("rate limit hit, slow down").kind,
            ErrorKind::Retryable
        );
        assert_eq!(
            ModelError::from_message("502 bad gateway from upstream").kind,
            ErrorKind::Retryable
        );
        assert_eq!(
            ModelError::from_message("service unavailable").kind,
            ErrorKind::Retryable
        );
        assert_eq!(
            ModelError::from_message("something else broke").kind,
            ErrorKind::Other
        );
    }

    #[test]
    fn permanence() {
        assert!(ModelError::from_status(401, "x").is_permanent());
        assert!(ModelError::from_status(500, "x").is_permanent());
        assert!(!ModelError::from_status(429, "x").is_permanent());
        assert!(!ModelError::timeout().is_permanent());
        assert!(!ModelError::breaker_open("model", 10).is_permanent());
        assert!(!ModelError::from_status(400, "context length exceeded").is_permanent());
    }
}
