use reqwest::StatusCode;
use thiserror::Error;

/// Error kinds for actionable diagnostics and retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid pipeline or backend configuration
    Config,
    /// Invalid input or chain shape
    Validation,
    /// Upstream model returned an error
    Llm,
    /// Network connectivity failure
    Network,
    /// Deadline or per-request timeout
    Timeout,
    /// Rate limiting - slow down requests
    RateLimit,
    /// Cache tier failure - check disk space/permissions
    Cache,
    /// Failure wrapped with the offending step
    Step,
    /// Chain-level failure
    Chain,
    /// Unclassified error
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Validation => "validation",
            Self::Llm => "llm",
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::RateLimit => "rate-limit",
            Self::Cache => "cache",
            Self::Step => "step",
            Self::Chain => "chain",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message substrings that mark a failure as transient.
/// Matched case-insensitively against the human message.
const RETRYABLE_TOKENS: &[&str] = &[
    "timeout",
    "deadline exceeded",
    "connection refused",
    "temporary failure",
    "rate limit",
    "429",
    "503",
    "504",
    "contentlength",
    "body length 0",
    "connection reset",
    "broken pipe",
    "no such host",
    "network is unreachable",
    "i/o timeout",
];

/// Check whether an error message matches the transient-failure token table
pub fn message_is_retryable(message: &str) -> bool {
    let lower = message.to_lowercase();
    RETRYABLE_TOKENS.iter().any(|t| lower.contains(t))
}

/// Tagged translation error: kind, human message, offending step, retryable flag
/// and the underlying cause when one exists.
#[derive(Error, Debug)]
#[error("{kind}{step_part}: {message}", step_part = .step.as_deref().map(|s| format!(" [step {s}]")).unwrap_or_default())]
pub struct TranslateError {
    kind: ErrorKind,
    message: String,
    step: Option<String>,
    retryable: bool,
    retry_after_secs: Option<u64>,
    cancellation: bool,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TranslateError {
    fn tagged(kind: ErrorKind, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            step: None,
            retryable,
            retry_after_secs: None,
            cancellation: false,
            source: None,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::tagged(ErrorKind::Config, message, false)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::tagged(ErrorKind::Validation, message, false)
    }

    /// Upstream model error. Retryability is decided by the message table
    /// unless the caller knows better (see [`TranslateError::from_status`]).
    pub fn llm(message: impl Into<String>) -> Self {
        let message = message.into();
        let retryable = message_is_retryable(&message);
        Self::tagged(ErrorKind::Llm, message, retryable)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::tagged(ErrorKind::Network, message, true)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::tagged(ErrorKind::Timeout, message, true)
    }

    pub fn rate_limited(retry_after_secs: Option<u64>) -> Self {
        let suffix = retry_after_secs
            .map(|s| format!(", retry after {s}s"))
            .unwrap_or_default();
        let mut err = Self::tagged(
            ErrorKind::RateLimit,
            format!("rate limit exceeded{suffix}"),
            true,
        );
        err.retry_after_secs = retry_after_secs;
        err
    }

    pub fn cache(message: impl Into<String>) -> Self {
        Self::tagged(ErrorKind::Cache, message, false)
    }

    pub fn chain(message: impl Into<String>) -> Self {
        Self::tagged(ErrorKind::Chain, message, false)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        let message = message.into();
        let retryable = message_is_retryable(&message);
        Self::tagged(ErrorKind::Unknown, message, retryable)
    }

    /// Ambient cancellation. Never retried.
    pub fn cancelled() -> Self {
        let mut err = Self::tagged(ErrorKind::Timeout, "job cancelled", false);
        err.cancellation = true;
        err
    }

    /// Ambient deadline exhausted. Never retried - the retrier must not
    /// outlive the deadline it was handed.
    pub fn deadline_exceeded() -> Self {
        let mut err = Self::tagged(ErrorKind::Timeout, "ambient deadline exceeded", false);
        err.cancellation = true;
        err
    }

    /// Classify an HTTP status into the taxonomy.
    ///
    /// 429 is a rate limit, other 4xx are terminal model errors, 5xx are
    /// retryable model errors.
    pub fn from_status(status: StatusCode) -> Self {
        Self::from_status_with_retry_after(status, None)
    }

    /// Classify an HTTP status, capturing a Retry-After hint for 429s
    pub fn from_status_with_retry_after(status: StatusCode, retry_after_secs: Option<u64>) -> Self {
        match status.as_u16() {
            429 => Self::rate_limited(retry_after_secs),
            400..=499 => Self::tagged(ErrorKind::Llm, format!("HTTP {status}"), false),
            500..=599 => Self::tagged(ErrorKind::Llm, format!("HTTP {status}"), true),
            _ => Self::unknown(format!("HTTP {status}")),
        }
    }

    /// Attach the offending step name, preserving the original classification
    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    /// Attach the underlying cause
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn step(&self) -> Option<&str> {
        self.step.as_deref()
    }

    /// Determine if this error should trigger a retry
    pub fn is_retryable(&self) -> bool {
        if self.cancellation {
            return false;
        }
        self.retryable
            || matches!(self.kind, ErrorKind::Timeout | ErrorKind::RateLimit)
            || message_is_retryable(&self.message)
    }

    /// True when the error came from ambient cancellation or deadline expiry
    pub fn is_cancellation(&self) -> bool {
        self.cancellation
    }

    /// Server-suggested retry delay, when one was provided
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after_secs
    }
}

impl From<reqwest::Error> for TranslateError {
    fn from(e: reqwest::Error) -> Self {
        let err = if e.is_timeout() {
            Self::timeout(format!("request timeout: {e}"))
        } else if e.is_connect() {
            Self::network(format!("connection failed: {e}"))
        } else if let Some(status) = e.status() {
            Self::from_status(status)
        } else {
            Self::network(format!("transport error: {e}"))
        };
        err.with_source(e)
    }
}

impl From<serde_json::Error> for TranslateError {
    fn from(e: serde_json::Error) -> Self {
        Self::tagged(ErrorKind::Llm, format!("response parse error: {e}"), false).with_source(e)
    }
}

pub type Result<T> = std::result::Result<T, TranslateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings() {
        assert_eq!(ErrorKind::RateLimit.as_str(), "rate-limit");
        assert_eq!(ErrorKind::Validation.as_str(), "validation");
    }

    #[test]
    fn test_message_table_probes() {
        for probe in [
            "request timeout",
            "context deadline exceeded",
            "dial tcp: connection refused",
            "temporary failure in name resolution",
            "Rate Limit reached for requests",
            "unexpected status 429",
            "HTTP 503 Service Unavailable",
            "HTTP 504 Gateway Timeout",
            "http: ContentLength=348 with Body length 0",
            "read: connection reset by peer",
            "write: broken pipe",
            "lookup api.example.com: no such host",
            "connect: network is unreachable",
            "read tcp: i/o timeout",
        ] {
            assert!(message_is_retryable(probe), "expected retryable: {probe}");
        }
        assert!(!message_is_retryable("invalid request payload"));
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(
            TranslateError::from_status(StatusCode::TOO_MANY_REQUESTS).kind(),
            ErrorKind::RateLimit
        );
        assert!(TranslateError::from_status(StatusCode::TOO_MANY_REQUESTS).is_retryable());
        assert!(!TranslateError::from_status(StatusCode::BAD_REQUEST).is_retryable());
        assert!(!TranslateError::from_status(StatusCode::UNAUTHORIZED).is_retryable());
        assert!(TranslateError::from_status(StatusCode::BAD_GATEWAY).is_retryable());
    }

    #[test]
    fn test_retry_after_capture() {
        let err =
            TranslateError::from_status_with_retry_after(StatusCode::TOO_MANY_REQUESTS, Some(30));
        assert_eq!(err.retry_after_secs(), Some(30));
        assert!(err.to_string().contains("retry after 30s"));
    }

    #[test]
    fn test_cancellation_never_retryable() {
        let err = TranslateError::cancelled();
        assert!(err.is_cancellation());
        assert!(!err.is_retryable());
        // Deadline expiry carries a "deadline" message that would match the
        // token table, but the cancellation flag wins.
        let err = TranslateError::deadline_exceeded();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_step_attachment() {
        let err = TranslateError::llm("HTTP 500 Internal Server Error").with_step("reflection");
        assert_eq!(err.step(), Some("reflection"));
        assert!(err.to_string().contains("[step reflection]"));
        assert_eq!(err.kind(), ErrorKind::Llm);
    }

    #[test]
    fn test_llm_message_classification() {
        assert!(TranslateError::llm("upstream 503").is_retryable());
        assert!(!TranslateError::llm("model not found").is_retryable());
    }
}
