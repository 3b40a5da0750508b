use serde::{Deserialize, Serialize};

/// Coarse classification shared by request errors, upload item errors and
/// job failures, so callers can pick a message without inspecting
/// transport internals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Caller-fixable input problem. Never retried.
    Validation,
    /// The service answered 429.
    RateLimited,
    /// The service answered with a 5xx status.
    Server,
    /// No attempt completed within the configured timeout.
    Timeout,
    /// The circuit breaker is open; the request was not sent.
    ServiceUnavailable,
    /// Network-level failure (DNS, connection reset, TLS, ...).
    Transport,
    /// Anything else: non-retryable 4xx, undecodable responses.
    Unexpected,
}

impl ErrorKind {
    /// Whether a failure of this kind may succeed when repeated.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::Server | Self::Timeout | Self::Transport
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Validation => "validation",
            Self::RateLimited => "rate_limited",
            Self::Server => "server",
            Self::Timeout => "timeout",
            Self::ServiceUnavailable => "service_unavailable",
            Self::Transport => "transport",
            Self::Unexpected => "unexpected",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl CoreError {
    /// Build an error of the given kind carrying `message`.
    ///
    /// `Server` errors built this way carry status `500`; use the variant
    /// directly when the real status is known.
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::Validation => Self::Validation(message),
            ErrorKind::RateLimited => Self::RateLimited(message),
            ErrorKind::Server => Self::Server {
                status: 500,
                message,
            },
            ErrorKind::Timeout => Self::Timeout(message),
            ErrorKind::ServiceUnavailable => Self::ServiceUnavailable(message),
            ErrorKind::Transport => Self::Transport(message),
            ErrorKind::Unexpected => Self::Unexpected(message),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::RateLimited(_) => ErrorKind::RateLimited,
            Self::Server { .. } => ErrorKind::Server,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::ServiceUnavailable(_) => ErrorKind::ServiceUnavailable,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Unexpected(_) => ErrorKind::Unexpected,
        }
    }

    /// Message suitable for showing to the person who triggered the
    /// request.
    ///
    /// Validation messages are already written for humans and are passed
    /// through; every other kind maps to a fixed sentence.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(msg) => msg.clone(),
            Self::RateLimited(_) => "Rate limit reached. Please wait a moment and try again.".into(),
            Self::ServiceUnavailable(_) => {
                "Service temporarily unavailable. Retry shortly.".into()
            }
            Self::Timeout(_) => "The render service took too long to respond.".into(),
            Self::Server { .. } | Self::Transport(_) | Self::Unexpected(_) => {
                "An unexpected error occurred.".into()
            }
        }
    }
}
