use std::time::Duration;

use thiserror::Error;

/// Fallback wait when a 429 carries no usable `Retry-After`.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

/// What the backend told us about a failed call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub status: Option<u16>,
    /// Backend error code from the JSON body, e.g. `rate_limit_exceeded`.
    pub code: Option<String>,
    /// `x-request-id` response header.
    pub request_id: Option<String>,
}

impl ErrorContext {
    pub fn http(status: u16, request_id: Option<String>) -> Self {
        Self {
            status: Some(status),
            code: None,
            request_id,
        }
    }

    pub fn with_code(mut self, code: Option<String>) -> Self {
        self.code = code;
        self
    }
}

/// Failure modes of one text-generation call.
///
/// Classification drives retries: only `RateLimited`, `Unavailable` and
/// transport timeouts are worth another attempt.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        retry_after: Duration,
        context: ErrorContext,
    },

    /// The backend rejected the request itself (bad model, oversize input).
    #[error("request rejected: {message}")]
    Rejected {
        message: String,
        context: ErrorContext,
    },

    /// The backend failed on its side; another attempt may succeed.
    #[error("backend unavailable: {message}")]
    Unavailable {
        message: String,
        context: ErrorContext,
    },

    #[error("model refused: {0}")]
    Refused(String),

    /// 2xx response we could not decode.
    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    /// Map a non-2xx status to an error kind.
    pub fn from_status(
        status: u16,
        message: impl Into<String>,
        retry_after: Option<Duration>,
        context: ErrorContext,
    ) -> Self {
        let message = message.into();
        match status {
            429 => Self::RateLimited {
                retry_after: retry_after.unwrap_or(DEFAULT_RETRY_AFTER),
                context,
            },
            408 | 500..=599 => Self::Unavailable { message, context },
            _ => Self::Rejected { message, context },
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Unavailable { .. } => true,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::Rejected { .. } | Self::Refused(_) | Self::Malformed(_) | Self::Config(_) => {
                false
            }
        }
    }

    /// Short stable code for logs and usage records.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Rejected { .. } => "rejected",
            Self::Unavailable { .. } => "unavailable",
            Self::Refused(_) => "refused",
            Self::Malformed(_) => "malformed",
            Self::Http(_) => "http_error",
            Self::Config(_) => "config_error",
        }
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::RateLimited { context, .. }
            | Self::Rejected { context, .. }
            | Self::Unavailable { context, .. } => Some(context),
            _ => None,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        self.context().and_then(|c| c.request_id.as_deref())
    }

    /// Backend-suggested wait before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}
