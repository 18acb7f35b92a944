//! Error taxonomy for provider calls.
//!
//! Every adapter maps its failures onto [`LlmError`] so the failover
//! controller can decide what to do without knowing which vendor failed.

use std::fmt;
use std::time::Duration;

/// Broad class of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    /// HTTP 429
    RateLimited,
    /// HTTP 5xx
    ServerError,
    /// HTTP 4xx other than 429 (bad request, auth failure, ...)
    ClientError,
    /// Connection refused, DNS, TLS, reset
    NetworkError,
    /// The call did not finish within its deadline
    Timeout,
    /// The response body could not be mapped onto the canonical shape
    ParseError,
    /// The credential was empty or unusable as a header value
    InvalidCredential,
}

impl fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RateLimited => "rate_limited",
            Self::ServerError => "server_error",
            Self::ClientError => "client_error",
            Self::NetworkError => "network_error",
            Self::Timeout => "timeout",
            Self::ParseError => "parse_error",
            Self::InvalidCredential => "invalid_credential",
        };
        write!(f, "{}", s)
    }
}

/// Classify an HTTP status code.
pub fn classify_http_status(status: u16) -> LlmErrorKind {
    match status {
        429 => LlmErrorKind::RateLimited,
        500..=599 => LlmErrorKind::ServerError,
        400..=499 => LlmErrorKind::ClientError,
        _ => LlmErrorKind::ServerError,
    }
}

/// A failed provider call.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub message: String,
    /// HTTP status, when the vendor answered at all.
    pub status: Option<u16>,
    /// Server-suggested wait from a `Retry-After` header.
    pub retry_after: Option<Duration>,
}

impl LlmError {
    fn new(kind: LlmErrorKind, message: String) -> Self {
        Self {
            kind,
            message,
            status: None,
            retry_after: None,
        }
    }

    pub fn rate_limited(message: String, retry_after: Option<Duration>) -> Self {
        Self {
            status: Some(429),
            retry_after,
            ..Self::new(LlmErrorKind::RateLimited, message)
        }
    }

    pub fn server_error(status: u16, message: String) -> Self {
        Self {
            status: Some(status),
            ..Self::new(LlmErrorKind::ServerError, message)
        }
    }

    pub fn client_error(status: u16, message: String) -> Self {
        Self {
            status: Some(status),
            ..Self::new(LlmErrorKind::ClientError, message)
        }
    }

    pub fn network_error(message: String) -> Self {
        Self::new(LlmErrorKind::NetworkError, message)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            LlmErrorKind::Timeout,
            format!("Request timed out after {:?}", after),
        )
    }

    pub fn parse_error(message: String) -> Self {
        Self::new(LlmErrorKind::ParseError, message)
    }

    pub fn invalid_credential(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::InvalidCredential, message.into())
    }

    /// Build an error from a non-2xx response.
    pub fn from_status(status: u16, body: &str, retry_after: Option<Duration>) -> Self {
        match classify_http_status(status) {
            LlmErrorKind::RateLimited => Self::rate_limited(body.to_string(), retry_after),
            LlmErrorKind::ClientError => Self::client_error(status, body.to_string()),
            _ => Self::server_error(status, body.to_string()),
        }
    }

    /// Whether another attempt could plausibly succeed.
    ///
    /// The failover controller retries every error (a later attempt may pick a
    /// different provider); this only informs logging and event metadata.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            LlmErrorKind::RateLimited
                | LlmErrorKind::ServerError
                | LlmErrorKind::NetworkError
                | LlmErrorKind::Timeout
        )
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LlmError::network_error(format!("Request timeout: {}", e))
        } else if e.is_connect() {
            LlmError::network_error(format!("Connection failed: {}", e))
        } else if e.is_decode() {
            LlmError::parse_error(format!("Failed to decode response: {}", e))
        } else {
            LlmError::network_error(format!("Request failed: {}", e))
        }
    }
}

/// Parse a `Retry-After` header given in seconds.
pub(crate) fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
