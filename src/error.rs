use std::{fmt, time::SystemTime};

use crate::{transport::TransportError, wire::ApiErrorMessage};

/// Details of a non-success HTTP response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpFailure {
    pub status: u16,
    /// Human-readable summary, taken from the structured body when present.
    pub message: String,
    /// Raw response body.
    pub body: String,
    pub api_error: Option<ApiErrorMessage>,
}

impl HttpFailure {
    pub fn from_response(status: u16, body: &[u8]) -> Self {
        let api_error = ApiErrorMessage::parse(body);
        let raw = String::from_utf8_lossy(body).into_owned();
        let message = api_error
            .as_ref()
            .and_then(ApiErrorMessage::describe)
            .map(str::to_owned)
            .unwrap_or_else(|| {
                if raw.trim().is_empty() {
                    format!("HTTP {status}")
                } else {
                    raw.clone()
                }
            });
        Self {
            status,
            message,
            body: raw,
            api_error,
        }
    }
}

impl fmt::Display for HttpFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status, self.message)
    }
}

/// Error type returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum TdClientError {
    /// 404.
    #[error("target not found: {0}")]
    TargetNotFound(HttpFailure),
    /// 409.
    #[error("conflict: {0}")]
    Conflict(HttpFailure),
    /// 401.
    #[error("authentication failure: {0}")]
    AuthenticationFailure(HttpFailure),
    /// Any other 4xx.
    #[error("client error: {0}")]
    ClientError(HttpFailure),
    /// 5xx.
    #[error("server error: {0}")]
    ServerError(HttpFailure),
    /// A status outside the recognised classes.
    #[error("unexpected response code: {0}")]
    UnexpectedResponseCode(HttpFailure),
    /// 429, either over the wait budget or as the root cause of an
    /// exhausted retry limit.
    #[error("too many requests: {failure}")]
    TooManyRequests {
        failure: HttpFailure,
        /// Deadline resolved from the `Retry-After` header, if any.
        retry_after: Option<SystemTime>,
    },
    /// 407 from the configured proxy.
    #[error("proxy authentication failure: {0}")]
    ProxyAuthenticationFailure(String),
    /// Network failure before a response was received.
    #[error("socket error: {0}")]
    Socket(#[source] TransportError),
    /// A success status whose body could not be interpreted.
    #[error("invalid response: {message}")]
    InvalidResponse { message: String, body: String },
    /// The call was cancelled while waiting to retry.
    #[error("execution interrupted after {attempts} attempt(s)")]
    ExecutionInterrupted { attempts: u32 },
    /// Retryable failures persisted past the retry limit.
    #[error("retry limit exceeded after {attempts} attempt(s): {source}")]
    RetryLimitExceeded {
        attempts: u32,
        /// First failure observed during the call.
        source: Box<TdClientError>,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Flat tag of a [`TdClientError`] for branching on error semantics.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorKind {
    TargetNotFound,
    Conflict,
    AuthenticationFailure,
    ClientError,
    ServerError,
    UnexpectedResponseCode,
    TooManyRequests,
    ProxyAuthenticationFailure,
    SocketError,
    InvalidResponse,
    ExecutionInterrupted,
    RetryLimitExceeded,
    InvalidConfiguration,
    InvalidInput,
}

impl TdClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TargetNotFound(_) => ErrorKind::TargetNotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::AuthenticationFailure(_) => ErrorKind::AuthenticationFailure,
            Self::ClientError(_) => ErrorKind::ClientError,
            Self::ServerError(_) => ErrorKind::ServerError,
            Self::UnexpectedResponseCode(_) => ErrorKind::UnexpectedResponseCode,
            Self::TooManyRequests { .. } => ErrorKind::TooManyRequests,
            Self::ProxyAuthenticationFailure(_) => ErrorKind::ProxyAuthenticationFailure,
            Self::Socket(_) => ErrorKind::SocketError,
            Self::InvalidResponse { .. } => ErrorKind::InvalidResponse,
            Self::ExecutionInterrupted { .. } => ErrorKind::ExecutionInterrupted,
            Self::RetryLimitExceeded { .. } => ErrorKind::RetryLimitExceeded,
            Self::InvalidConfiguration(_) => ErrorKind::InvalidConfiguration,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
        }
    }

    /// HTTP details, looking through [`TdClientError::RetryLimitExceeded`].
    pub fn http_failure(&self) -> Option<&HttpFailure> {
        match self {
            Self::TargetNotFound(failure)
            | Self::Conflict(failure)
            | Self::AuthenticationFailure(failure)
            | Self::ClientError(failure)
            | Self::ServerError(failure)
            | Self::UnexpectedResponseCode(failure)
            | Self::TooManyRequests { failure, .. } => Some(failure),
            Self::RetryLimitExceeded { source, .. } => source.http_failure(),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        self.http_failure().map(|failure| failure.status)
    }

    pub fn retry_after(&self) -> Option<SystemTime> {
        match self {
            Self::TooManyRequests { retry_after, .. } => *retry_after,
            Self::RetryLimitExceeded { source, .. } => source.retry_after(),
            _ => None,
        }
    }

    /// Whether the failure is attributable to the server or the network
    /// rather than to the request itself.
    pub fn is_server_side(&self) -> bool {
        match self {
            Self::ServerError(_)
            | Self::UnexpectedResponseCode(_)
            | Self::TooManyRequests { .. }
            | Self::Socket(_) => true,
            Self::RetryLimitExceeded { source, .. } => source.is_server_side(),
            _ => false,
        }
    }
}
