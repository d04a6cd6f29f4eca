//! Maps a completed exchange, or a failed send, to an [`Outcome`].

use std::time::SystemTime;

use crate::{
    error::HttpFailure,
    retry_after::resolve_deadline,
    transport::{HttpResponse, TransportError, TransportErrorKind},
    Result, TdClientError,
};

/// Coarse class of an HTTP status code.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StatusClass {
    Success,
    NotFound,
    Conflict,
    Unauthorized,
    ProxyAuthenticationRequired,
    TooManyRequests,
    ClientError,
    ServerError,
    Unexpected,
}

pub fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Success,
        401 => StatusClass::Unauthorized,
        404 => StatusClass::NotFound,
        407 => StatusClass::ProxyAuthenticationRequired,
        409 => StatusClass::Conflict,
        429 => StatusClass::TooManyRequests,
        400..=499 => StatusClass::ClientError,
        500..=599 => StatusClass::ServerError,
        _ => StatusClass::Unexpected,
    }
}

/// Result of one attempt. Exactly one variant per attempt.
#[derive(Debug)]
pub enum Outcome<T> {
    /// 2xx, interpreted by the caller's handler.
    Success(T),
    /// 5xx. Retryable.
    ServerError(HttpFailure),
    /// A status outside the known classes. Retryable.
    Unexpected(HttpFailure),
    /// Terminal request-side failure, already typed.
    ClientError(TdClientError),
    /// 429. Retryable subject to the wait budget.
    RateLimited {
        failure: HttpFailure,
        retry_after: Option<SystemTime>,
    },
    /// Send failed before a response arrived. Retryable when transient.
    Transport(TransportError),
    /// 2xx with a body the handler could not interpret. Terminal.
    Malformed(TdClientError),
}

impl<T> Outcome<T> {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ServerError(_) | Self::Unexpected(_) | Self::RateLimited { .. } => true,
            Self::Transport(err) => err.kind().is_transient(),
            Self::Success(_) | Self::ClientError(_) | Self::Malformed(_) => false,
        }
    }

    /// Converts a failed outcome into the error surfaced to the caller.
    ///
    /// Returns `Ok` only for [`Outcome::Success`].
    pub fn into_result(self) -> Result<T> {
        match self {
            Self::Success(value) => Ok(value),
            Self::ServerError(failure) => Err(TdClientError::ServerError(failure)),
            Self::Unexpected(failure) => Err(TdClientError::UnexpectedResponseCode(failure)),
            Self::ClientError(err) | Self::Malformed(err) => Err(err),
            Self::RateLimited {
                failure,
                retry_after,
            } => Err(TdClientError::TooManyRequests {
                failure,
                retry_after,
            }),
            Self::Transport(err) => Err(TdClientError::Socket(err)),
        }
    }
}

/// Classifies a received response, running `handler` on success.
///
/// Handler errors are authoritative: [`TdClientError::InvalidResponse`]
/// becomes [`Outcome::Malformed`], any other typed error is terminal as is.
pub fn classify_response<T, H>(response: HttpResponse, now: SystemTime, handler: H) -> Outcome<T>
where
    H: FnOnce(HttpResponse) -> Result<T>,
{
    match classify_status(response.status) {
        StatusClass::Success => match handler(response) {
            Ok(value) => Outcome::Success(value),
            Err(err @ TdClientError::InvalidResponse { .. }) => Outcome::Malformed(err),
            Err(err) => Outcome::ClientError(err),
        },
        class => classify_failure(class, response, now),
    }
}

fn classify_failure<T>(class: StatusClass, response: HttpResponse, now: SystemTime) -> Outcome<T> {
    let failure = HttpFailure::from_response(response.status, &response.body);
    match class {
        StatusClass::NotFound => Outcome::ClientError(TdClientError::TargetNotFound(failure)),
        StatusClass::Conflict => Outcome::ClientError(TdClientError::Conflict(failure)),
        StatusClass::Unauthorized => {
            Outcome::ClientError(TdClientError::AuthenticationFailure(failure))
        }
        StatusClass::ProxyAuthenticationRequired => Outcome::ClientError(
            TdClientError::ProxyAuthenticationFailure(failure.message),
        ),
        StatusClass::ClientError => Outcome::ClientError(TdClientError::ClientError(failure)),
        StatusClass::TooManyRequests => {
            let retry_after =
                resolve_deadline(response.header(reqwest::header::RETRY_AFTER), now);
            Outcome::RateLimited {
                failure,
                retry_after,
            }
        }
        StatusClass::ServerError => Outcome::ServerError(failure),
        StatusClass::Success | StatusClass::Unexpected => Outcome::Unexpected(failure),
    }
}

/// Classifies a failed send. A proxy refusing the tunnel is reported like
/// a 407 response.
pub fn classify_transport<T>(err: TransportError) -> Outcome<T> {
    match err.kind() {
        TransportErrorKind::ProxyAuthentication => Outcome::ClientError(
            TdClientError::ProxyAuthenticationFailure(err.message().to_owned()),
        ),
        _ => Outcome::Transport(err),
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use reqwest::header::HeaderValue;

    use super::*;

    fn ok_text(response: HttpResponse) -> Result<String> {
        Ok(response.body_text())
    }

    #[test]
    fn status_classes() {
        assert_eq!(classify_status(200), StatusClass::Success);
        assert_eq!(classify_status(204), StatusClass::Success);
        assert_eq!(classify_status(400), StatusClass::ClientError);
        assert_eq!(classify_status(401), StatusClass::Unauthorized);
        assert_eq!(classify_status(404), StatusClass::NotFound);
        assert_eq!(classify_status(407), StatusClass::ProxyAuthenticationRequired);
        assert_eq!(classify_status(409), StatusClass::Conflict);
        assert_eq!(classify_status(429), StatusClass::TooManyRequests);
        assert_eq!(classify_status(500), StatusClass::ServerError);
        assert_eq!(classify_status(599), StatusClass::ServerError);
        assert_eq!(classify_status(302), StatusClass::Unexpected);
        assert_eq!(classify_status(99), StatusClass::Unexpected);
        assert_eq!(classify_status(600), StatusClass::Unexpected);
    }

    #[test]
    fn success_runs_handler() {
        let outcome = classify_response(HttpResponse::new(200, "hello"), UNIX_EPOCH, ok_text);
        assert!(matches!(outcome, Outcome::Success(ref body) if body == "hello"));
    }

    #[test]
    fn invalid_body_is_malformed_and_terminal() {
        let outcome: Outcome<()> =
            classify_response(HttpResponse::new(200, "{"), UNIX_EPOCH, |response| {
                Err(TdClientError::InvalidResponse {
                    message: "truncated".to_owned(),
                    body: response.body_text(),
                })
            });
        assert!(matches!(outcome, Outcome::Malformed(_)));
        assert!(!outcome.is_retryable());
    }

    #[test]
    fn not_found_and_conflict_are_terminal() {
        let outcome = classify_response(HttpResponse::new(404, "missing"), UNIX_EPOCH, ok_text);
        assert!(!outcome.is_retryable());
        assert!(matches!(
            outcome.into_result(),
            Err(TdClientError::TargetNotFound(_))
        ));

        let outcome = classify_response(HttpResponse::new(409, "exists"), UNIX_EPOCH, ok_text);
        assert!(matches!(
            outcome.into_result(),
            Err(TdClientError::Conflict(_))
        ));
    }

    #[test]
    fn server_and_unknown_statuses_are_retryable() {
        let outcome = classify_response(HttpResponse::new(503, ""), UNIX_EPOCH, ok_text);
        assert!(matches!(outcome, Outcome::ServerError(_)));
        assert!(outcome.is_retryable());

        let outcome = classify_response(HttpResponse::new(700, "??"), UNIX_EPOCH, ok_text);
        assert!(outcome.is_retryable());
        match outcome.into_result() {
            Err(TdClientError::UnexpectedResponseCode(failure)) => {
                assert_eq!(failure.status, 700);
                assert_eq!(failure.body, "??");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn rate_limit_resolves_retry_after() {
        let now = UNIX_EPOCH + Duration::from_secs(1_000);
        let mut response = HttpResponse::new(429, "slow down");
        response
            .headers
            .insert("retry-after", HeaderValue::from_static("30"));
        match classify_response(response, now, ok_text) {
            Outcome::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Some(now + Duration::from_secs(30)));
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
    }

    #[test]
    fn transport_retryability_follows_kind() {
        let reset: Outcome<()> = classify_transport(TransportError::new(
            TransportErrorKind::ConnectionReset,
            "Connection reset by peer",
        ));
        assert!(reset.is_retryable());

        let other: Outcome<()> =
            classify_transport(TransportError::new(TransportErrorKind::Other, "bad certificate"));
        assert!(!other.is_retryable());
        assert!(matches!(other.into_result(), Err(TdClientError::Socket(_))));
    }

    #[test]
    fn refused_proxy_tunnel_is_a_proxy_failure() {
        let outcome: Outcome<()> = classify_transport(TransportError::new(
            TransportErrorKind::ProxyAuthentication,
            "proxy authentication required",
        ));
        assert!(!outcome.is_retryable());
        assert!(matches!(
            outcome.into_result(),
            Err(TdClientError::ProxyAuthenticationFailure(_))
        ));
    }
}
