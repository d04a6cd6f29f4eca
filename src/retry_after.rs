//! `Retry-After` handling for rate-limited responses.
//!
//! The header is accepted as delta-seconds (`Retry-After: 120`) or as an
//! HTTP-date (`Retry-After: Fri, 31 Dec 1999 23:59:59 GMT`). Anything else
//! is ignored and the backoff strategy decides the wait.

use std::time::{Duration, SystemTime};

/// Parses a header value into an absolute deadline.
///
/// Returns `None` for a missing or unparsable value.
pub fn resolve_deadline(header: Option<&str>, now: SystemTime) -> Option<SystemTime> {
    let raw = header?.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(seconds) = raw.parse::<u64>() {
        return now.checked_add(Duration::from_secs(seconds));
    }

    httpdate::parse_http_date(raw).ok()
}

/// Wait chosen for a rate-limited attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RateLimitWait {
    /// Sleep this long, then retry.
    Sleep {
        wait: Duration,
        deadline: Option<SystemTime>,
    },
    /// The server asked for more than the policy is willing to wait.
    OverBudget { deadline: SystemTime, wait: Duration },
}

/// Reconciles the server's hint with the backoff wait and the wait budget.
///
/// A deadline in the past means "retry now".
pub fn plan_wait(
    deadline: Option<SystemTime>,
    now: SystemTime,
    backoff_wait: Duration,
    budget: Duration,
) -> RateLimitWait {
    let Some(deadline) = deadline else {
        return RateLimitWait::Sleep {
            wait: backoff_wait,
            deadline: None,
        };
    };

    let wait = deadline.duration_since(now).unwrap_or(Duration::ZERO);
    if wait > budget {
        RateLimitWait::OverBudget { deadline, wait }
    } else {
        RateLimitWait::Sleep {
            wait,
            deadline: Some(deadline),
        }
    }
}
