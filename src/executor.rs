use std::{fmt, sync::Arc};

use arc_swap::ArcSwapOption;
use reqwest::header::{HeaderMap, HeaderValue, DATE};
use tokio_util::sync::CancellationToken;

use crate::{
    classify::{classify_response, classify_transport, Outcome},
    proxy::ProxyAuthCache,
    retry::{RetryPolicy, RetryState},
    retry_after::{plan_wait, RateLimitWait},
    timing::{Clock, Sleeper, SystemClock, TokioSleeper},
    transport::{HttpRequest, HttpResponse, Transport},
    Result, TdClientError,
};

/// Per-attempt information handed to request builders.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RequestContext {
    /// 1-based number of the physical send about to happen.
    pub attempt: u32,
}

/// Turns one logical call into as many physical attempts as the retry
/// policy allows.
///
/// The executor itself holds only shared, call-independent parts
/// (transport, proxy cache, default headers). Attempt counting and
/// backoff state are created inside [`RequestExecutor::execute`] and die
/// with the call.
///
/// Clones share one transport slot, emptied by
/// [`RequestExecutor::release_transport`].
#[derive(Clone)]
pub struct RequestExecutor {
    transport: Arc<ArcSwapOption<Arc<dyn Transport>>>,
    policy: RetryPolicy,
    proxy: Option<ProxyAuthCache>,
    default_headers: HeaderMap,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for RequestExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("policy", &self.policy)
            .field("released", &self.transport.load().is_none())
            .field("proxy", &self.proxy)
            .field("default_headers", &self.default_headers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl RequestExecutor {
    /// Creates an executor sending through `transport` with the given retry
    /// policy, real-time sleeps and the system clock.
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self {
            transport: Arc::new(ArcSwapOption::new(Some(Arc::new(transport)))),
            policy,
            proxy: None,
            default_headers: HeaderMap::new(),
            sleeper: Arc::new(TokioSleeper),
            clock: Arc::new(SystemClock),
        }
    }

    /// Marks every request as proxied.
    ///
    /// Plain-HTTP requests carry the cached credential themselves; HTTPS
    /// requests rely on the transport's proxy to authenticate the tunnel.
    pub fn with_proxy(mut self, proxy: ProxyAuthCache) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Headers stamped on every attempt unless the builder already set them.
    pub fn with_default_headers(mut self, headers: HeaderMap) -> Self {
        self.default_headers = headers;
        self
    }

    /// Replaces the sleeper used between attempts.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Replaces the clock used for `Date` headers and `Retry-After`
    /// deadlines.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Retry policy applied to every call.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Proxy credential cache, if requests are proxied.
    pub fn proxy(&self) -> Option<&ProxyAuthCache> {
        self.proxy.as_ref()
    }

    /// Drops the transport for this executor and all of its clones.
    ///
    /// Sends already in flight finish; the next attempt of any call fails
    /// with [`TdClientError::ExecutionInterrupted`].
    pub fn release_transport(&self) {
        #[cfg(feature = "tracing")]
        tracing::debug!("releasing transport");

        self.transport.store(None);
    }

    /// Whether the transport slot has been emptied.
    pub fn is_released(&self) -> bool {
        self.transport.load().is_none()
    }

    /// Runs the attempt loop.
    ///
    /// `build` is invoked once per attempt and must produce a fresh request.
    /// `handle` interprets a 2xx response; its errors end the call
    /// immediately. Cancelling `interrupt` while the call waits to retry
    /// fails it with [`TdClientError::ExecutionInterrupted`].
    pub async fn execute<T, B, H>(
        &self,
        interrupt: &CancellationToken,
        mut build: B,
        mut handle: H,
    ) -> Result<T>
    where
        B: FnMut(&RequestContext) -> Result<HttpRequest>,
        H: FnMut(HttpResponse) -> Result<T>,
    {
        let mut state = self.policy.start()?;
        let mut first_failure: Option<TdClientError> = None;
        let proxy_credentials = self
            .proxy
            .as_ref()
            .is_some_and(ProxyAuthCache::has_credentials);

        loop {
            let Some(transport) = self.transport.load_full() else {
                return Err(TdClientError::ExecutionInterrupted {
                    attempts: state.attempts(),
                });
            };
            let request = self.prepare(&mut build, &state)?;
            state.record_send();

            #[cfg(feature = "tracing")]
            tracing::debug!(
                method = %request.method,
                url = %request.url,
                attempt = state.attempts(),
                "sending request"
            );

            let sent = transport.send(request).await;
            drop(transport);
            let outcome = match sent {
                Ok(response) => classify_response(response, self.clock.now(), &mut handle),
                Err(err) => classify_transport(err),
            };
            let retryable = outcome.is_retryable();

            let (failure, wait) = match outcome {
                Outcome::RateLimited {
                    failure,
                    retry_after,
                } => {
                    let plan = plan_wait(
                        retry_after,
                        self.clock.now(),
                        state.backoff_wait(),
                        state.wait_budget(),
                    );
                    match plan {
                        RateLimitWait::OverBudget { deadline, wait } => {
                            #[cfg(feature = "tracing")]
                            tracing::warn!(
                                wait_ms = wait.as_millis() as u64,
                                budget_ms = state.wait_budget().as_millis() as u64,
                                "Retry-After exceeds the retry wait budget; giving up"
                            );
                            #[cfg(not(feature = "tracing"))]
                            let _ = wait;

                            return Err(TdClientError::TooManyRequests {
                                failure,
                                retry_after: Some(deadline),
                            });
                        }
                        RateLimitWait::Sleep { wait, deadline } => {
                            #[cfg(feature = "tracing")]
                            tracing::debug!(
                                deadline = ?deadline,
                                wait_ms = wait.as_millis() as u64,
                                "resolved Retry-After"
                            );
                            #[cfg(not(feature = "tracing"))]
                            let _ = deadline;

                            (
                                TdClientError::TooManyRequests {
                                    failure,
                                    retry_after,
                                },
                                wait,
                            )
                        }
                    }
                }
                outcome => match outcome.into_result() {
                    Ok(value) => return Ok(value),
                    Err(err) if !retryable => return Err(terminal(err, proxy_credentials)),
                    Err(err) => (err, state.backoff_wait()),
                },
            };

            if !state.should_retry() {
                #[cfg(feature = "tracing")]
                tracing::warn!(attempts = state.attempts(), error = %failure, "retry limit exceeded");

                return Err(TdClientError::RetryLimitExceeded {
                    attempts: state.attempts(),
                    source: Box::new(first_failure.unwrap_or(failure)),
                });
            }

            #[cfg(feature = "tracing")]
            tracing::warn!(
                attempt = state.attempts(),
                wait_ms = wait.as_millis() as u64,
                error = %failure,
                "retrying request"
            );

            if first_failure.is_none() {
                first_failure = Some(failure);
            }
            state.commit_retry();

            tokio::select! {
                biased;
                _ = interrupt.cancelled() => {
                    return Err(TdClientError::ExecutionInterrupted {
                        attempts: state.attempts(),
                    });
                }
                _ = self.sleeper.sleep(wait) => {}
            }
        }
    }

    fn prepare<B>(&self, build: &mut B, state: &RetryState) -> Result<HttpRequest>
    where
        B: FnMut(&RequestContext) -> Result<HttpRequest>,
    {
        let context = RequestContext {
            attempt: state.attempts() + 1,
        };
        let mut request = build(&context)?;

        for (name, value) in &self.default_headers {
            if !request.headers.contains_key(name) {
                request.headers.insert(name.clone(), value.clone());
            }
        }

        let date = httpdate::fmt_http_date(self.clock.now());
        let date = HeaderValue::from_str(&date)
            .map_err(|err| TdClientError::InvalidInput(format!("invalid Date header: {err}")))?;
        request.headers.insert(DATE, date);

        // HTTPS authenticates on the tunnel's CONNECT; the credential must
        // never travel inside TLS to the origin.
        if let Some(proxy) = &self.proxy {
            if request.url.scheme() == "http" {
                proxy.apply(&mut request.headers)?;
            }
        }
        Ok(request)
    }
}

fn terminal(err: TdClientError, proxy_credentials: bool) -> TdClientError {
    match err {
        TdClientError::ProxyAuthenticationFailure(message) if proxy_credentials => {
            TdClientError::ProxyAuthenticationFailure(format!(
                "proxy rejected the supplied credentials: {message}"
            ))
        }
        TdClientError::ProxyAuthenticationFailure(message) => {
            TdClientError::ProxyAuthenticationFailure(format!(
                "proxy requires authentication but no credentials are configured: {message}"
            ))
        }
        other => other,
    }
}
