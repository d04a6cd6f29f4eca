//! `td-client` is an async HTTP client for the Treasure Data REST API.
//!
//! Its core is the request executor, which turns one logical API call into
//! as many physical attempts as the retry policy allows:
//! - [`TdClient::execute`] drives a caller-built request through
//!   [`RequestExecutor`]
//! - failures are classified into [`TdClientError`] variants; server
//!   errors, rate limits and transient socket errors are retried with
//!   [`backoff`] and `Retry-After` handling, everything else surfaces
//!   immediately
//! - [`TdClient::get_json`], [`TdClient::post_json`] and
//!   [`TdClient::delete`] cover the common JSON endpoints

pub mod backoff;
pub mod classify;
mod client;
mod config;
mod error;
mod executor;
pub mod proxy;
pub mod retry;
pub mod retry_after;
pub mod timing;
pub mod transport;
mod wire;

pub use client::TdClient;
pub use config::{ClientConfig, DEFAULT_ENDPOINT};
pub use error::{ErrorKind, HttpFailure, TdClientError};
pub use executor::{RequestContext, RequestExecutor};
pub use proxy::{ProxyAuthCache, ProxyConfig};
pub use retry::{RetryMechanism, RetryPolicy};
pub use tokio_util::sync::CancellationToken;
pub use transport::{HttpRequest, HttpResponse, Transport, TransportError, TransportErrorKind};
pub use wire::ApiErrorMessage;

pub type Result<T> = std::result::Result<T, TdClientError>;
