use std::{fmt, sync::Arc};

use reqwest::{
    header::{self, HeaderMap, HeaderValue},
    Method, Url,
};
use serde::{de::DeserializeOwned, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    executor::{RequestContext, RequestExecutor},
    proxy::{ProxyAuthCache, ProxyConfig},
    timing::{Clock, Sleeper},
    transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport},
    ClientConfig, Result, TdClientError,
};

const USER_AGENT: &str = concat!("td-client-rust/", env!("CARGO_PKG_VERSION"));

/// HTTP client for the Treasure Data REST API.
///
/// Cloning is cheap; clones share the connection pool, the proxy
/// credential cache and the shutdown signal.
#[derive(Clone)]
pub struct TdClient {
    config: Arc<ClientConfig>,
    executor: RequestExecutor,
    shutdown: CancellationToken,
}

impl fmt::Debug for TdClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TdClient")
            .field("config", &self.config)
            .field("closed", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl TdClient {
    /// Creates a client backed by a pooled `reqwest` transport.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let proxy_auth = config.proxy.as_ref().map(ProxyAuthCache::new);
        let proxy = match (&config.proxy, &proxy_auth) {
            (Some(proxy), Some(auth)) => Some(reqwest_proxy(proxy, auth)?),
            _ => None,
        };
        let transport =
            ReqwestTransport::with_timeouts(config.connect_timeout(), config.read_timeout(), proxy)
                .map_err(|err| {
                    TdClientError::InvalidConfiguration(format!("cannot build HTTP client: {err}"))
                })?;
        Self::assemble(config, Arc::new(transport), proxy_auth)
    }

    /// Creates a client from `TD_*` environment variables.
    ///
    /// See [`ClientConfig::from_env`].
    pub fn from_env() -> Result<Self> {
        Self::new(ClientConfig::from_env()?)
    }

    /// Creates a client over a caller-supplied transport.
    ///
    /// A configured proxy only affects the credential stamped on plain-HTTP
    /// requests; routing through the proxy is the transport's job.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let proxy_auth = config.proxy.as_ref().map(ProxyAuthCache::new);
        Self::assemble(config, transport, proxy_auth)
    }

    /// Creates a client from every replaceable part: transport, retry
    /// sleeper and clock.
    pub fn with_parts(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        sleeper: Arc<dyn Sleeper>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Ok(Self::with_transport(config, transport)?.with_timing(sleeper, clock))
    }

    fn assemble(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        proxy_auth: Option<ProxyAuthCache>,
    ) -> Result<Self> {
        let mut executor = RequestExecutor::new(transport, config.retry.clone())
            .with_default_headers(default_headers(&config)?);
        if let Some(proxy_auth) = proxy_auth {
            executor = executor.with_proxy(proxy_auth);
        }
        Ok(Self {
            config: Arc::new(config),
            executor,
            shutdown: CancellationToken::new(),
        })
    }

    /// Replaces the retry sleeper and clock, mainly for tests.
    pub fn with_timing(mut self, sleeper: Arc<dyn Sleeper>, clock: Arc<dyn Clock>) -> Self {
        self.executor = self.executor.with_sleeper(sleeper).with_clock(clock);
        self
    }

    /// Configuration the client was built from.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Shared proxy credential cache, present when a proxy is configured.
    pub fn proxy_auth_cache(&self) -> Option<&ProxyAuthCache> {
        self.executor.proxy()
    }

    /// Executes one logical call with retries.
    ///
    /// The call is interrupted if [`TdClient::close`] runs while it waits to
    /// retry.
    pub async fn execute<T, B, H>(&self, build: B, handle: H) -> Result<T>
    where
        B: FnMut(&RequestContext) -> Result<HttpRequest>,
        H: FnMut(HttpResponse) -> Result<T>,
    {
        let interrupt = self.interrupt_token();
        self.execute_interruptible(&interrupt, build, handle).await
    }

    /// A per-call cancellation token, also fired by [`TdClient::close`].
    pub fn interrupt_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Like [`TdClient::execute`], stopping when `interrupt` fires during a
    /// retry wait. Pass a token from [`TdClient::interrupt_token`] to keep
    /// honouring [`TdClient::close`].
    pub async fn execute_interruptible<T, B, H>(
        &self,
        interrupt: &CancellationToken,
        build: B,
        handle: H,
    ) -> Result<T>
    where
        B: FnMut(&RequestContext) -> Result<HttpRequest>,
        H: FnMut(HttpResponse) -> Result<T>,
    {
        if self.is_closed() {
            return Err(TdClientError::InvalidInput("client is closed".to_owned()));
        }
        self.executor.execute(interrupt, build, handle).await
    }

    /// GETs `path` and decodes the JSON response.
    pub async fn get_json<T>(&self, path: &str, query: &[(&str, &str)]) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let url = self.url(path, query)?;
        self.execute(
            |_| Ok(HttpRequest::get(url.clone()).with_header(header::ACCEPT, json_mime())),
            decode_json,
        )
        .await
    }

    /// POSTs a JSON body to `path` and decodes the JSON response.
    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.url(path, &[])?;
        let payload = serde_json::to_vec(body).map_err(|err| {
            TdClientError::InvalidInput(format!("cannot encode request body: {err}"))
        })?;
        self.execute(
            |_| {
                Ok(HttpRequest::post(url.clone())
                    .with_header(header::CONTENT_TYPE, json_mime())
                    .with_header(header::ACCEPT, json_mime())
                    .with_body(payload.clone()))
            },
            decode_json,
        )
        .await
    }

    /// DELETEs `path`, discarding the response body.
    pub async fn delete(&self, path: &str) -> Result<()> {
        let url = self.url(path, &[])?;
        self.execute(
            |_| Ok(HttpRequest::new(Method::DELETE, url.clone())),
            |_| Ok(()),
        )
        .await
    }

    /// Builds an absolute URL under the configured endpoint.
    pub fn url(&self, path: &str, query: &[(&str, &str)]) -> Result<Url> {
        let base = self.config.base_url();
        let path = path.trim_start_matches('/');
        let mut url = Url::parse(&format!("{base}/{path}"))
            .map_err(|err| TdClientError::InvalidInput(format!("invalid path '{path}': {err}")))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    /// Interrupts calls waiting to retry, refuses new ones and drops the
    /// pooled transport for every clone.
    pub fn close(&self) {
        #[cfg(feature = "tracing")]
        tracing::debug!("closing client");

        self.shutdown.cancel();
        self.executor.release_transport();
    }

    /// Whether [`TdClient::close`] has run on this client or a clone.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

fn json_mime() -> HeaderValue {
    HeaderValue::from_static("application/json")
}

fn decode_json<T: DeserializeOwned>(response: HttpResponse) -> Result<T> {
    serde_json::from_slice(&response.body).map_err(|err| TdClientError::InvalidResponse {
        message: format!("invalid JSON response: {err}"),
        body: response.body_text(),
    })
}

fn reqwest_proxy(proxy: &ProxyConfig, auth: &ProxyAuthCache) -> Result<reqwest::Proxy> {
    let mut built = reqwest::Proxy::all(proxy.url())
        .map_err(|err| TdClientError::InvalidConfiguration(format!("invalid proxy: {err}")))?;
    if let Some(credential) = auth.header_value()? {
        built = built.custom_http_auth(credential);
    }
    Ok(built)
}

fn default_headers(config: &ClientConfig) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
    if let Some(api_key) = &config.api_key {
        let mut value = HeaderValue::from_str(&normalize_td_authorization(api_key)).map_err(|_| {
            TdClientError::InvalidConfiguration("API key contains invalid characters".to_owned())
        })?;
        value.set_sensitive(true);
        headers.insert(header::AUTHORIZATION, value);
    }
    Ok(headers)
}

fn normalize_td_authorization(api_key: &str) -> String {
    let trimmed = api_key.trim();
    let prefix = trimmed.get(..4);
    if prefix.is_some_and(|value| value.eq_ignore_ascii_case("td1 ")) {
        trimmed.to_owned()
    } else {
        format!("TD1 {trimmed}")
    }
}
