use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use arc_swap::ArcSwapOption;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::header::{HeaderMap, HeaderValue, PROXY_AUTHORIZATION};
use serde::Deserialize;

use crate::{Result, TdClientError};

/// Forward proxy settings.
#[derive(Clone, Deserialize, PartialEq, Eq)]
pub struct ProxyConfig {
    pub host: String,
    #[serde(default = "default_proxy_port")]
    pub port: u16,
    #[serde(default)]
    pub use_ssl: bool,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_proxy_port() -> u16 {
    8080
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("use_ssl", &self.use_ssl)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ProxyConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            use_ssl: false,
            user: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    /// Parses `[http[s]://][user:password@]host[:port]`.
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = || TdClientError::InvalidConfiguration(format!("invalid proxy '{value}'"));
        let trimmed = value.trim();
        let (use_ssl, rest) = if let Some(rest) = trimmed.strip_prefix("https://") {
            (true, rest)
        } else {
            (false, trimmed.strip_prefix("http://").unwrap_or(trimmed))
        };
        let rest = rest.trim_end_matches('/');

        let (credentials, address) = match rest.rsplit_once('@') {
            Some((credentials, address)) => (Some(credentials), address),
            None => (None, rest),
        };
        let (host, port) = match address.rsplit_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
            None => (address, default_proxy_port()),
        };
        if host.is_empty() {
            return Err(invalid());
        }

        let mut config = Self::new(host, port);
        config.use_ssl = use_ssl;
        if let Some(credentials) = credentials {
            let (user, password) = credentials.split_once(':').ok_or_else(invalid)?;
            config = config.with_credentials(user, password);
        }
        Ok(config)
    }

    pub fn url(&self) -> String {
        let scheme = if self.use_ssl { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }

    pub fn has_credentials(&self) -> bool {
        self.user.is_some()
    }
}

/// Process-lifetime cache of the `Proxy-Authorization` header value.
///
/// The first proxied request computes the value and stores it with a
/// single atomic swap. Two requests racing on first use may both compute
/// it; the result is deterministic, so either store wins harmlessly.
#[derive(Clone)]
pub struct ProxyAuthCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    user: Option<String>,
    password: Option<String>,
    cached: ArcSwapOption<HeaderValue>,
    computations: AtomicUsize,
}

impl fmt::Debug for ProxyAuthCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyAuthCache")
            .field("user", &self.inner.user)
            .field("cached", &self.inner.cached.load().is_some())
            .finish()
    }
}

impl ProxyAuthCache {
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                user: config.user.clone(),
                password: config.password.clone(),
                cached: ArcSwapOption::empty(),
                computations: AtomicUsize::new(0),
            }),
        }
    }

    /// Attaches the credential header to a proxied request.
    ///
    /// Returns whether a credential was attached; without a configured
    /// user there is nothing to send.
    pub fn apply(&self, headers: &mut HeaderMap) -> Result<bool> {
        match self.header_value()? {
            Some(value) => {
                headers.insert(PROXY_AUTHORIZATION, value);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// The cached header value, computing it on first use.
    pub fn header_value(&self) -> Result<Option<HeaderValue>> {
        if let Some(cached) = self.inner.cached.load_full() {
            return Ok(Some((*cached).clone()));
        }
        let Some(user) = self.inner.user.as_deref() else {
            return Ok(None);
        };

        let value = basic_auth(user, self.inner.password.as_deref().unwrap_or_default())?;
        self.inner.computations.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "tracing")]
        tracing::debug!(user, "computed proxy credential");

        self.inner.cached.store(Some(Arc::new(value.clone())));
        Ok(Some(value))
    }

    /// Whether a user is configured, so a credential is sent.
    pub fn has_credentials(&self) -> bool {
        self.inner.user.is_some()
    }

    /// How many times the credential has been computed.
    pub fn computations(&self) -> usize {
        self.inner.computations.load(Ordering::Relaxed)
    }
}

fn basic_auth(user: &str, password: &str) -> Result<HeaderValue> {
    let encoded = STANDARD.encode(format!("{user}:{password}"));
    let mut value = HeaderValue::from_str(&format!("Basic {encoded}")).map_err(|err| {
        TdClientError::InvalidConfiguration(format!("invalid proxy credential: {err}"))
    })?;
    value.set_sensitive(true);
    Ok(value)
}
