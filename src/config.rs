use std::{fmt, time::Duration};

use serde::Deserialize;

use crate::{proxy::ProxyConfig, retry::RetryPolicy, Result, TdClientError};

pub const DEFAULT_ENDPOINT: &str = "api.treasuredata.com";

/// Configures endpoint, credentials, proxy, timeouts and retry behavior.
#[derive(Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// API host name, without scheme.
    pub endpoint: String,
    pub port: Option<u16>,
    pub use_ssl: bool,
    pub api_key: Option<String>,
    pub proxy: Option<ProxyConfig>,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_owned(),
            port: None,
            use_ssl: true,
            api_key: None,
            proxy: None,
            connect_timeout_ms: 15_000,
            read_timeout_ms: 60_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("endpoint", &self.endpoint)
            .field("port", &self.port)
            .field("use_ssl", &self.use_ssl)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("proxy", &self.proxy)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("read_timeout_ms", &self.read_timeout_ms)
            .field("retry", &self.retry)
            .finish()
    }
}

impl ClientConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            ..Self::default()
        }
    }

    /// Sets the endpoint, accepting `host`, `host:port` or a full
    /// `http(s)://host[:port]` form.
    pub fn with_endpoint(mut self, endpoint: &str) -> Result<Self> {
        let trimmed = endpoint.trim().trim_end_matches('/');
        let rest = if let Some(rest) = trimmed.strip_prefix("https://") {
            self.use_ssl = true;
            rest
        } else if let Some(rest) = trimmed.strip_prefix("http://") {
            self.use_ssl = false;
            rest
        } else {
            trimmed
        };

        match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    TdClientError::InvalidConfiguration(format!("invalid endpoint port in '{endpoint}'"))
                })?;
                self.endpoint = host.to_owned();
                self.port = Some(port);
            }
            None => self.endpoint = rest.to_owned(),
        }
        Ok(self)
    }

    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Reads configuration from `TD_*` environment variables on top of the
    /// defaults.
    ///
    /// - `TD_API_KEY`
    /// - `TD_API_SERVER`: endpoint, optionally with scheme and port
    /// - `TD_CLIENT_PROXY`: `[scheme://][user:password@]host[:port]`
    /// - `TD_CLIENT_RETRY_LIMIT`, `TD_CLIENT_RETRY_INITIAL_INTERVAL_MILLIS`,
    ///   `TD_CLIENT_RETRY_MAX_INTERVAL_MILLIS`, `TD_CLIENT_RETRY_MULTIPLIER`,
    ///   `TD_CLIENT_RETRY_MECHANISM`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let mut config = Self::default();

        config.api_key = var("TD_API_KEY").map(|key| key.trim().to_owned());
        if let Some(server) = var("TD_API_SERVER") {
            config = config.with_endpoint(&server)?;
        }
        if let Some(proxy) = var("TD_CLIENT_PROXY") {
            config.proxy = Some(ProxyConfig::parse(&proxy)?);
        }
        if let Some(value) = var("TD_CLIENT_RETRY_LIMIT") {
            config.retry.retry_limit = parse_number("TD_CLIENT_RETRY_LIMIT", &value)?;
        }
        if let Some(value) = var("TD_CLIENT_RETRY_INITIAL_INTERVAL_MILLIS") {
            config.retry.base_interval_millis =
                parse_number("TD_CLIENT_RETRY_INITIAL_INTERVAL_MILLIS", &value)?;
        }
        if let Some(value) = var("TD_CLIENT_RETRY_MAX_INTERVAL_MILLIS") {
            config.retry.max_interval_millis =
                parse_number("TD_CLIENT_RETRY_MAX_INTERVAL_MILLIS", &value)?;
        }
        if let Some(value) = var("TD_CLIENT_RETRY_MULTIPLIER") {
            config.retry.multiplier = parse_number("TD_CLIENT_RETRY_MULTIPLIER", &value)?;
        }
        if let Some(value) = var("TD_CLIENT_RETRY_MECHANISM") {
            config.retry.mechanism = value.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|err| {
            TdClientError::InvalidConfiguration(format!("invalid client configuration: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(TdClientError::InvalidConfiguration(
                "endpoint must not be empty".to_owned(),
            ));
        }
        if self.connect_timeout_ms == 0 || self.read_timeout_ms == 0 {
            return Err(TdClientError::InvalidConfiguration(
                "timeouts must be greater than 0".to_owned(),
            ));
        }
        if let Some(proxy) = &self.proxy {
            if proxy.host.trim().is_empty() {
                return Err(TdClientError::InvalidConfiguration(
                    "proxy host must not be empty".to_owned(),
                ));
            }
        }
        self.retry.validate()
    }

    /// `http(s)://endpoint[:port]`
    pub fn base_url(&self) -> String {
        let scheme = if self.use_ssl { "https" } else { "http" };
        match self.port {
            Some(port) => format!("{scheme}://{}:{port}", self.endpoint),
            None => format!("{scheme}://{}", self.endpoint),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse::<T>().map_err(|_| {
        TdClientError::InvalidConfiguration(format!("{name} has an invalid value '{value}'"))
    })
}
