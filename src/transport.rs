use std::{error::Error as StdError, fmt, time::Duration};

use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderValue},
    Method, Url,
};

/// One physical HTTP request.
///
/// Requests are never reused across attempts; the executor asks the
/// caller's builder for a fresh one every time.
#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: Url) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn with_header(mut self, name: reqwest::header::HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// A completed HTTP exchange with its body fully read.
#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn header(&self, name: impl reqwest::header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Coarse cause of a failed send.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransportErrorKind {
    ConnectionReset,
    BrokenPipe,
    Closed,
    Connect,
    Timeout,
    /// The proxy refused to open a tunnel without valid credentials.
    ProxyAuthentication,
    Other,
}

impl TransportErrorKind {
    /// Kinds worth another attempt.
    pub fn is_transient(self) -> bool {
        !matches!(self, Self::ProxyAuthentication | Self::Other)
    }
}

/// Failure raised by a [`Transport`] before a response was received.
#[derive(Debug)]
pub struct TransportError {
    kind: TransportErrorKind,
    message: String,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Wraps an arbitrary error, inferring the kind from its message and
    /// source chain.
    pub fn from_source(source: impl StdError + Send + Sync + 'static) -> Self {
        let kind = kind_from_chain(&source);
        Self {
            kind,
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl StdError for TransportError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|err| err as &(dyn StdError + 'static))
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        let kind = match kind_from_chain(&err) {
            TransportErrorKind::ProxyAuthentication => TransportErrorKind::ProxyAuthentication,
            _ if err.is_timeout() => TransportErrorKind::Timeout,
            TransportErrorKind::Other if err.is_connect() => TransportErrorKind::Connect,
            kind => kind,
        };
        Self {
            kind,
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

fn kind_from_chain(err: &(dyn StdError + 'static)) -> TransportErrorKind {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            match io.kind() {
                std::io::ErrorKind::ConnectionReset => return TransportErrorKind::ConnectionReset,
                std::io::ErrorKind::BrokenPipe => return TransportErrorKind::BrokenPipe,
                std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::NotConnected
                | std::io::ErrorKind::UnexpectedEof => return TransportErrorKind::Closed,
                std::io::ErrorKind::ConnectionRefused => return TransportErrorKind::Connect,
                std::io::ErrorKind::TimedOut => return TransportErrorKind::Timeout,
                _ => {}
            }
        }
        let kind = kind_from_message(&err.to_string());
        if kind != TransportErrorKind::Other {
            return kind;
        }
        current = err.source();
    }
    TransportErrorKind::Other
}

fn kind_from_message(message: &str) -> TransportErrorKind {
    let message = message.to_ascii_lowercase();
    if message.contains("proxy authentication required")
        || message.contains("proxy authorization required")
    {
        TransportErrorKind::ProxyAuthentication
    } else if message.contains("connection reset") {
        TransportErrorKind::ConnectionReset
    } else if message.contains("broken pipe") {
        TransportErrorKind::BrokenPipe
    } else if message.contains("socket closed")
        || message.contains("connection closed")
        || message.contains("socket is closed")
    {
        TransportErrorKind::Closed
    } else if message.contains("connection refused") || message.contains("connect error") {
        TransportErrorKind::Connect
    } else {
        TransportErrorKind::Other
    }
}

/// Sends physical requests. Must be safe for concurrent use by many calls.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Pooled `reqwest` transport.
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Builds a pooled client with connect/read timeouts and an optional
    /// forward proxy.
    ///
    /// Proxy credentials belong on the [`reqwest::Proxy`] itself so that
    /// the `CONNECT` of an HTTPS tunnel carries them too.
    pub fn with_timeouts(
        connect_timeout: Duration,
        read_timeout: Duration,
        proxy: Option<reqwest::Proxy>,
    ) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout);
        if let Some(proxy) = proxy {
            builder = builder.proxy(proxy);
        }
        Ok(Self::new(builder.build()?))
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self
            .http
            .request(request.method, request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        Ok(HttpResponse {
            status,
            headers,
            body: body.to_vec(),
        })
    }
}
