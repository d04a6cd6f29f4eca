use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, SystemTime},
};

use axum::{
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    Router,
};
use serde_json::{json, Value as JsonValue};
use td_client::{
    ClientConfig, ErrorKind, HttpRequest, ProxyConfig, RetryMechanism, RetryPolicy, TdClient,
    TdClientError,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Clone)]
struct MockResponse {
    status: StatusCode,
    body: String,
    retry_after: Option<&'static str>,
}

impl MockResponse {
    fn json(status: StatusCode, body: JsonValue) -> Self {
        Self {
            status,
            body: body.to_string(),
            retry_after: None,
        }
    }

    fn raw(status: StatusCode, body: &str) -> Self {
        Self {
            status,
            body: body.to_owned(),
            retry_after: None,
        }
    }

    fn with_retry_after(mut self, value: &'static str) -> Self {
        self.retry_after = Some(value);
        self
    }
}

#[derive(Clone)]
struct MockState {
    responses: Arc<Mutex<VecDeque<MockResponse>>>,
    fallback: MockResponse,
    hits: Arc<AtomicUsize>,
    seen_headers: Arc<Mutex<Vec<HeaderMap>>>,
}

async fn api_handler(
    State(state): State<MockState>,
    headers: HeaderMap,
    _body: String,
) -> impl IntoResponse {
    state.hits.fetch_add(1, Ordering::SeqCst);
    state
        .seen_headers
        .lock()
        .expect("header log mutex must not be poisoned")
        .push(headers);

    let response = {
        let mut queue = state
            .responses
            .lock()
            .expect("response queue mutex must not be poisoned");
        queue.pop_front().unwrap_or_else(|| state.fallback.clone())
    };

    let mut out = HeaderMap::new();
    out.insert("content-type", HeaderValue::from_static("application/json"));
    if let Some(retry_after) = response.retry_after {
        out.insert("retry-after", HeaderValue::from_static(retry_after));
    }
    (response.status, out, response.body)
}

struct TestServer {
    base_url: String,
    hits: Arc<AtomicUsize>,
    seen_headers: Arc<Mutex<Vec<HeaderMap>>>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl TestServer {
    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    fn client(&self, retry: RetryPolicy) -> TdClient {
        let config = ClientConfig::new("1/test-key")
            .with_endpoint(&self.base_url)
            .expect("mock endpoint must parse")
            .with_retry(retry);
        TdClient::new(config).expect("client must build")
    }
}

async fn spawn_server(responses: Vec<MockResponse>) -> TestServer {
    spawn_server_with_fallback(
        responses,
        MockResponse::json(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"error": "no mock response available"}),
        ),
    )
    .await
}

async fn spawn_server_with_fallback(
    responses: Vec<MockResponse>,
    fallback: MockResponse,
) -> TestServer {
    let state = MockState {
        responses: Arc::new(Mutex::new(responses.into())),
        fallback,
        hits: Arc::new(AtomicUsize::new(0)),
        seen_headers: Arc::new(Mutex::new(Vec::new())),
    };

    let app = Router::new()
        .fallback(api_handler)
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("must bind test listener");
    let address = listener.local_addr().expect("must have local addr");
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("mock server must run");
    });

    TestServer {
        base_url: format!("http://{address}"),
        hits: state.hits,
        seen_headers: state.seen_headers,
        task,
    }
}

fn fast_retry(retry_limit: u32) -> RetryPolicy {
    RetryPolicy {
        mechanism: RetryMechanism::Exponential,
        retry_limit,
        base_interval_millis: 1,
        max_interval_millis: 20,
        multiplier: 2.0,
    }
}

fn status_body() -> JsonValue {
    json!({"status": "ok"})
}

#[tokio::test]
async fn get_json_sends_auth_and_date_headers() {
    let server = spawn_server(vec![MockResponse::json(StatusCode::OK, status_body())]).await;
    let client = server.client(fast_retry(0));

    let body: JsonValue = client
        .get_json("/v3/system/server_status", &[])
        .await
        .expect("request must succeed");

    assert_eq!(body, status_body());
    assert_eq!(server.hits(), 1);

    let seen = server.seen_headers.lock().unwrap();
    let headers = &seen[0];
    assert_eq!(headers.get("authorization").unwrap(), "TD1 1/test-key");
    assert!(headers
        .get("user-agent")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("td-client-rust/"));
    let date = headers.get("date").unwrap().to_str().unwrap();
    let sent_at = httpdate::parse_http_date(date).expect("Date header must be an HTTP date");
    let skew = SystemTime::now()
        .duration_since(sent_at)
        .unwrap_or_default();
    assert!(skew < Duration::from_secs(60));
}

#[tokio::test]
async fn retries_server_errors_until_success() {
    let server = spawn_server(vec![
        MockResponse::json(StatusCode::INTERNAL_SERVER_ERROR, json!({"error": "boom"})),
        MockResponse::json(StatusCode::BAD_GATEWAY, json!({"error": "boom"})),
        MockResponse::json(StatusCode::OK, status_body()),
    ])
    .await;
    let client = server.client(fast_retry(2));

    let body: JsonValue = client
        .get_json("/v3/system/server_status", &[])
        .await
        .expect("request must succeed after retries");

    assert_eq!(body, status_body());
    assert_eq!(server.hits(), 3);
}

#[tokio::test]
async fn exhausted_retries_surface_retry_limit_error() {
    let server = spawn_server(vec![]).await;
    let client = server.client(fast_retry(2));

    let err = client
        .get_json::<JsonValue>("/v3/database/list", &[])
        .await
        .expect_err("request must fail");

    assert_eq!(server.hits(), 3);
    assert_eq!(err.kind(), ErrorKind::RetryLimitExceeded);
    assert_eq!(err.status(), Some(500));
    assert!(err.is_server_side());
}

#[tokio::test]
async fn not_found_fails_immediately_with_api_message() {
    let server = spawn_server(vec![MockResponse::json(
        StatusCode::NOT_FOUND,
        json!({"error": "NotFound", "message": "Database 'missing' does not exist"}),
    )])
    .await;
    let client = server.client(fast_retry(5));

    let err = client
        .get_json::<JsonValue>("/v3/table/list/missing", &[])
        .await
        .expect_err("request must fail");

    assert_eq!(server.hits(), 1);
    match err {
        TdClientError::TargetNotFound(failure) => {
            assert_eq!(failure.status, 404);
            assert_eq!(failure.message, "Database 'missing' does not exist");
        }
        other => panic!("expected target not found, got {other:?}"),
    }
}

#[tokio::test]
async fn conflict_fails_immediately() {
    let server = spawn_server(vec![MockResponse::json(
        StatusCode::CONFLICT,
        json!({"error": "Database 'sample' already exists"}),
    )])
    .await;
    let client = server.client(fast_retry(5));

    let err = client
        .post_json::<_, JsonValue>("/v3/database/create/sample", &json!({}))
        .await
        .expect_err("request must fail");

    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(server.hits(), 1);
}

#[tokio::test]
async fn retry_after_over_budget_gives_up_after_one_attempt() {
    let server = spawn_server(vec![
        MockResponse::json(StatusCode::TOO_MANY_REQUESTS, json!({"error": "slow down"}))
            .with_retry_after("3600"),
        MockResponse::json(StatusCode::OK, status_body()),
    ])
    .await;
    let client = server.client(fast_retry(3));

    let started = SystemTime::now();
    let err = client
        .get_json::<JsonValue>("/v3/job/list", &[])
        .await
        .expect_err("request must fail");

    assert_eq!(server.hits(), 1);
    assert_eq!(err.kind(), ErrorKind::TooManyRequests);
    let deadline = err.retry_after().expect("deadline must be reported");
    let ahead = deadline.duration_since(started).unwrap_or_default();
    assert!(ahead >= Duration::from_secs(3_590));
}

#[tokio::test]
async fn retry_after_within_budget_retries() {
    let server = spawn_server(vec![
        MockResponse::json(StatusCode::TOO_MANY_REQUESTS, json!({"error": "slow down"}))
            .with_retry_after("0"),
        MockResponse::json(StatusCode::OK, status_body()),
    ])
    .await;
    let client = server.client(fast_retry(3));

    client
        .get_json::<JsonValue>("/v3/job/list", &[])
        .await
        .expect("request must succeed after rate limit");

    assert_eq!(server.hits(), 2);
}

#[tokio::test]
async fn invalid_json_is_not_retried() {
    let server = spawn_server(vec![
        MockResponse::raw(StatusCode::OK, "{\"databases\": ["),
        MockResponse::json(StatusCode::OK, status_body()),
    ])
    .await;
    let client = server.client(fast_retry(3));

    let err = client
        .get_json::<JsonValue>("/v3/database/list", &[])
        .await
        .expect_err("request must fail");

    assert_eq!(err.kind(), ErrorKind::InvalidResponse);
    assert_eq!(server.hits(), 1);
}

#[tokio::test]
async fn execute_builds_a_fresh_request_per_attempt() {
    let server = spawn_server(vec![
        MockResponse::raw(StatusCode::SERVICE_UNAVAILABLE, ""),
        MockResponse::raw(StatusCode::OK, "done"),
    ])
    .await;
    let client = server.client(fast_retry(2));
    let url = client.url("/v3/job/issue/hive/sample", &[]).unwrap();

    let mut attempts = Vec::new();
    let body = client
        .execute(
            |context| {
                attempts.push(context.attempt);
                Ok(HttpRequest::post(url.clone()).with_body(b"query=select 1".to_vec()))
            },
            |response| Ok(response.body_text()),
        )
        .await
        .expect("request must succeed");

    assert_eq!(body, "done");
    assert_eq!(attempts, vec![1, 2]);
}

#[tokio::test]
async fn close_interrupts_a_call_waiting_to_retry() {
    let server = spawn_server(vec![]).await;
    let client = server.client(RetryPolicy {
        retry_limit: 5,
        base_interval_millis: 60_000,
        max_interval_millis: 60_000,
        ..RetryPolicy::default()
    });

    let call = client.get_json::<JsonValue>("/v3/job/list", &[]);
    let closer = async {
        while server.hits() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        client.close();
    };
    let (result, ()) = tokio::join!(call, closer);

    match result {
        Err(TdClientError::ExecutionInterrupted { attempts }) => assert_eq!(attempts, 1),
        other => panic!("expected interruption, got {other:?}"),
    }
    assert_eq!(server.hits(), 1);

    let err = client
        .get_json::<JsonValue>("/v3/job/list", &[])
        .await
        .expect_err("closed client must refuse calls");
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[tokio::test]
async fn connection_failures_are_retried_then_reported() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("must bind");
    let address = listener.local_addr().expect("must have local addr");
    drop(listener);

    let config = ClientConfig::new("1/test-key")
        .with_endpoint(&format!("http://{address}"))
        .unwrap()
        .with_retry(fast_retry(2));
    let client = TdClient::new(config).unwrap();

    let err = client
        .get_json::<JsonValue>("/v3/system/server_status", &[])
        .await
        .expect_err("request must fail");

    match err {
        TdClientError::RetryLimitExceeded { attempts, source } => {
            assert_eq!(attempts, 3);
            assert_eq!(source.kind(), ErrorKind::SocketError);
        }
        other => panic!("expected retry limit error, got {other:?}"),
    }
}

/// Forward proxy that records each request head and always answers 407.
struct RejectingProxy {
    port: u16,
    heads: Arc<Mutex<Vec<String>>>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for RejectingProxy {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl RejectingProxy {
    fn heads(&self) -> Vec<String> {
        self.heads
            .lock()
            .expect("proxy log mutex must not be poisoned")
            .clone()
    }

    fn client(&self, endpoint: &str) -> TdClient {
        let config = ClientConfig::new("1/test-key")
            .with_endpoint(endpoint)
            .expect("endpoint must parse")
            .with_proxy(ProxyConfig::new("127.0.0.1", self.port).with_credentials("alice", "s3cret"))
            .with_retry(fast_retry(2));
        TdClient::new(config).expect("client must build")
    }
}

async fn spawn_rejecting_proxy() -> RejectingProxy {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("must bind proxy listener");
    let port = listener.local_addr().expect("must have local addr").port();
    let heads = Arc::new(Mutex::new(Vec::new()));
    let log = heads.clone();

    let task = tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let log = log.clone();
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|window| window == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                log.lock()
                    .expect("proxy log mutex must not be poisoned")
                    .push(String::from_utf8_lossy(&head).into_owned());
                let _ = socket
                    .write_all(
                        b"HTTP/1.1 407 Proxy Authentication Required\r\n\
                          Proxy-Authenticate: Basic realm=\"td\"\r\n\
                          Content-Length: 0\r\n\
                          Connection: close\r\n\r\n",
                    )
                    .await;
                let _ = socket.shutdown().await;
            });
        }
    });

    RejectingProxy { port, heads, task }
}

fn header_line<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

#[tokio::test]
async fn https_proxy_challenge_fails_without_retry() {
    let proxy = spawn_rejecting_proxy().await;
    let client = proxy.client("https://api.treasuredata.example");

    let err = client
        .get_json::<JsonValue>("/v3/system/server_status", &[])
        .await
        .expect_err("request must fail");

    assert_eq!(err.kind(), ErrorKind::ProxyAuthenticationFailure);
    assert!(err.to_string().contains("rejected"));

    let heads = proxy.heads();
    assert_eq!(heads.len(), 1);
    assert!(heads[0].starts_with("CONNECT api.treasuredata.example:443 "));
    assert_eq!(
        header_line(&heads[0], "proxy-authorization"),
        Some("Basic YWxpY2U6czNjcmV0")
    );
    assert_eq!(header_line(&heads[0], "authorization"), None);
}

#[tokio::test]
async fn http_proxy_challenge_fails_without_retry() {
    let proxy = spawn_rejecting_proxy().await;
    let client = proxy.client("http://api.treasuredata.example");

    let err = client
        .get_json::<JsonValue>("/v3/system/server_status", &[])
        .await
        .expect_err("request must fail");

    assert_eq!(err.kind(), ErrorKind::ProxyAuthenticationFailure);
    assert!(err.to_string().contains("rejected"));

    let heads = proxy.heads();
    assert_eq!(heads.len(), 1);
    assert!(heads[0].starts_with("GET http://api.treasuredata.example/v3/system/server_status "));
    assert_eq!(
        header_line(&heads[0], "proxy-authorization"),
        Some("Basic YWxpY2U6czNjcmV0")
    );
}
