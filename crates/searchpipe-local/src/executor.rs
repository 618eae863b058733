//! One logical upstream call: POST to `{base_url}{endpoint}` under the retry engine,
//! with a fresh deadline per attempt and every attempt recorded in the monitor.

use crate::monitor::PerformanceMonitor;
use crate::retry::{retry, RetryObserver, RetryPolicy};
use searchpipe_core::{ApiError, Envelope, Operation, Result, RATE_LIMIT_RESET_HEADER};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_BASE_URL: &str = "https://api.searchpipe.dev/v1";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Status used when a 2xx response cannot be interpreted.
const BAD_GATEWAY: u16 = 502;

#[derive(Clone)]
pub struct ExecutorConfig {
    pub base_url: String,
    pub api_key: String,
    /// Deadline for a single attempt (not the whole logical call).
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl std::fmt::Debug for ExecutorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish()
    }
}

pub struct RequestExecutor {
    client: reqwest::Client,
    config: ExecutorConfig,
    monitor: Arc<PerformanceMonitor>,
    observer: Option<RetryObserver>,
}

impl RequestExecutor {
    pub fn new(config: ExecutorConfig, monitor: Arc<PerformanceMonitor>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("searchpipe/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ApiError::config(vec![format!("http client: {e}")]))?;
        Ok(Self::with_client(client, config, monitor))
    }

    pub fn with_client(
        client: reqwest::Client,
        config: ExecutorConfig,
        monitor: Arc<PerformanceMonitor>,
    ) -> Self {
        Self {
            client,
            config,
            monitor,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: RetryObserver) -> Self {
        self.set_observer(observer);
        self
    }

    pub fn set_observer(&mut self, observer: RetryObserver) {
        self.observer = Some(observer);
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn endpoint_url(&self, op: Operation) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), op.endpoint())
    }

    /// Run `op` with `body` to completion: a decoded `data` payload or the last error.
    pub async fn execute<T>(&self, op: Operation, body: &serde_json::Value) -> Result<T>
    where
        T: DeserializeOwned + Send,
    {
        let t0 = Instant::now();
        let out = retry(&self.config.retry, self.observer.as_ref(), |attempt| {
            self.attempt::<T>(op, body, attempt)
        })
        .await;
        match &out {
            Ok(_) => tracing::debug!(
                op = op.as_str(),
                elapsed_ms = t0.elapsed().as_millis() as u64,
                "upstream call ok"
            ),
            Err(e) => tracing::warn!(
                op = op.as_str(),
                code = e.code(),
                elapsed_ms = t0.elapsed().as_millis() as u64,
                error = %e,
                "upstream call failed"
            ),
        }
        out
    }

    async fn attempt<T>(&self, op: Operation, body: &serde_json::Value, attempt: u32) -> Result<T>
    where
        T: DeserializeOwned + Send,
    {
        let timer = self.monitor.start_operation(op.metric_name());
        let out = match tokio::time::timeout(self.config.timeout, self.send_once::<T>(op, body)).await
        {
            Ok(r) => r,
            Err(_) => Err(ApiError::timeout(self.config.timeout)),
        };
        let took = timer.stop(out.is_ok());
        tracing::debug!(
            op = op.as_str(),
            attempt,
            ok = out.is_ok(),
            took_ms = took.as_millis() as u64,
            "upstream attempt"
        );
        out
    }

    async fn send_once<T>(&self, op: Operation, body: &serde_json::Value) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let resp = self
            .client
            .post(self.endpoint_url(op))
            .bearer_auth(&self.config.api_key)
            .json(body)
            .timeout(self.config.timeout)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = resp.status();
        let reset = resp
            .headers()
            .get(RATE_LIMIT_RESET_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = resp.text().await.map_err(|e| self.transport_error(e))?;

        if !status.is_success() {
            return Err(ApiError::from_http_status(
                status.as_u16(),
                Some(&text),
                reset.as_deref(),
            ));
        }
        decode_envelope(&text, reset.as_deref())
    }

    fn transport_error(&self, e: reqwest::Error) -> ApiError {
        if e.is_timeout() {
            ApiError::timeout(self.config.timeout)
        } else {
            ApiError::coerce(&e)
        }
    }
}

/// Decode a 2xx body. Unparseable JSON, a missing `data`, or `success: false`
/// become errors; a numeric `code` on a failed envelope is classified like an
/// HTTP status.
pub fn decode_envelope<T: DeserializeOwned>(text: &str, reset: Option<&str>) -> Result<T> {
    let env: Envelope<T> = serde_json::from_str(text)
        .map_err(|e| ApiError::server(BAD_GATEWAY, format!("malformed upstream response: {e}")))?;

    if !env.success {
        let message = env
            .message
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| "upstream reported failure".to_string());
        let status = env
            .code
            .as_ref()
            .and_then(|c| {
                c.as_u64()
                    .or_else(|| c.as_str().and_then(|s| s.trim().parse().ok()))
            })
            .filter(|s| (100..=599).contains(s));
        return Err(match status {
            Some(s) => {
                let mut e = ApiError::from_http_status(s as u16, None, reset);
                e.message = message;
                e
            }
            None => ApiError::server(BAD_GATEWAY, message),
        });
    }

    env.data
        .ok_or_else(|| ApiError::server(BAD_GATEWAY, "upstream response has no data"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::{routing::post, Json, Router};
    use searchpipe_core::{ErrorKind, SearchResponse};
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("axum serve");
        });
        format!("http://{addr}")
    }

    fn executor(base_url: String, max_attempts: u32, timeout: Duration) -> RequestExecutor {
        let client = reqwest::Client::builder().no_proxy().build().unwrap();
        RequestExecutor::with_client(
            client,
            ExecutorConfig {
                base_url,
                api_key: "test-key".to_string(),
                timeout,
                retry: RetryPolicy {
                    max_attempts,
                    initial_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(5),
                    backoff_factor: 2.0,
                    jitter: false,
                    retryable_codes: Vec::new(),
                },
            },
            Arc::new(PerformanceMonitor::default()),
        )
    }

    fn ok_body() -> serde_json::Value {
        serde_json::json!({
            "success": true,
            "data": { "results": [ {"title":"Example","url":"https://example.com","snippet":"Hi"} ] }
        })
    }

    #[tokio::test]
    async fn sends_bearer_token_and_decodes_data() {
        let app = Router::new().route(
            "/search",
            post(|headers: HeaderMap, Json(body): Json<serde_json::Value>| async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                if auth != "Bearer test-key" || body["query"] != "rust" {
                    return StatusCode::UNAUTHORIZED.into_response();
                }
                Json(ok_body()).into_response()
            }),
        );
        let ex = executor(serve(app).await, 3, Duration::from_secs(5));
        let r: SearchResponse = ex
            .execute(Operation::Search, &serde_json::json!({"query": "rust"}))
            .await
            .unwrap();
        assert_eq!(r.results.len(), 1);
        assert_eq!(r.results[0].title, "Example");
        let m = ex.monitor().metrics("api.search").unwrap();
        assert_eq!((m.count, m.success_count), (1, 1));
    }

    #[tokio::test]
    async fn unauthorized_is_attempted_exactly_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let app = Router::new().route(
            "/news",
            post(move || {
                let h = h.clone();
                async move {
                    h.fetch_add(1, Ordering::SeqCst);
                    (
                        StatusCode::UNAUTHORIZED,
                        Json(serde_json::json!({"message": "bad key"})),
                    )
                }
            }),
        );
        let ex = executor(serve(app).await, 3, Duration::from_secs(5));
        let err = ex
            .execute::<SearchResponse>(Operation::News, &serde_json::json!({"query": "q"}))
            .await
            .unwrap_err();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(err.kind, ErrorKind::ApiKeyInvalid);
        assert_eq!(err.message, "bad key");
        let m = ex.monitor().metrics("api.news").unwrap();
        assert_eq!((m.count, m.failure_count), (1, 1));
    }

    #[tokio::test]
    async fn server_errors_are_retried_until_success() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let app = Router::new().route(
            "/search",
            post(move || {
                let h = h.clone();
                async move {
                    let n = h.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        (StatusCode::SERVICE_UNAVAILABLE, "busy").into_response()
                    } else {
                        Json(ok_body()).into_response()
                    }
                }
            }),
        );
        let ex = executor(serve(app).await, 3, Duration::from_secs(5));
        let r: SearchResponse = ex
            .execute(Operation::Search, &serde_json::json!({"query": "q"}))
            .await
            .unwrap();
        assert_eq!(r.results.len(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        let m = ex.monitor().metrics("api.search").unwrap();
        assert_eq!((m.count, m.failure_count, m.success_count), (3, 2, 1));
    }

    #[tokio::test]
    async fn attempt_deadline_maps_to_timeout() {
        let app = Router::new().route(
            "/crawl",
            post(|| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Json(ok_body())
            }),
        );
        let ex = executor(serve(app).await, 1, Duration::from_millis(50));
        let err = ex
            .execute::<SearchResponse>(Operation::Crawl, &serde_json::json!({"url": "u"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert_eq!(err.status(), 408);
    }

    #[tokio::test]
    async fn malformed_success_body_is_a_bad_gateway() {
        let app = Router::new().route("/search", post(|| async { "<html>oops</html>" }));
        let ex = executor(serve(app).await, 1, Duration::from_secs(5));
        let err = ex
            .execute::<SearchResponse>(Operation::Search, &serde_json::json!({"query": "q"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ServerFault { status: 502 });
    }

    #[tokio::test]
    async fn rate_limit_reset_header_is_captured() {
        let app = Router::new().route(
            "/search",
            post(|| async {
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    [(RATE_LIMIT_RESET_HEADER, "1700000000")],
                    "slow down",
                )
            }),
        );
        let ex = executor(serve(app).await, 1, Duration::from_secs(5));
        let err = ex
            .execute::<SearchResponse>(Operation::Search, &serde_json::json!({"query": "q"}))
            .await
            .unwrap_err();
        assert_eq!(
            err.kind,
            ErrorKind::RateLimited {
                reset_at_epoch_s: Some(1_700_000_000)
            }
        );
    }

    #[tokio::test]
    async fn network_failure_when_nothing_listens() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let ex = executor(format!("http://{addr}"), 1, Duration::from_secs(5));
        let err = ex
            .execute::<SearchResponse>(Operation::Search, &serde_json::json!({"query": "q"}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NETWORK_ERROR");
        assert!(err.retryable());
    }

    #[test]
    fn failed_envelope_is_classified_from_code() {
        let e = decode_envelope::<SearchResponse>(
            r#"{"success":false,"message":"key revoked","code":401}"#,
            None,
        )
        .unwrap_err();
        assert_eq!(e.kind, ErrorKind::ApiKeyInvalid);
        assert_eq!(e.message, "key revoked");

        let e = decode_envelope::<SearchResponse>(
            r#"{"success":false,"message":"quota","code":"429"}"#,
            Some("1700000000"),
        )
        .unwrap_err();
        assert_eq!(
            e.kind,
            ErrorKind::RateLimited {
                reset_at_epoch_s: Some(1_700_000_000)
            }
        );

        let e = decode_envelope::<SearchResponse>(
            r#"{"success":false,"code":"E_WEIRD"}"#,
            None,
        )
        .unwrap_err();
        assert_eq!(e.kind, ErrorKind::ServerFault { status: 502 });

        let e = decode_envelope::<SearchResponse>(r#"{"success":true}"#, None).unwrap_err();
        assert_eq!(e.kind, ErrorKind::ServerFault { status: 502 });
    }

    #[test]
    fn endpoint_url_joins_without_double_slash() {
        let ex = executor("http://h/v1/".to_string(), 1, DEFAULT_TIMEOUT);
        assert_eq!(ex.endpoint_url(Operation::News), "http://h/v1/news");
    }
}
