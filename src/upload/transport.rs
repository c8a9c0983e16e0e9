//! HTTP transport used to deliver batches to the intake

use crate::errors::{CoreError, Result};
use async_trait::async_trait;
use reqwest::{Client, Method};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

/// A fully built intake request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl UploadRequest {
    pub fn post(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            headers: Vec::new(),
            body,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
}

/// Network capability used by upload workers.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn send(&self, request: UploadRequest) -> Result<HttpResponse>;
}

/// `HttpClient` backed by reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: Client,
    timeout: Duration,
}

impl ReqwestClient {
    pub fn new(http_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(http_timeout)
            .user_agent(format!("datadog_core/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(CoreError::Http)?;

        Ok(Self {
            client,
            timeout: http_timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn send(&self, request: UploadRequest) -> Result<HttpResponse> {
        debug!("Sending {} bytes to {}", request.body.len(), request.url);

        let mut builder = self.client.request(request.method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.body(request.body).send().await.map_err(|e| {
            if e.is_timeout() {
                CoreError::Timeout
            } else {
                CoreError::Http(e)
            }
        })?;

        Ok(HttpResponse {
            status: response.status().as_u16(),
        })
    }
}

/// Counters of one upload worker.
#[derive(Debug, Default)]
pub struct UploadMetrics {
    state: RwLock<MetricsState>,
}

#[derive(Debug, Default)]
struct MetricsState {
    attempts: u64,
    successes: u64,
    failures: u64,
    total_duration: Duration,
    min_duration: Option<Duration>,
    max_duration: Option<Duration>,
}

impl UploadMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, started: Instant, success: bool) {
        let duration = started.elapsed();
        let mut state = self.state.write().await;

        state.attempts += 1;
        if success {
            state.successes += 1;
        } else {
            state.failures += 1;
        }

        state.total_duration += duration;
        state.min_duration = Some(state.min_duration.map_or(duration, |m| m.min(duration)));
        state.max_duration = Some(state.max_duration.map_or(duration, |m| m.max(duration)));
    }

    pub async fn snapshot(&self) -> UploadMetricsSnapshot {
        let state = self.state.read().await;

        let success_rate = if state.attempts > 0 {
            (state.successes as f64 / state.attempts as f64) * 100.0
        } else {
            0.0
        };

        let avg_duration = if state.attempts > 0 {
            state.total_duration / state.attempts as u32
        } else {
            Duration::ZERO
        };

        UploadMetricsSnapshot {
            attempts: state.attempts,
            successes: state.successes,
            failures: state.failures,
            success_rate,
            avg_duration_ms: avg_duration.as_millis() as u64,
            min_duration_ms: state.min_duration.map(|d| d.as_millis() as u64),
            max_duration_ms: state.max_duration.map(|d| d.as_millis() as u64),
        }
    }
}

/// Snapshot of upload metrics
#[derive(Debug, Clone, PartialEq)]
pub struct UploadMetricsSnapshot {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub avg_duration_ms: u64,
    pub min_duration_ms: Option<u64>,
    pub max_duration_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;
    use wiremock::matchers::{body_bytes, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_reqwest_client_sends_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/logs"))
            .and(header("DD-API-KEY", "token"))
            .and(body_bytes(b"event-1\nevent-2".to_vec()))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let client = assert_ok!(ReqwestClient::new(Duration::from_secs(5)));
        let request = UploadRequest::post(
            format!("{}/api/v2/logs", server.uri()),
            b"event-1\nevent-2".to_vec(),
        )
        .with_header("DD-API-KEY", "token");

        let response = assert_ok!(client.send(request).await);
        assert_eq!(response.status, 202);
    }

    #[tokio::test]
    async fn test_reqwest_client_reports_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = ReqwestClient::new(Duration::from_secs(5)).unwrap();
        let response = client
            .send(UploadRequest::post(server.uri(), Vec::new()))
            .await
            .unwrap();
        assert_eq!(response.status, 503);
    }

    #[tokio::test]
    async fn test_reqwest_client_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let client = ReqwestClient::new(Duration::from_millis(50)).unwrap();
        let result = client.send(UploadRequest::post(server.uri(), Vec::new())).await;
        assert!(matches!(result, Err(CoreError::Timeout)));
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let request = UploadRequest::post("http://localhost", Vec::new())
            .with_header("Content-Type", "text/plain");
        assert_eq!(request.header("content-type"), Some("text/plain"));
        assert_eq!(request.header("DD-API-KEY"), None);
    }

    #[tokio::test]
    async fn test_upload_metrics() {
        let metrics = UploadMetrics::new();
        assert_eq!(metrics.snapshot().await.attempts, 0);

        metrics.record(Instant::now(), true).await;
        metrics.record(Instant::now(), false).await;

        let snapshot = metrics.snapshot().await;
        assert_eq!(snapshot.attempts, 2);
        assert_eq!(snapshot.successes, 1);
        assert_eq!(snapshot.failures, 1);
        assert_eq!(snapshot.success_rate, 50.0);
        assert!(snapshot.min_duration_ms.is_some());
    }
}
