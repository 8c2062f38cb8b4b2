use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::time::timeout;

use crate::config::Config;

/// Per-request overrides. `None` falls back to the backend's defaults.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub timeout: Option<Duration>,
    pub max_content_size: Option<usize>,
}

/// A completed HTTP exchange, whatever its status code.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    /// Header names are lower-cased.
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub final_url: String,
    pub elapsed_ms: u64,
}

impl FetchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The server answered, but not with a 2xx.
    pub fn is_http_error(&self) -> bool {
        !self.is_success()
    }

    /// 429 and 503 mean the site wants us to back off.
    pub fn is_throttled(&self) -> bool {
        self.status == 429 || self.status == 503
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type").map(String::as_str)
    }

    /// Retry-After in delta-seconds form. HTTP-date values are ignored.
    pub fn retry_after(&self) -> Option<Duration> {
        self.headers
            .get("retry-after")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }
}

/// Errors that can occur during HTTP fetching.
///
/// These are connection-level failures; an HTTP error status is a successful
/// fetch with `FetchResponse::is_http_error()`.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Connection(String),

    #[error("Connection refused - server not accepting connections")]
    ConnectionRefused,

    #[error("DNS resolution failed")]
    Dns,

    #[error("SSL/TLS error - certificate or encryption issue")]
    Tls,

    #[error("Request timeout")]
    Timeout,

    #[error("Failed to read response body: {0}")]
    Body(String),

    #[error("Content too large: {0} bytes (max: {1} bytes)")]
    ContentTooLarge(usize, usize),

    #[error("Failed to build HTTP client: {0}")]
    Build(String),
}

impl FetchError {
    /// Transient failures are worth another attempt at the task level.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Timeout | FetchError::Connection(_) | FetchError::ConnectionRefused | FetchError::Dns
        )
    }
}

/// Anything that can fetch a URL for the crawler.
#[async_trait]
pub trait FetchBackend: Send + Sync {
    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<FetchResponse, FetchError>;
}

/// reqwest-backed fetch backend. Makes exactly one attempt per call.
#[derive(Debug)]
pub struct HttpClient {
    client: reqwest::Client,
    timeout_duration: Duration,
    user_agent: String,
    max_content_size: usize,
}

impl HttpClient {
    pub fn new(user_agent: String, timeout_secs: u64) -> Result<Self, FetchError> {
        Self::with_content_limit(user_agent, timeout_secs, Config::MAX_CONTENT_SIZE)
    }

    pub fn with_content_limit(
        user_agent: String,
        timeout_secs: u64,
        max_content_size: usize,
    ) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(&user_agent)
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(30))
            .http1_only()
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| FetchError::Build(e.to_string()))?;

        Ok(Self {
            client,
            timeout_duration: Duration::from_secs(timeout_secs),
            user_agent,
            max_content_size,
        })
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    fn classify_error(error: reqwest::Error) -> FetchError {
        if error.is_timeout() {
            return FetchError::Timeout;
        }

        let error_msg = error.to_string().to_lowercase();
        if error_msg.contains("connection refused") {
            return FetchError::ConnectionRefused;
        }
        if error_msg.contains("dns") || error_msg.contains("name resolution") {
            return FetchError::Dns;
        }
        if error_msg.contains("ssl") || error_msg.contains("tls") || error_msg.contains("certificate") {
            return FetchError::Tls;
        }
        FetchError::Connection(error.to_string())
    }
}

#[async_trait]
impl FetchBackend for HttpClient {
    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<FetchResponse, FetchError> {
        let request_timeout = options.timeout.unwrap_or(self.timeout_duration);
        let max_content_size = options.max_content_size.unwrap_or(self.max_content_size);
        let started = Instant::now();

        let response = timeout(
            request_timeout,
            self.client
                .get(url)
                .header(
                    "Accept",
                    "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
                )
                .header("Accept-Language", "en-US,en;q=0.5")
                .send(),
        )
        .await
        .map_err(|_| FetchError::Timeout)?
        .map_err(Self::classify_error)?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();

        if let Some(length) = headers.get("content-length").and_then(|v| v.parse::<usize>().ok()) {
            if length > max_content_size {
                return Err(FetchError::ContentTooLarge(length, max_content_size));
            }
        }

        // Enforce the size limit while streaming; content-length can lie or be absent.
        let read_body = async {
            let mut body = Vec::new();
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| FetchError::Body(e.to_string()))?;
                if body.len() + chunk.len() > max_content_size {
                    return Err(FetchError::ContentTooLarge(body.len() + chunk.len(), max_content_size));
                }
                body.extend_from_slice(&chunk);
            }
            Ok::<_, FetchError>(body)
        };
        let body = timeout(request_timeout, read_body)
            .await
            .map_err(|_| FetchError::Timeout)??;

        Ok(FetchResponse {
            status,
            headers,
            body,
            final_url,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, headers: &[(&str, &str)]) -> FetchResponse {
        FetchResponse {
            status,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: Vec::new(),
            final_url: "https://site.test/".to_string(),
            elapsed_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_fetch_invalid_url() {
        let client = HttpClient::new("TestBot/1.0".to_string(), 30).unwrap();
        let result = client.fetch("not-a-url", &FetchOptions::default()).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_http_client_creation() {
        let client = HttpClient::new("TestBot/1.0".to_string(), 30).unwrap();
        assert_eq!(client.user_agent(), "TestBot/1.0");
    }

    #[test]
    fn test_response_outcomes() {
        assert!(response(200, &[]).is_success());
        assert!(response(404, &[]).is_http_error());
        assert!(!response(404, &[]).is_throttled());
        assert!(response(429, &[]).is_throttled());
        assert!(response(503, &[]).is_throttled());
    }

    #[test]
    fn test_response_headers() {
        let r = response(429, &[("retry-after", "30"), ("content-type", "text/html")]);
        assert_eq!(r.retry_after(), Some(Duration::from_secs(30)));
        assert_eq!(r.content_type(), Some("text/html"));

        let dated = response(503, &[("retry-after", "Wed, 21 Oct 2015 07:28:00 GMT")]);
        assert_eq!(dated.retry_after(), None);
    }

    #[test]
    fn test_transient_errors() {
        assert!(FetchError::Timeout.is_transient());
        assert!(FetchError::Connection("reset".to_string()).is_transient());
        assert!(!FetchError::Tls.is_transient());
        assert!(!FetchError::ContentTooLarge(2, 1).is_transient());
    }
}
