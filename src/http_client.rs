use reqwest::header::SET_COOKIE;
use reqwest::{Client, Method, Request, RequestBuilder, Response, Url};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{AlmError, Result};

/// Fixed base-path segment every ALM resource lives under
pub const BASE_PATH_SEGMENT: &str = "qcbin";

/// Status, cookies and body of a completed ALM call
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    /// `(name, value)` pairs from the Set-Cookie headers, in order
    pub set_cookies: Vec<(String, String)>,
    pub body: String,
}

impl RawResponse {
    /// Whether the status is one of the accepted codes
    pub fn is_status(&self, accepted: &[u16]) -> bool {
        accepted.contains(&self.status)
    }

    /// Value of the last cookie set under `name`
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.set_cookies
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// HTTP client for the ALM REST API with bounded retry and cancellation
pub struct AlmHttpClient {
    /// Per-instance HTTP client
    client: Client,

    /// Base address ending in `/qcbin/`
    base_url: Url,

    /// Maximum number of retries for transient failures
    max_retries: u32,

    /// Base delay for exponential backoff (milliseconds)
    base_delay_ms: u64,
}

impl AlmHttpClient {
    /// Create a new HTTP client for the server at `server_url`
    pub fn new(
        server_url: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
        max_retries: u32,
    ) -> Result<Self> {
        let base = format!(
            "{}/{}/",
            server_url.trim_end_matches('/'),
            BASE_PATH_SEGMENT
        );
        let base_url = Url::parse(&base)
            .map_err(|e| AlmError::Config(format!("Invalid ALM address '{}': {}", base, e)))?;

        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|e| AlmError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            max_retries,
            base_delay_ms: 500,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve a resource path against the base address without
    /// duplicating the `/qcbin` segment both may carry
    pub fn resolve(&self, path: &str) -> Result<Url> {
        let normalized = normalize_path(&self.base_url, path);
        self.base_url
            .join(&normalized)
            .map_err(|e| AlmError::Config(format!("Invalid resource path '{}': {}", path, e)))
    }

    /// Start building a request for a resolved address
    pub fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.client.request(method, url)
    }

    /// Execute a request, retrying transient failures, aborting when `cancel` fires
    pub async fn send(&self, request: Request, cancel: &CancellationToken) -> Result<RawResponse> {
        let method = request.method().clone();
        let path = request.url().path().to_string();
        let idempotent = method == Method::GET;
        let replay_safe = is_replay_safe(&method);
        let mut attempt = 0;

        tracing::debug!(method = %method, path = %path, "Sending ALM request");

        loop {
            let req = request.try_clone().ok_or_else(|| {
                AlmError::Config("Request body is not cloneable".to_string())
            })?;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AlmError::Cancelled),
                result = self.client.execute(req) => result,
            };

            match result {
                Ok(response) => {
                    let status = response.status().as_u16();
                    tracing::debug!(status, method = %method, path = %path, "Received ALM response");

                    let transient = status == 429 || (500..=599).contains(&status);
                    if transient && idempotent && attempt < self.max_retries {
                        let delay = self.calculate_backoff_delay(attempt);
                        tracing::warn!(
                            "Received {}, retrying after {}ms (attempt {}/{})",
                            status,
                            delay,
                            attempt + 1,
                            self.max_retries
                        );
                        self.sleep(delay, cancel).await?;
                        attempt += 1;
                        continue;
                    }

                    return tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Err(AlmError::Cancelled),
                        raw = read_response(response) => raw,
                    };
                }

                Err(e) => {
                    let error_kind = classify(&e);

                    tracing::warn!(
                        error_kind,
                        error = %e,
                        path = %path,
                        attempt = attempt + 1,
                        "ALM request error"
                    );

                    if replay_safe && attempt < self.max_retries {
                        let delay = self.calculate_backoff_delay(attempt);
                        tracing::warn!(
                            "Request failed: {}, retrying after {}ms (attempt {}/{})",
                            e,
                            delay,
                            attempt + 1,
                            self.max_retries
                        );
                        self.sleep(delay, cancel).await?;
                        attempt += 1;
                        continue;
                    }

                    tracing::error!(
                        error_kind,
                        error = %e,
                        path = %path,
                        total_attempts = attempt + 1,
                        "ALM request failed after all retries"
                    );

                    return Err(AlmError::Transport {
                        kind: error_kind,
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    /// Execute a request that must not be abandoned halfway, such as a lock release.
    /// Still bounded by the request timeout.
    pub async fn send_uncancellable(&self, request: Request) -> Result<RawResponse> {
        self.send(request, &CancellationToken::new()).await
    }

    async fn sleep(&self, delay_ms: u64, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AlmError::Cancelled),
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => Ok(()),
        }
    }

    /// Exponential backoff: base_delay * 2^attempt plus up to 10% jitter
    fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let delay = self.base_delay_ms * 2_u64.pow(attempt);
        let nanos = chrono::Utc::now().timestamp_subsec_nanos() as u64;
        let jitter = delay / 10 * (nanos % 1000) / 1000;
        delay + jitter
    }
}

/// Whether a request may be resent after a transport failure.
/// A POST (lock, session renewal) may already have been applied by the server.
pub fn is_replay_safe(method: &Method) -> bool {
    *method != Method::POST
}

/// Strip a leading slash and a leading base-path segment that the base address already ends with
pub fn normalize_path(base_url: &Url, path: &str) -> String {
    let trimmed = path.trim_start_matches('/');

    let base_segment = base_url
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last());

    if let Some(segment) = base_segment {
        if let Some(rest) = trimmed.strip_prefix(segment) {
            if rest.is_empty() {
                return String::new();
            }
            if let Some(rest) = rest.strip_prefix('/') {
                return rest.to_string();
            }
        }
    }

    trimmed.to_string()
}

/// Substitute `{placeholder}` segments with percent-encoded values
pub fn expand_template(template: &str, values: &[(&str, &str)]) -> String {
    values.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{}}}", key), &urlencoding::encode(value))
    })
}

/// Parse the name/value pair at the front of a Set-Cookie header
pub fn parse_set_cookie(header: &str) -> Option<(String, String)> {
    let pair = header.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().trim_matches('"').to_string()))
}

async fn read_response(response: Response) -> Result<RawResponse> {
    let status = response.status().as_u16();
    let set_cookies = response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(parse_set_cookie)
        .collect();

    let body = response.text().await.map_err(|e| AlmError::Transport {
        kind: "body_error",
        message: e.to_string(),
    })?;

    Ok(RawResponse {
        status,
        set_cookies,
        body,
    })
}

fn classify(e: &reqwest::Error) -> &'static str {
    if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connection_failed"
    } else if e.is_request() {
        "request_error"
    } else if e.is_body() {
        "body_error"
    } else if e.is_decode() {
        "decode_error"
    } else {
        "unknown"
    }
}
