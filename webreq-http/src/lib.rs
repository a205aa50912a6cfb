//! Minimal HTTP client for fetching arbitrary pages with safe logging.
//!
//! Unlike a typical API client this never assumes JSON, never picks a
//! "base" host, and never retries on status code — a non-2xx response is
//! still a successful fetch as far as this crate is concerned. The caller
//! (the Requester) decides whether a status is "accepted" and whether a
//! transport failure is worth retrying.
//!
//! - Redacts sensitive headers before logging
//! - Retries only transport-level failures (connect/timeout), a fixed
//!   number of times, with no backoff between attempts
//! - Optional raw request/response logging via `WEBREQ_HTTP_RAW=1`

use std::env;
use std::time::{Duration, Instant};

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{redirect::Policy, Client, Proxy, StatusCode, Url};
use thiserror::Error;

const RAW_ENV: &str = "WEBREQ_HTTP_RAW";
const RAW_MAX_BODY: usize = 64 * 1024;

fn raw_enabled() -> bool {
    matches!(
        env::var(RAW_ENV).as_deref(),
        Ok("1") | Ok("true") | Ok("yes")
    )
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("invalid URL: {0}")]
    Url(String),
    #[error("request build failed: {0}")]
    Build(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
}

impl HttpError {
    /// Whether this failure belongs to the narrow transport-error class the
    /// Requester's retry loop is allowed to swallow — connection failures
    /// and timeouts, nothing else.
    pub fn is_transport(&self) -> bool {
        matches!(self, HttpError::Network(_) | HttpError::Timeout)
    }
}

/// The raw result of a single HTTP fetch: status, headers, and body bytes.
/// No JSON decoding, no status-code interpretation — that's the caller's job.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub elapsed: Duration,
}

/// Per-fetch tuning knobs.
#[derive(Clone, Debug)]
pub struct FetchOpts {
    pub timeout: Option<Duration>,
    pub headers: Option<HeaderMap>,
    /// Number of inner attempts that swallow transport errors before giving
    /// up and returning the last one. Matches the Requester's 3-attempt
    /// direct-fetch loop by default.
    pub inner_attempts: usize,
    /// `scheme://host:port` of a proxy to route this fetch through.
    pub proxy: Option<String>,
    /// Whether a 3xx response should be followed. The Requester sets this
    /// to `false` when the caller's accepted-status set itself contains
    /// `301`, so a caller that wants to see the redirect actually gets to.
    pub follow_redirects: bool,
}

impl Default for FetchOpts {
    fn default() -> Self {
        Self {
            timeout: None,
            headers: None,
            inner_attempts: 0,
            proxy: None,
            follow_redirects: true,
        }
    }
}

impl FetchOpts {
    pub fn with_timeout(mut self, dur: Duration) -> Self {
        self.timeout = Some(dur);
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn with_proxy(mut self, proxy_url: impl Into<String>) -> Self {
        self.proxy = Some(proxy_url.into());
        self
    }

    pub fn with_attempts(mut self, n: usize) -> Self {
        self.inner_attempts = n;
        self
    }

    pub fn with_follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }
}

/// Thin wrapper over `reqwest` dispatching arbitrary-host GET fetches.
/// Holds one client per redirect policy so the common case (no proxy) never
/// pays the cost of rebuilding a `Client` per fetch.
#[derive(Clone)]
pub struct HttpClient {
    direct: Client,
    direct_no_redirect: Client,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new().expect("default reqwest client builds")
    }
}

impl HttpClient {
    /// Build a client for direct (non-proxied) fetches.
    ///
    /// ```no_run
    /// use webreq_http::HttpClient;
    ///
    /// let client = HttpClient::new().expect("client builds");
    /// ```
    pub fn new() -> Result<Self, HttpError> {
        let direct = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| HttpError::Build(e.to_string()))?;
        let direct_no_redirect = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .redirect(Policy::none())
            .build()
            .map_err(|e| HttpError::Build(e.to_string()))?;
        Ok(Self { direct, direct_no_redirect })
    }

    /// Fetch `url`, retrying only transport failures up to
    /// `opts.inner_attempts` times (default 3, no delay between attempts —
    /// matching the Requester's direct-fetch loop). Returns the last
    /// transport error if every attempt fails.
    pub async fn fetch(&self, url: &Url, opts: FetchOpts) -> Result<RawResponse, HttpError> {
        let proxied;
        let client = match &opts.proxy {
            Some(proxy_url) => {
                proxied = self.proxied_client(proxy_url, opts.follow_redirects)?;
                &proxied
            }
            None if opts.follow_redirects => &self.direct,
            None => &self.direct_no_redirect,
        };

        let attempts = if opts.inner_attempts == 0 {
            1
        } else {
            opts.inner_attempts
        };

        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.fetch_once(client, url, &opts).await {
                Ok(resp) => return Ok(resp),
                Err(err) if err.is_transport() => {
                    tracing::warn!(
                        url=%url,
                        attempt,
                        attempts,
                        error=%err,
                        "http.fetch.transport_retry"
                    );
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or(HttpError::Network("exhausted retries".into())))
    }

    fn proxied_client(&self, proxy_url: &str, follow_redirects: bool) -> Result<Client, HttpError> {
        let proxy = Proxy::all(proxy_url).map_err(|e| HttpError::Build(e.to_string()))?;
        let redirect = if follow_redirects { Policy::default() } else { Policy::none() };
        Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .proxy(proxy)
            .redirect(redirect)
            .build()
            .map_err(|e| HttpError::Build(e.to_string()))
    }

    async fn fetch_once(
        &self,
        client: &Client,
        url: &Url,
        opts: &FetchOpts,
    ) -> Result<RawResponse, HttpError> {
        let timeout = opts.timeout.unwrap_or(Duration::from_secs(30));
        let mut rb = client.get(url.clone()).timeout(timeout);
        if let Some(headers) = &opts.headers {
            rb = rb.headers(headers.clone());
        }

        if raw_enabled() {
            let merged = opts.headers.clone().unwrap_or_default();
            tracing::debug!(
                target: "http.raw",
                %url,
                headers = ?redact_headers(&merged),
                "request"
            );
        }

        tracing::debug!(
            host_path = %format!("{}{}", url.domain().unwrap_or("-"), url.path()),
            timeout_ms = timeout.as_millis() as u64,
            proxy = opts.proxy.as_deref().unwrap_or("-"),
            "http.fetch.start"
        );

        let t0 = Instant::now();
        let resp = rb.send().await.map_err(classify_reqwest_error)?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.bytes().await.map_err(classify_reqwest_error)?;
        let elapsed = t0.elapsed();

        if raw_enabled() {
            let mut snippet = body.clone();
            let truncated = snippet.len() > RAW_MAX_BODY;
            if truncated {
                snippet.truncate(RAW_MAX_BODY);
            }
            tracing::info!(
                target: "http.raw",
                %url,
                %status,
                duration_ms = elapsed.as_millis() as u64,
                headers = ?redact_headers(&headers),
                body = %String::from_utf8_lossy(&snippet),
                truncated,
                "response"
            );
        }

        tracing::debug!(
            %status,
            duration_ms = elapsed.as_millis() as u64,
            body_len = body.len(),
            "http.fetch.done"
        );

        Ok(RawResponse {
            status,
            headers,
            body,
            elapsed,
        })
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> HttpError {
    if err.is_timeout() {
        HttpError::Timeout
    } else if err.is_connect() || err.is_request() {
        HttpError::Network(err.to_string())
    } else {
        HttpError::Network(err.to_string())
    }
}

/// Redact sensitive headers for logging.
fn redact_headers(h: &HeaderMap) -> Vec<(String, String)> {
    h.iter()
        .map(|(k, v)| {
            let key = k.as_str().to_string();
            let mut val = v.to_str().unwrap_or("").to_string();
            let lower = key.to_ascii_lowercase();
            if lower == "authorization" || lower == "cookie" || lower == "set-cookie" {
                val = "<redacted>".into();
            }
            (key, val)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_flagged_retryable() {
        assert!(HttpError::Network("boom".into()).is_transport());
        assert!(HttpError::Timeout.is_transport());
        assert!(!HttpError::Url("bad".into()).is_transport());
    }

    #[test]
    fn redact_headers_hides_authorization_and_cookie() {
        let mut h = HeaderMap::new();
        h.insert("authorization", "Bearer secret".parse().unwrap());
        h.insert("cookie", "session=abc".parse().unwrap());
        h.insert("x-custom", "visible".parse().unwrap());
        let redacted = redact_headers(&h);
        for (k, v) in redacted {
            if k.eq_ignore_ascii_case("authorization") || k.eq_ignore_ascii_case("cookie") {
                assert_eq!(v, "<redacted>");
            } else {
                assert_eq!(v, "visible");
            }
        }
    }

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn non_2xx_status_is_still_a_successful_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_bytes(b"nope".to_vec()))
            .mount(&server)
            .await;

        let client = HttpClient::new().unwrap();
        let url: Url = format!("{}/missing", server.uri()).parse().unwrap();
        let resp = client.fetch(&url, FetchOpts::default()).await.unwrap();
        assert_eq!(resp.status, StatusCode::NOT_FOUND);
        assert_eq!(resp.body.as_ref(), b"nope");
    }

    #[tokio::test]
    async fn transport_failure_retries_inner_attempts_then_surfaces() {
        // Nothing is listening on this port, so every attempt is a
        // connection failure — exercises the inner retry loop bottoming out.
        let client = HttpClient::new().unwrap();
        let url: Url = "http://127.0.0.1:1".parse().unwrap();
        let opts = FetchOpts::default()
            .with_timeout(Duration::from_millis(200))
            .with_attempts(3);
        let err = client.fetch(&url, opts).await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn headers_are_forwarded_to_the_origin() {
        let server = MockServer::start().await;
        // Scoped to require the header; a fetch that forwarded it matches
        // and gets 200, one that dropped it would get wiremock's 404 default.
        Mock::given(method("GET"))
            .and(path("/echo"))
            .and(wiremock::matchers::header("x-probe", "1"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let mut headers = HeaderMap::new();
        headers.insert("x-probe", "1".parse().unwrap());

        let client = HttpClient::new().unwrap();
        let url: Url = format!("{}/echo", server.uri()).parse().unwrap();
        let opts = FetchOpts::default().with_headers(headers);
        let resp = client.fetch(&url, opts).await.unwrap();
        assert_eq!(resp.status, StatusCode::OK);
    }
}
