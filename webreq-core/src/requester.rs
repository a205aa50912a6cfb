//! Single-attempt fetch-and-classify, narrowed from `webreq_http::HttpClient`
//! to the semantics of the original `Requester`: direct vs. proxy-rotated
//! fetch, timeout, and accepted-status classification all in one call.

use std::time::Duration;

use reqwest::header::HeaderMap;
use url::Url;
use webreq_common::AcceptedStatus;
use webreq_http::{FetchOpts, HttpClient, HttpError};
use webreq_store::Store;

use crate::proxy::ProxyPool;

const INNER_ATTEMPTS: usize = 3;

/// The outcome of one fetch attempt: the raw response (if any was ever
/// obtained, successful status or not) and whether it satisfies the
/// caller's accepted-status set.
pub struct RequesterResult {
    pub response: Option<webreq_http::RawResponse>,
    pub valid: bool,
}

pub struct Requester {
    http: HttpClient,
}

impl Requester {
    pub fn new() -> Result<Self, HttpError> {
        Ok(Self {
            http: HttpClient::new()?,
        })
    }

    /// Fetch `url` once and classify the result.
    ///
    /// - `force_proxy = true`: iterate the pool's candidates for the url's
    ///   scheme in ascending-latency order; the first one that yields any
    ///   response (accepted or not) wins, with its observed latency fed
    ///   back into the pool. A candidate that fails outright has its
    ///   latency marked unknown and is skipped.
    /// - `force_proxy = false`: a direct fetch.
    ///
    /// Redirects are followed unless the caller's accepted-status set
    /// itself contains `301`, in which case the caller wants to *see* the
    /// redirect rather than have it silently chased.
    #[allow(clippy::too_many_arguments)]
    pub async fn request(
        &self,
        store: &Store,
        proxies: &ProxyPool,
        url: &Url,
        headers: HeaderMap,
        accepted_status: &AcceptedStatus,
        timeout: Duration,
        force_proxy: bool,
    ) -> RequesterResult {
        let follow_redirects = !accepted_status.contains(301);

        if force_proxy {
            let candidates = proxies.proxies_for(store, url.scheme()).await.unwrap_or_default();
            for candidate in candidates {
                let proxy_url = format!("{}://{}", candidate.protocol, candidate.address);
                let opts = FetchOpts::default()
                    .with_timeout(timeout)
                    .with_headers(headers.clone())
                    .with_attempts(INNER_ATTEMPTS)
                    .with_proxy(&proxy_url)
                    .with_follow_redirects(follow_redirects);

                match self.http.fetch(url, opts).await {
                    Ok(resp) => {
                        let _ = proxies
                            .record_latency(store, &candidate.address, &candidate.protocol, Some(resp.elapsed.as_secs_f64()))
                            .await;
                        let valid = accepted_status.contains(resp.status.as_u16());
                        return RequesterResult { response: Some(resp), valid };
                    }
                    Err(_) => {
                        let _ = proxies
                            .record_latency(store, &candidate.address, &candidate.protocol, None)
                            .await;
                    }
                }
            }
            return RequesterResult { response: None, valid: false };
        }

        let opts = FetchOpts::default()
            .with_timeout(timeout)
            .with_headers(headers)
            .with_attempts(INNER_ATTEMPTS)
            .with_follow_redirects(follow_redirects);

        match self.http.fetch(url, opts).await {
            Ok(resp) => {
                let valid = accepted_status.contains(resp.status.as_u16());
                RequesterResult { response: Some(resp), valid }
            }
            Err(_) => RequesterResult { response: None, valid: false },
        }
    }
}
