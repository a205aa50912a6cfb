//! Single-request retry escalation: direct (or proxy-rotated) attempt,
//! same-URL retries with a randomized delay, then (optionally) one
//! http-rewritten fallback attempt.

use std::time::Duration;

use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use url::Url;
use webreq_common::{AcceptedStatus, Error};
use webreq_http::RawResponse;
use webreq_store::{Domain, Request, Store};

use crate::proxy::ProxyPool;
use crate::requester::Requester;
use crate::status_tracker::StatusTracker;

async fn random_delay(min_secs: f64, max_secs: f64) {
    let secs = if max_secs > min_secs {
        rand::thread_rng().gen_range(min_secs..max_secs)
    } else {
        min_secs.max(0.0)
    };
    if secs > 0.0 {
        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
    }
}

struct AttemptResult {
    response: Option<RawResponse>,
    accepted: bool,
}

/// Drives one request through its domain's retry policy:
/// direct attempt -> up to `domain.retries` same-URL retries with a random
/// delay in `[retry_delay_min_secs, retry_delay_max_secs]` -> if still not
/// accepted, `domain.retry_http` is set, and the URL is https, one
/// http-rewritten attempt. Stops at the first accepted response. Every
/// attempt is routed through `requester`, which itself decides direct vs.
/// proxy-rotated fetch based on `domain.proxy_default`.
#[allow(clippy::too_many_arguments)]
async fn retry_request(
    requester: &Requester,
    store: &Store,
    proxies: &ProxyPool,
    url: &Url,
    headers: HeaderMap,
    timeout: Duration,
    domain: &Domain,
    accepted_status: &AcceptedStatus,
) -> AttemptResult {
    let mut last_response: Option<RawResponse> = None;
    let total_attempts = 1 + domain.retries.max(0) as usize;

    for attempt in 0..total_attempts {
        if attempt > 0 {
            random_delay(domain.retry_delay_min_secs, domain.retry_delay_max_secs).await;
        }
        let result = requester
            .request(store, proxies, url, headers.clone(), accepted_status, timeout, domain.proxy_default)
            .await;
        if let Some(resp) = result.response {
            last_response = Some(resp);
            if result.valid {
                return AttemptResult { response: last_response, accepted: true };
            }
        }
    }

    if domain.retry_http && url.scheme() == "https" {
        let mut http_url = url.clone();
        let _ = http_url.set_scheme("http");
        let result = requester
            .request(store, proxies, &http_url, headers, accepted_status, timeout, domain.proxy_default)
            .await;
        if let Some(resp) = result.response {
            last_response = Some(resp);
            if result.valid {
                return AttemptResult { response: last_response, accepted: true };
            }
        }
    }

    AttemptResult { response: last_response, accepted: false }
}

pub struct Orchestrator {
    requester: Requester,
}

impl Orchestrator {
    pub fn new() -> Result<Self, webreq_http::HttpError> {
        Ok(Self {
            requester: Requester::new()?,
        })
    }

    /// Run the retry-escalation loop for one request and persist whatever
    /// came of it, then feed the outcome back into the tracker's per-tick
    /// masks. Returns `true` unconditionally — every call here is an
    /// attempt the caller has already decided to make (see
    /// `StatusTracker::pick_request`), so it always counts as progress for
    /// the Handler's idle-sleep bookkeeping.
    pub async fn orchestrate(
        &self,
        store: &Store,
        tracker: &StatusTracker,
        proxies: &ProxyPool,
        request: &Request,
        domain: &Domain,
        accepted_status: &AcceptedStatus,
    ) -> Result<bool, Error> {
        let url = Url::parse(&request.url).map_err(|e| Error::Request(e.to_string()))?;
        let headers = json_to_header_map(&request.header)?;
        let timeout = Duration::from_secs(domain.timeout_secs.unwrap_or(30).max(0) as u64);

        let result = retry_request(
            &self.requester,
            store,
            proxies,
            &url,
            headers,
            timeout,
            domain,
            accepted_status,
        )
        .await;

        match result.response {
            Some(resp) => {
                let header_value = header_map_to_json(&resp.headers);
                store
                    .record_response(
                        request.id,
                        resp.status.as_u16() as i64,
                        &header_value,
                        Some(&resp.body),
                        accepted_status,
                        resp.elapsed.as_secs_f64(),
                    )
                    .await
                    .map_err(Error::from)?;
                tracker.record_bytes(domain.id, resp.body.len() as u64);
            }
            None => {
                store
                    .record_transport_failure(request.id)
                    .await
                    .map_err(Error::from)?;
            }
        }

        tracker.record_outcome(domain.id, request.header_id, result.accepted);
        Ok(true)
    }
}

fn json_to_header_map(header_json: &str) -> Result<HeaderMap, Error> {
    let value: Value =
        serde_json::from_str(header_json).map_err(|e| Error::Payload(e.to_string()))?;
    let mut map = HeaderMap::new();
    if let Value::Object(obj) = value {
        for (key, val) in obj {
            let Value::String(val) = val else { continue };
            if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(key.as_bytes()), HeaderValue::from_str(&val)) {
                map.insert(name, value);
            }
        }
    }
    Ok(map)
}

fn header_map_to_json(headers: &HeaderMap) -> Value {
    let mut obj = serde_json::Map::new();
    for (key, value) in headers.iter() {
        if let Ok(s) = value.to_str() {
            obj.insert(key.as_str().to_string(), Value::String(s.to_string()));
        }
    }
    Value::Object(obj)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_json_round_trips() {
        let json = r#"{"accept":"text/html","x-foo":"bar"}"#;
        let map = json_to_header_map(json).unwrap();
        assert_eq!(map.get("accept").unwrap(), "text/html");
        assert_eq!(map.get("x-foo").unwrap(), "bar");

        let back = header_map_to_json(&map);
        assert_eq!(back["accept"], "text/html");
    }
}
