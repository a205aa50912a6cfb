//! Top-level API surface: request intake, response lookup, and the tick
//! loop that drives pending/failed requests through the Orchestrator.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Duration as TokioDuration;
use tokio_util::sync::CancellationToken;
use webreq_common::{AcceptedStatus, Error};
use webreq_store::{Domain, DomainId, DomainStatus, ProxyRecord, Request, RequestId, Response, Store};

use crate::orchestrator::Orchestrator;
use crate::proxy::ProxyPool;
use crate::status_tracker::StatusTracker;

const DEFAULT_PER_DOMAIN_TICK_CAP: usize = 50;
const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 16;

/// Per-domain policy knobs, applied at the moment a Domain row is first
/// created (`register_domain` is otherwise a pure get-or-insert, so later
/// config changes only affect domains not yet seen). Defaults match §6 of
/// the external interface contract: 30s timeout, 2 retries, no inter-retry
/// delay, no http fallback, no bandwidth cap.
#[derive(Clone, Debug)]
pub struct DomainPolicySpec {
    pub bps_limit: Option<f64>,
    pub max_concurrent: Option<i64>,
    pub timeout_secs: Option<i64>,
    pub retries: i64,
    pub retry_delay_min_secs: f64,
    pub retry_delay_max_secs: f64,
    pub retry_http: bool,
    pub retry_proxies: bool,
    pub proxy_default: bool,
    pub proxy_regions: Option<String>,
    pub retry_interval_secs: Option<i64>,
}

impl Default for DomainPolicySpec {
    fn default() -> Self {
        Self {
            bps_limit: None,
            max_concurrent: None,
            timeout_secs: Some(30),
            retries: 2,
            retry_delay_min_secs: 0.0,
            retry_delay_max_secs: 0.0,
            retry_http: false,
            retry_proxies: false,
            proxy_default: false,
            proxy_regions: None,
            retry_interval_secs: None,
        }
    }
}

pub struct Handler {
    store: Arc<Store>,
    tracker: Arc<StatusTracker>,
    orchestrator: Arc<Orchestrator>,
    proxies: Arc<ProxyPool>,
    per_domain_cap: usize,
    max_concurrent: usize,
    domain_defaults: DomainPolicySpec,
    domain_overrides: HashMap<String, DomainPolicySpec>,
}

impl Handler {
    pub fn new(store: Store, tracker: StatusTracker, orchestrator: Orchestrator, proxies: ProxyPool) -> Self {
        Self {
            store: Arc::new(store),
            tracker: Arc::new(tracker),
            orchestrator: Arc::new(orchestrator),
            proxies: Arc::new(proxies),
            per_domain_cap: DEFAULT_PER_DOMAIN_TICK_CAP,
            max_concurrent: DEFAULT_MAX_CONCURRENT_FETCHES,
            domain_defaults: DomainPolicySpec::default(),
            domain_overrides: HashMap::new(),
        }
    }

    pub fn with_limits(mut self, per_domain_cap: usize, max_concurrent: usize) -> Self {
        self.per_domain_cap = per_domain_cap;
        self.max_concurrent = max_concurrent;
        self
    }

    /// Supplies the policy applied to any not-yet-seen Domain, plus
    /// per-hostname overrides (config's `domains:` list) keyed by the same
    /// `"{scheme}://{netloc}"` name `add_request` derives from a URL.
    pub fn with_domain_policy(
        mut self,
        defaults: DomainPolicySpec,
        overrides: HashMap<String, DomainPolicySpec>,
    ) -> Self {
        self.domain_defaults = defaults;
        self.domain_overrides = overrides;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Proxies known for a protocol, ascending by latency. Exposed for
    /// operators/maintenance tooling, independent of the tick loop's own
    /// proxy rotation (driven per-request by `domain.proxy_default`).
    pub async fn proxies_for(&self, protocol: &str) -> Result<Vec<ProxyRecord>, Error> {
        Ok(self.proxies.proxies_for(&self.store, protocol).await?)
    }

    /// Resolves the owning Domain from `url`'s `{scheme}://{netloc}` and
    /// registers the request under it (§4.5).
    pub async fn add_request(
        &self,
        url: &str,
        header: &Value,
        accepted_status: &AcceptedStatus,
        min_date: Option<DateTime<Utc>>,
        max_date: Option<DateTime<Utc>>,
    ) -> Result<RequestId, Error> {
        let parsed = url::Url::parse(url).map_err(|e| Error::Payload(e.to_string()))?;
        let domain_name = domain_netloc(&parsed)?;
        let policy = self
            .domain_overrides
            .get(&domain_name)
            .cloned()
            .unwrap_or_else(|| self.domain_defaults.clone());

        let domain_id = self
            .store
            .register_domain(
                &domain_name,
                policy.bps_limit,
                policy.max_concurrent,
                policy.timeout_secs,
                policy.retries,
                policy.retry_delay_min_secs,
                policy.retry_delay_max_secs,
                policy.retry_http,
                policy.retry_proxies,
                policy.proxy_default,
                policy.proxy_regions.as_deref(),
                policy.retry_interval_secs,
            )
            .await?;
        let request_id = self
            .store
            .register_request(domain_id, url, header, accepted_status, min_date, max_date)
            .await?;
        Ok(request_id)
    }

    /// The latest response that satisfies the request's accepted-status
    /// set, if any (§4.5) — `None` until one exists, thereafter forever.
    pub async fn get_response(&self, request_id: RequestId) -> Result<Option<Response>, Error> {
        Ok(self.store.get_latest_accepted_response(request_id).await?)
    }

    pub async fn fill_default_domain_timeouts(&self, default_retry_interval_secs: i64) -> Result<u64, Error> {
        Ok(self.store.fill_default_domain_timeouts(default_retry_interval_secs).await?)
    }

    pub async fn execute_pending_requests(&self) -> Result<bool, Error> {
        self.execute_for_status(0).await
    }

    pub async fn execute_failing_requests(&self) -> Result<bool, Error> {
        self.execute_for_status(1).await
    }

    /// Runs both passes unconditionally (OR-combined); a domain whose
    /// requests are all satisfied contributes nothing to either pass.
    pub async fn execute_requests(&self) -> Result<bool, Error> {
        let pending_changed = self.execute_pending_requests().await?;
        let failing_changed = self.execute_failing_requests().await?;
        Ok(pending_changed || failing_changed)
    }

    pub async fn execute_maintenance(&self, default_retry_interval_secs: i64) -> Result<(), Error> {
        self.store.fill_default_domain_timeouts(default_retry_interval_secs).await?;
        self.store.fill_missing_request_statuses().await?;
        Ok(())
    }

    /// Outer tick loop: run requests, then maintenance, sleeping
    /// `idle_tick_interval` only when a tick made no changes, until
    /// `cancel` fires.
    pub async fn run_forever(
        &self,
        idle_tick_interval: TokioDuration,
        default_retry_interval_secs: i64,
        cancel: CancellationToken,
    ) {
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let made_changes = match self.execute_requests().await {
                Ok(changed) => changed,
                Err(err) => {
                    tracing::warn!(error = %err, "handler.tick_failed");
                    false
                }
            };

            if let Err(err) = self.execute_maintenance(default_retry_interval_secs).await {
                tracing::warn!(error = %err, "handler.maintenance_failed");
            }

            if !made_changes {
                tokio::select! {
                    _ = tokio::time::sleep(idle_tick_interval) => {}
                    _ = cancel.cancelled() => break,
                }
            }
        }
    }

    /// Per-domain-capped, globally-shuffled candidate list for `status`
    /// (0 = pending, 1 = failed), plus every touched domain's current
    /// `(domain, header)` status rows for the StatusTracker's per-tick mask.
    async fn candidates(
        &self,
        status: i64,
    ) -> Result<(Vec<Request>, HashMap<DomainId, Domain>, Vec<DomainStatus>), Error> {
        let domains = self.store.domains().await?;
        let domain_map: HashMap<DomainId, Domain> = domains.into_iter().map(|d| (d.id, d)).collect();

        let mut flattened: Vec<Request> = Vec::new();
        let mut domain_status: Vec<DomainStatus> = Vec::new();
        for domain_id in domain_map.keys() {
            let requests = if status == 0 {
                self.store.pending_requests_for_domain(*domain_id).await?
            } else {
                self.store.failed_requests_for_domain(*domain_id).await?
            };
            if !requests.is_empty() {
                domain_status.extend(self.store.domain_status_for_domain(*domain_id).await?);
            }
            flattened.extend(requests.into_iter().take(self.per_domain_cap));
        }
        flattened.shuffle(&mut rand::thread_rng());

        Ok((flattened, domain_map, domain_status))
    }

    async fn execute_for_status(&self, status: i64) -> Result<bool, Error> {
        let (mut candidates, domains, domain_status) = self.candidates(status).await?;
        self.tracker.init_tick(&domain_status);
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut join_set = JoinSet::new();

        while let Some(picked_id) = self.tracker.pick_request(&candidates, &domains).map(|r| r.id) {
            let index = candidates
                .iter()
                .position(|r| r.id == picked_id)
                .expect("pick_request returns a candidate from the slice it was given");
            let request = candidates.remove(index);
            let domain = domains
                .get(&request.domain_id)
                .cloned()
                .expect("request's domain is present in the domain map");
            let accepted_status =
                AcceptedStatus::parse(&request.accepted_status).unwrap_or_default();

            let store = Arc::clone(&self.store);
            let tracker = Arc::clone(&self.tracker);
            let orchestrator = Arc::clone(&self.orchestrator);
            let proxies = Arc::clone(&self.proxies);
            let permit = Arc::clone(&semaphore);

            join_set.spawn(async move {
                let _permit = permit.acquire_owned().await.expect("semaphore open");
                orchestrator
                    .orchestrate(&store, &tracker, &proxies, &request, &domain, &accepted_status)
                    .await
            });
        }

        let mut made_changes = false;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(changed)) => made_changes |= changed,
                Ok(Err(err)) => tracing::warn!(error = %err, "handler.orchestrate_failed"),
                Err(join_err) => tracing::warn!(error = %join_err, "handler.task_panicked"),
            }
        }
        Ok(made_changes)
    }
}

/// `"{scheme}://{host}[:port]"`, matching the data model's `Domain{scheme,
/// netloc}` natural key (§3.1/§6).
fn domain_netloc(url: &url::Url) -> Result<String, Error> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::Payload(format!("URL has no host: {url}")))?;
    match url.port() {
        Some(port) => Ok(format!("{}://{}:{}", url.scheme(), host, port)),
        None => Ok(format!("{}://{}", url.scheme(), host)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_netloc_omits_default_port() {
        let url = url::Url::parse("https://example.com/a/b?x=1").unwrap();
        assert_eq!(domain_netloc(&url).unwrap(), "https://example.com");
    }

    #[test]
    fn domain_netloc_includes_explicit_port() {
        let url = url::Url::parse("http://example.com:8080/a").unwrap();
        assert_eq!(domain_netloc(&url).unwrap(), "http://example.com:8080");
    }
}
