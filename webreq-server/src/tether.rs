//! Wiring: turns a loaded [`WebReqConfig`] into a running Store + Handler +
//! HTTP listener, and drives them until Ctrl-C. Grounded on the teacher's
//! `tether.rs`/`Builder` two-phase "construct collaborators, then start"
//! shape, generalized from actor-mailbox construction to plain struct
//! composition since `Handler` (unlike the teacher's actors) exposes a
//! direct async API rather than a message-passing one.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use webreq_config::{DomainDefaults, DomainOverride, WebReqConfig};
use webreq_core::handler::DomainPolicySpec;
use webreq_core::{Handler, Orchestrator, ProxyPool, StatusTracker};
use webreq_store::Store;

use crate::api::{self, AppState};

const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 16;

fn domain_defaults_to_policy(d: &DomainDefaults) -> DomainPolicySpec {
    DomainPolicySpec {
        bps_limit: d.bps_limit,
        max_concurrent: d.max_concurrent.map(i64::from),
        timeout_secs: Some(d.timeout_secs as i64),
        retries: d.retries as i64,
        retry_delay_min_secs: d.retry_delay_min_secs,
        retry_delay_max_secs: d.retry_delay_max_secs,
        retry_http: d.retry_http,
        retry_proxies: d.retry_proxies,
        proxy_default: d.proxy_default,
        proxy_regions: d.proxy_regions.clone(),
        retry_interval_secs: Some(d.retry_interval_secs as i64),
    }
}

fn domain_override_to_policy(o: &DomainOverride, defaults: &DomainPolicySpec) -> DomainPolicySpec {
    DomainPolicySpec {
        bps_limit: o.bps_limit.or(defaults.bps_limit),
        max_concurrent: o.max_concurrent.map(i64::from).or(defaults.max_concurrent),
        timeout_secs: o.timeout_secs.map(|v| v as i64).or(defaults.timeout_secs),
        retries: o.retries.map(i64::from).unwrap_or(defaults.retries),
        retry_delay_min_secs: defaults.retry_delay_min_secs,
        retry_delay_max_secs: defaults.retry_delay_max_secs,
        retry_http: o.retry_http.unwrap_or(defaults.retry_http),
        retry_proxies: o.retry_proxies.unwrap_or(defaults.retry_proxies),
        proxy_default: o.proxy_default.unwrap_or(defaults.proxy_default),
        proxy_regions: o.proxy_regions.clone().or_else(|| defaults.proxy_regions.clone()),
        retry_interval_secs: o.retry_interval_secs.map(|v| v as i64).or(defaults.retry_interval_secs),
    }
}

/// Connects to the configured SQLite database, creating the file (and
/// running schema migrations) if absent.
async fn connect_store(database_path: &str) -> Result<Store> {
    let url = format!("sqlite://{database_path}?mode=rwc");
    Store::connect(&url)
        .await
        .with_context(|| format!("connecting to sqlite database at {database_path}"))
}

/// Everything needed to run the service: the HTTP router and the
/// already-spawned background tick loop.
pub struct Tether {
    pub router: Router,
    pub bind_addr: SocketAddr,
    tick_task: tokio::task::JoinHandle<()>,
    cancel: CancellationToken,
}

impl Tether {
    pub async fn build(cfg: WebReqConfig) -> Result<Self> {
        let store = connect_store(&cfg.database.path).await?;
        let tracker = StatusTracker::new(cfg.defaults.bps_sample_capacity);
        let orchestrator = Orchestrator::new().context("building the HTTP requester")?;
        let proxies = ProxyPool::new(cfg.defaults.proxy_freshness_secs);

        let defaults_policy = domain_defaults_to_policy(&cfg.defaults);
        let overrides: HashMap<String, DomainPolicySpec> = cfg
            .domains
            .iter()
            .map(|o| (o.name.clone(), domain_override_to_policy(o, &defaults_policy)))
            .collect();

        let handler = Arc::new(
            Handler::new(store, tracker, orchestrator, proxies)
                .with_limits(cfg.defaults.per_tick_domain_cap, DEFAULT_MAX_CONCURRENT_FETCHES)
                .with_domain_policy(defaults_policy, overrides),
        );

        let bind_addr: SocketAddr = cfg
            .api
            .bind_addr
            .parse()
            .with_context(|| format!("invalid api.bind_addr: {}", cfg.api.bind_addr))?;

        let cancel = CancellationToken::new();
        let tick_handler = Arc::clone(&handler);
        let tick_cancel = cancel.clone();
        let idle_interval = Duration::from_secs(cfg.defaults.idle_tick_interval_secs.max(1));
        let default_retry_interval_secs = cfg.defaults.retry_interval_secs as i64;
        let tick_task = tokio::spawn(async move {
            tick_handler
                .run_forever(idle_interval, default_retry_interval_secs, tick_cancel)
                .await;
        });

        let router = Router::new()
            .route("/", get(api::get_response).post(api::add_request))
            .layer(TraceLayer::new_for_http())
            .with_state(AppState { handler });

        Ok(Self {
            router,
            bind_addr,
            tick_task,
            cancel,
        })
    }

    /// Serve the HTTP API until Ctrl-C, then cancel the tick loop and wait
    /// for it to observe the signal and exit.
    pub async fn run(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr)
            .await
            .with_context(|| format!("binding {}", self.bind_addr))?;
        info!(addr = %self.bind_addr, "server.listening");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("serving HTTP API")?;

        self.cancel.cancel();
        self.tick_task.await.context("tick loop task panicked")?;
        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("server.shutdown_signal_received");
}
