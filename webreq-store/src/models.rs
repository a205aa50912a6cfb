use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

pub type DomainId = i64;
pub type UrlId = i64;
pub type HeaderId = i64;
pub type RequestId = i64;

#[derive(Debug, Clone, FromRow)]
pub struct Domain {
    pub id: DomainId,
    pub name: String,
    pub bps_limit: Option<f64>,
    pub max_concurrent: Option<i64>,
    pub timeout_secs: Option<i64>,
    pub retries: i64,
    pub retry_delay_min_secs: f64,
    pub retry_delay_max_secs: f64,
    pub retry_http: bool,
    pub retry_proxies: bool,
    pub proxy_default: bool,
    /// Comma-joined region hints for proxy selection; reserved, see
    /// `ProxyPool`.
    pub proxy_regions: Option<String>,
    /// How long a failed `(domain, header)` pair stays off-limits before it
    /// is eligible for retry again. Filled in by
    /// `Store::fill_default_domain_timeouts` for any domain lacking one.
    pub retry_interval_secs: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Url {
    pub id: UrlId,
    pub domain_id: DomainId,
    pub path: String,
    pub query: String,
    pub path_hash: String,
    pub query_hash: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct Header {
    pub id: HeaderId,
    pub json: String,
    pub hash: String,
}

/// A request row joined with its owning url/header/domain for direct use by
/// the scheduler and orchestrator, so callers never have to chase three
/// foreign keys to execute a fetch.
#[derive(Debug, Clone, FromRow)]
pub struct Request {
    pub id: RequestId,
    pub domain_id: DomainId,
    pub url_id: UrlId,
    pub header_id: HeaderId,
    pub url: String,
    pub header: String,
    /// Comma-joined status codes, see `webreq_common::AcceptedStatus`.
    pub accepted_status: String,
    pub date: DateTime<Utc>,
    pub min_date: Option<DateTime<Utc>>,
    pub max_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Response {
    pub id: i64,
    pub request_id: RequestId,
    pub status_code: i64,
    /// JSON-encoded header map.
    pub header: String,
    /// Gzip-compressed body, or `None` when the fetch never got a body.
    pub content: Option<Vec<u8>>,
    pub elapsed_secs: f64,
    pub created_at: DateTime<Utc>,
}

/// Derived lifecycle state for a request — see `RequestStatus` invariants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i64)]
pub enum RequestStatus {
    Pending = 0,
    Failed = 1,
    Satisfied = 2,
}

impl RequestStatus {
    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => RequestStatus::Failed,
            2 => RequestStatus::Satisfied,
            _ => RequestStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct RequestStatusRow {
    pub request_id: RequestId,
    pub status: i64,
    pub changed_at: DateTime<Utc>,
}

impl RequestStatusRow {
    pub fn status(&self) -> RequestStatus {
        RequestStatus::from_i64(self.status)
    }
}

/// Mirrors the outcome of the latest `Response` for any request sharing a
/// `(domain, header)` pair (invariant 5).
#[derive(Debug, Clone, Copy, FromRow)]
pub struct DomainStatus {
    pub domain_id: DomainId,
    pub header_id: HeaderId,
    pub last_attempt_at: DateTime<Utc>,
    pub status: i64,
}

impl DomainStatus {
    pub fn status(&self) -> RequestStatus {
        RequestStatus::from_i64(self.status)
    }
}

/// The retry clock for a `(domain, header)` pair (invariant 6): absent or in
/// the past means immediately runnable.
#[derive(Debug, Clone, Copy, FromRow)]
pub struct DomainRetry {
    pub domain_id: DomainId,
    pub header_id: HeaderId,
    pub not_before: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ProxyRecord {
    pub id: i64,
    pub address: String,
    pub protocol: String,
    pub last_latency_secs: Option<f64>,
    pub last_checked_at: Option<DateTime<Utc>>,
}
