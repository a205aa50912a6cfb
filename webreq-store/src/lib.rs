//! Durable storage for the request orchestrator: domains, requests,
//! responses, and the derived status tables that drive scheduling.
//!
//! Every mutating [`Store`] method runs inside its own `sqlx::Transaction`
//! and serializes behind an internal write permit, matching SQLite's
//! single-writer constraint without blocking concurrent reads.

mod dedup;
mod error;
mod models;
mod schema;
mod store;

pub use error::{Result, StoreError};
pub use models::{
    Domain, DomainId, DomainRetry, DomainStatus, Header, HeaderId, ProxyRecord, Request,
    RequestId, RequestStatus, RequestStatusRow, Response, Url, UrlId,
};
pub use store::{Store, DEFAULT_RETRY_INTERVAL_SECS};
