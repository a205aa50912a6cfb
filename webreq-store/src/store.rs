use std::io::{Read, Write};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tokio::sync::Semaphore;
use tracing::info;
use url::Url;
use webreq_common::AcceptedStatus;

use crate::dedup::{header_hash, md5_hex};
use crate::error::{Result, StoreError};
use crate::models::{
    Domain, DomainId, DomainRetry, DomainStatus, HeaderId, ProxyRecord, Request, RequestId,
    RequestStatus, RequestStatusRow, Response, UrlId,
};
use crate::schema;

/// Default retry interval (DomainTimeout) applied to a domain until an
/// operator-configured one is filled in — 3 hours, per the external
/// interface defaults table.
pub const DEFAULT_RETRY_INTERVAL_SECS: i64 = 3 * 3600;

/// Durable storage for domains, URLs, headers, requests, responses, and the
/// derived status tables that drive scheduling. All mutating operations
/// serialize behind a single write permit (SQLite's single-writer
/// constraint); reads are unrestricted.
pub struct Store {
    pool: SqlitePool,
    write_limit: Arc<Semaphore>,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        schema::migrate(&pool).await?;
        Ok(Self {
            pool,
            write_limit: Arc::new(Semaphore::new(1)),
        })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_limit: Arc::new(Semaphore::new(1)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn register_domain(
        &self,
        name: &str,
        bps_limit: Option<f64>,
        max_concurrent: Option<i64>,
        timeout_secs: Option<i64>,
        retries: i64,
        retry_delay_min_secs: f64,
        retry_delay_max_secs: f64,
        retry_http: bool,
        retry_proxies: bool,
        proxy_default: bool,
        proxy_regions: Option<&str>,
        retry_interval_secs: Option<i64>,
    ) -> Result<DomainId> {
        let _permit = self.write_limit.acquire().await.expect("semaphore open");
        let mut tx = self.pool.begin().await?;

        if let Some((id,)) = sqlx::query_as::<_, (i64,)>("SELECT id FROM domain WHERE name = ?1")
            .bind(name)
            .fetch_optional(&mut *tx)
            .await?
        {
            tx.commit().await?;
            return Ok(id);
        }

        let now = Utc::now();
        let id = sqlx::query(
            r#"
            INSERT INTO domain
                (name, bps_limit, max_concurrent, timeout_secs, retries,
                 retry_delay_min_secs, retry_delay_max_secs, retry_http, retry_proxies,
                 proxy_default, proxy_regions, retry_interval_secs, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(name)
        .bind(bps_limit)
        .bind(max_concurrent)
        .bind(timeout_secs)
        .bind(retries)
        .bind(retry_delay_min_secs)
        .bind(retry_delay_max_secs)
        .bind(retry_http)
        .bind(retry_proxies)
        .bind(proxy_default)
        .bind(proxy_regions)
        .bind(retry_interval_secs)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        tx.commit().await?;
        info!(domain_id = id, name, "store.register_domain");
        Ok(id)
    }

    async fn get_or_insert_url(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        domain_id: DomainId,
        path: &str,
        query: &str,
    ) -> Result<UrlId> {
        let path_hash = md5_hex(path);
        let query_hash = md5_hex(query);

        if let Some((id,)) = sqlx::query_as::<_, (i64,)>(
            "SELECT id FROM url WHERE domain_id = ?1 AND path_hash = ?2 AND query_hash = ?3",
        )
        .bind(domain_id)
        .bind(&path_hash)
        .bind(&query_hash)
        .fetch_optional(&mut **tx)
        .await?
        {
            return Ok(id);
        }

        let id = sqlx::query(
            "INSERT INTO url (domain_id, path, query, path_hash, query_hash) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(domain_id)
        .bind(path)
        .bind(query)
        .bind(&path_hash)
        .bind(&query_hash)
        .execute(&mut **tx)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    async fn get_or_insert_header(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        header: &Value,
    ) -> Result<HeaderId> {
        let hash = header_hash(header);
        if let Some((id,)) = sqlx::query_as::<_, (i64,)>("SELECT id FROM header WHERE hash = ?1")
            .bind(&hash)
            .fetch_optional(&mut **tx)
            .await?
        {
            return Ok(id);
        }

        let json = serde_json::to_string(header)?;
        let id = sqlx::query("INSERT INTO header (json, hash) VALUES (?1, ?2)")
            .bind(&json)
            .bind(&hash)
            .execute(&mut **tx)
            .await?
            .last_insert_rowid();
        Ok(id)
    }

    /// Dedup and register a request (invariant 1). `url` is re-parsed into
    /// its owning path/query and get-or-inserted as a `url` row; `header` is
    /// canonicalised and get-or-inserted as a `header` row. If a Request row
    /// already exists for the resulting `(url_id, header_id)` pair with a
    /// `date` inside `[min_date, max_date]` (or exactly `now` when no window
    /// is given), that row's id is reused and `accepted_status` is unioned
    /// into it; otherwise a new row is inserted with `date = now`.
    pub async fn register_request(
        &self,
        domain_id: DomainId,
        url: &str,
        header: &Value,
        accepted_status: &AcceptedStatus,
        min_date: Option<DateTime<Utc>>,
        max_date: Option<DateTime<Utc>>,
    ) -> Result<RequestId> {
        let parsed = Url::parse(url).map_err(|e| StoreError::Url(e.to_string()))?;
        let path = parsed.path();
        let query = parsed.query().unwrap_or("");

        let _permit = self.write_limit.acquire().await.expect("semaphore open");
        let mut tx = self.pool.begin().await?;

        let url_id = Self::get_or_insert_url(&mut tx, domain_id, path, query).await?;
        let header_id = Self::get_or_insert_header(&mut tx, header).await?;
        let now = Utc::now();

        let existing: Option<(i64, String)> = match (min_date, max_date) {
            (None, None) => sqlx::query_as(
                "SELECT id, accepted_status FROM request WHERE url_id = ?1 AND header_id = ?2 AND date = ?3",
            )
            .bind(url_id)
            .bind(header_id)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?,
            _ => {
                let lo = min_date.unwrap_or(DateTime::<Utc>::MIN_UTC);
                let hi = max_date.unwrap_or(DateTime::<Utc>::MAX_UTC);
                sqlx::query_as(
                    "SELECT id, accepted_status FROM request WHERE url_id = ?1 AND header_id = ?2 AND date >= ?3 AND date <= ?4 ORDER BY date DESC LIMIT 1",
                )
                .bind(url_id)
                .bind(header_id)
                .bind(lo)
                .bind(hi)
                .fetch_optional(&mut *tx)
                .await?
            }
        };

        if let Some((id, existing_accepted)) = existing {
            let merged = AcceptedStatus::parse(&existing_accepted)
                .unwrap_or_default()
                .union(accepted_status);
            sqlx::query("UPDATE request SET accepted_status = ?1 WHERE id = ?2")
                .bind(merged.to_string())
                .bind(id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            return Ok(id);
        }

        let id = sqlx::query(
            r#"
            INSERT INTO request
                (url_id, header_id, domain_id, accepted_status, date, min_date, max_date, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(url_id)
        .bind(header_id)
        .bind(domain_id)
        .bind(accepted_status.to_string())
        .bind(now)
        .bind(min_date)
        .bind(max_date)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        sqlx::query("INSERT INTO request_status (request_id, status, changed_at) VALUES (?1, 0, ?2)")
            .bind(id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!(request_id = id, domain_id, url_id, header_id, "store.register_request");
        Ok(id)
    }

    /// Record a fetched response and apply the derived-status transitions
    /// (§3.4–3.6) inside the same transaction. `content` is plaintext; it is
    /// gzip-compressed before being written, matching the original wire
    /// format where `Response.content` is never stored uncompressed.
    pub async fn record_response(
        &self,
        request_id: RequestId,
        status_code: i64,
        header: &Value,
        content: Option<&[u8]>,
        accepted_status: &AcceptedStatus,
        elapsed_secs: f64,
    ) -> Result<()> {
        let header_json = serde_json::to_string(header)?;
        let compressed = match content {
            Some(bytes) => Some(gzip_compress(bytes)?),
            None => None,
        };

        let _permit = self.write_limit.acquire().await.expect("semaphore open");
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO response (request_id, status_code, header, content, elapsed_secs, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(request_id)
        .bind(status_code)
        .bind(&header_json)
        .bind(&compressed)
        .bind(elapsed_secs)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let accepted = accepted_status.contains(status_code as u16);
        self.apply_status_transition(&mut tx, request_id, accepted, now).await?;

        tx.commit().await?;
        info!(request_id, status_code, accepted, "store.record_response");
        Ok(())
    }

    /// Record a transport failure (no response was ever obtained) — flips
    /// the request and its (domain, header) pair to FAILED without
    /// inserting a Response row.
    pub async fn record_transport_failure(&self, request_id: RequestId) -> Result<()> {
        let _permit = self.write_limit.acquire().await.expect("semaphore open");
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        self.apply_status_transition(&mut tx, request_id, false, now).await?;
        tx.commit().await?;
        info!(request_id, "store.record_transport_failure");
        Ok(())
    }

    async fn apply_status_transition(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        request_id: RequestId,
        accepted: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let (domain_id, header_id, retry_interval_secs): (i64, i64, Option<i64>) = sqlx::query_as(
            r#"
            SELECT r.domain_id, r.header_id, d.retry_interval_secs
            FROM request r JOIN domain d ON d.id = r.domain_id
            WHERE r.id = ?1
            "#,
        )
        .bind(request_id)
        .fetch_one(&mut **tx)
        .await?;

        // RequestStatus is recomputed unconditionally on every insertion
        // (invariant 4) — a request that was SATISFIED by an earlier
        // accepted response regresses to FAILED the moment a later response
        // comes back unaccepted, matching the original's unconditional
        // trigger and the retry pool's plain `status = 1` filter.
        let new_status = if accepted { 2 } else { 1 };
        sqlx::query("UPDATE request_status SET status = ?1, changed_at = ?2 WHERE request_id = ?3")
            .bind(new_status)
            .bind(now)
            .bind(request_id)
            .execute(&mut **tx)
            .await?;

        // DomainStatus always mirrors the latest attempt for the pair
        // (invariant 5), regardless of this request's own prior status.
        let status_value: i64 = if accepted { 2 } else { 1 };
        sqlx::query(
            r#"
            INSERT INTO domain_status (domain_id, header_id, last_attempt_at, status)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(domain_id, header_id) DO UPDATE SET
                last_attempt_at = excluded.last_attempt_at,
                status = excluded.status
            "#,
        )
        .bind(domain_id)
        .bind(header_id)
        .bind(now)
        .bind(status_value)
        .execute(&mut **tx)
        .await?;

        // DomainRetry (invariant 6): set a not_before clock on failure,
        // clear it once the pair is satisfied so a later pending request
        // under the same pair isn't blocked by a stale backoff.
        let not_before = if accepted {
            None
        } else {
            let interval = retry_interval_secs.unwrap_or(DEFAULT_RETRY_INTERVAL_SECS);
            Some(now + chrono::Duration::seconds(interval))
        };
        sqlx::query(
            r#"
            INSERT INTO domain_retry (domain_id, header_id, not_before)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(domain_id, header_id) DO UPDATE SET not_before = excluded.not_before
            "#,
        )
        .bind(domain_id)
        .bind(header_id)
        .bind(not_before)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Latest response overall, regardless of whether it satisfied the
    /// request's accepted-status set. Mainly useful for diagnostics; callers
    /// polling for "the" answer want [`Store::get_latest_accepted_response`].
    pub async fn latest_response(&self, request_id: RequestId) -> Result<Option<Response>> {
        let row = sqlx::query_as::<_, Response>(
            "SELECT id, request_id, status_code, header, content, elapsed_secs, created_at FROM response WHERE request_id = ?1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_accepted_status(&self, request_id: RequestId) -> Result<Option<AcceptedStatus>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT accepted_status FROM request WHERE id = ?1")
                .bind(request_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|(s,)| AcceptedStatus::parse(&s).ok()))
    }

    /// The most recent `Response` whose status code is in the request's
    /// accepted set — "satisfied" may not mean "latest overall" (scenario:
    /// 200 at 12:05 followed by a 500 at 12:10 still resolves to the 12:05
    /// response here, even though `RequestStatus` itself has since flipped
    /// back to FAILED, because it is recomputed unconditionally from the
    /// latest response on every insertion rather than tracking "was this
    /// ever accepted").
    pub async fn get_latest_accepted_response(&self, request_id: RequestId) -> Result<Option<Response>> {
        let Some(accepted) = self.get_accepted_status(request_id).await? else {
            return Ok(None);
        };
        let rows = sqlx::query_as::<_, Response>(
            "SELECT id, request_id, status_code, header, content, elapsed_secs, created_at FROM response WHERE request_id = ?1 ORDER BY created_at DESC",
        )
        .bind(request_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().find(|r| accepted.contains(r.status_code as u16)))
    }

    pub async fn pending_requests_for_domain(&self, domain_id: DomainId) -> Result<Vec<Request>> {
        self.requests_in_status(domain_id, 0).await
    }

    pub async fn failed_requests_for_domain(&self, domain_id: DomainId) -> Result<Vec<Request>> {
        self.requests_in_status(domain_id, 1).await
    }

    /// Pending/failed candidate rows for a domain, gated on that request's
    /// `(domain, header)` retry clock — a never-before-attempted request can
    /// still be blocked if another request sharing its header recently
    /// failed (§4.1's `get_pending_requests`/`get_retryable_failing_requests`).
    async fn requests_in_status(&self, domain_id: DomainId, status: i64) -> Result<Vec<Request>> {
        let now = Utc::now();
        let rows = sqlx::query_as::<_, Request>(
            r#"
            SELECT
                r.id, r.domain_id, r.url_id, r.header_id,
                (d.name || u.path || CASE WHEN u.query <> '' THEN '?' || u.query ELSE '' END) AS url,
                h.json AS header,
                r.accepted_status, r.date, r.min_date, r.max_date, r.created_at
            FROM request r
            JOIN request_status rs ON rs.request_id = r.id
            JOIN domain d ON d.id = r.domain_id
            JOIN url u ON u.id = r.url_id
            JOIN header h ON h.id = r.header_id
            LEFT JOIN domain_retry dr ON dr.domain_id = r.domain_id AND dr.header_id = r.header_id
            WHERE r.domain_id = ?1
              AND rs.status = ?2
              AND (dr.not_before IS NULL OR dr.not_before <= ?3)
            "#,
        )
        .bind(domain_id)
        .bind(status)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn domains(&self) -> Result<Vec<Domain>> {
        let rows = sqlx::query_as::<_, Domain>(
            r#"
            SELECT id, name, bps_limit, max_concurrent, timeout_secs, retries,
                   retry_delay_min_secs, retry_delay_max_secs, retry_http, retry_proxies,
                   proxy_default, proxy_regions, retry_interval_secs, created_at
            FROM domain
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn request_status(&self, request_id: RequestId) -> Result<Option<RequestStatusRow>> {
        let row = sqlx::query_as::<_, RequestStatusRow>(
            "SELECT request_id, status, changed_at FROM request_status WHERE request_id = ?1",
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// All `(domain, header)` outcome rows for a domain.
    pub async fn domain_status_for_domain(&self, domain_id: DomainId) -> Result<Vec<DomainStatus>> {
        let rows = sqlx::query_as::<_, DomainStatus>(
            "SELECT domain_id, header_id, last_attempt_at, status FROM domain_status WHERE domain_id = ?1",
        )
        .bind(domain_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn domain_retry_for_domain(&self, domain_id: DomainId) -> Result<Vec<DomainRetry>> {
        let rows = sqlx::query_as::<_, DomainRetry>(
            "SELECT domain_id, header_id, not_before FROM domain_retry WHERE domain_id = ?1",
        )
        .bind(domain_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Applies the configured default retry interval (DomainTimeout) to any
    /// domain row whose `retry_interval_secs` is null. Returns the number of
    /// rows updated.
    pub async fn fill_default_domain_timeouts(&self, default_retry_interval_secs: i64) -> Result<u64> {
        let _permit = self.write_limit.acquire().await.expect("semaphore open");
        let result = sqlx::query(
            "UPDATE domain SET retry_interval_secs = ?1 WHERE retry_interval_secs IS NULL",
        )
        .bind(default_retry_interval_secs)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Repairs any request lacking a `request_status` row (can only arise
    /// from a crash between the original insert and its transactional
    /// status seed). Returns the number of rows repaired.
    pub async fn fill_missing_request_statuses(&self) -> Result<usize> {
        let _permit = self.write_limit.acquire().await.expect("semaphore open");
        let mut tx = self.pool.begin().await?;

        let missing: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT r.id FROM request r
            LEFT JOIN request_status rs ON rs.request_id = r.id
            WHERE rs.request_id IS NULL
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;

        let now = Utc::now();
        for (request_id,) in &missing {
            sqlx::query(
                "INSERT INTO request_status (request_id, status, changed_at) VALUES (?1, 0, ?2)",
            )
            .bind(request_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        if !missing.is_empty() {
            info!(repaired = missing.len(), "store.fill_missing_request_statuses");
        }
        Ok(missing.len())
    }

    pub async fn upsert_proxy(
        &self,
        address: &str,
        protocol: &str,
        latency_secs: Option<f64>,
    ) -> Result<()> {
        let _permit = self.write_limit.acquire().await.expect("semaphore open");
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO proxy (address, protocol, last_latency_secs, last_checked_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(address, protocol) DO UPDATE SET
                last_latency_secs = excluded.last_latency_secs,
                last_checked_at = excluded.last_checked_at
            "#,
        )
        .bind(address)
        .bind(protocol)
        .bind(latency_secs)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Proxies for a protocol, ascending by latency — unknown/NaN latency
    /// sorts last so an untested proxy is tried before a known-slow one but
    /// after any known-fast one.
    pub async fn proxies_for_protocol(&self, protocol: &str) -> Result<Vec<ProxyRecord>> {
        let rows = sqlx::query_as::<_, ProxyRecord>(
            r#"
            SELECT id, address, protocol, last_latency_secs, last_checked_at
            FROM proxy
            WHERE protocol = ?1
            ORDER BY last_latency_secs IS NULL, last_latency_secs ASC
            "#,
        )
        .bind(protocol)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

fn gzip_compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

impl Response {
    pub fn decompressed_content(&self) -> std::io::Result<Option<Vec<u8>>> {
        match &self.content {
            None => Ok(None),
            Some(bytes) => {
                let mut decoder = GzDecoder::new(&bytes[..]);
                let mut out = Vec::new();
                decoder.read_to_end(&mut out)?;
                Ok(Some(out))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn memory_store() -> Store {
        Store::connect("sqlite::memory:").await.expect("in-memory store")
    }

    async fn register_domain_defaults(store: &Store, name: &str) -> DomainId {
        store
            .register_domain(name, None, None, None, 3, 1.0, 5.0, false, false, false, None, None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn register_domain_is_get_or_insert() {
        let store = memory_store().await;
        let a = register_domain_defaults(&store, "https://example.com").await;
        let b = store
            .register_domain(
                "https://example.com",
                Some(500.0),
                None,
                None,
                3,
                1.0,
                5.0,
                false,
                false,
                false,
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn register_request_dedups_same_url_and_header() {
        let store = memory_store().await;
        let domain_id = register_domain_defaults(&store, "https://example.com").await;
        let header = json!({"accept": "text/html"});
        let accepted = AcceptedStatus::default();

        let r1 = store
            .register_request(domain_id, "https://example.com/page?x=1", &header, &accepted, None, None)
            .await
            .unwrap();
        // Second call has no window, so it only reuses a row whose `date`
        // is exactly `now` — effectively never, so a fresh row is created.
        let r2 = store
            .register_request(domain_id, "https://example.com/page?x=1", &header, &accepted, None, None)
            .await
            .unwrap();
        assert_ne!(r1, r2);
    }

    #[tokio::test]
    async fn register_request_reuses_within_window() {
        let store = memory_store().await;
        let domain_id = register_domain_defaults(&store, "https://example.com").await;
        let header = json!({});
        let accepted = AcceptedStatus::default();

        let first = store
            .register_request(domain_id, "https://example.com/a", &header, &accepted, None, None)
            .await
            .unwrap();

        let now = Utc::now();
        let reused = store
            .register_request(
                domain_id,
                "https://example.com/a",
                &header,
                &accepted,
                Some(now - chrono::Duration::hours(1)),
                Some(now + chrono::Duration::hours(1)),
            )
            .await
            .unwrap();
        assert_eq!(first, reused);
    }

    #[tokio::test]
    async fn register_request_unions_accepted_status_on_reuse() {
        let store = memory_store().await;
        let domain_id = register_domain_defaults(&store, "https://example.com").await;
        let header = json!({});

        let rid = store
            .register_request(
                domain_id,
                "https://example.com/a",
                &header,
                &AcceptedStatus(vec![200]),
                None,
                None,
            )
            .await
            .unwrap();
        let now = Utc::now();
        let reused = store
            .register_request(
                domain_id,
                "https://example.com/a",
                &header,
                &AcceptedStatus(vec![301]),
                Some(now - chrono::Duration::minutes(5)),
                Some(now + chrono::Duration::minutes(5)),
            )
            .await
            .unwrap();
        assert_eq!(rid, reused);

        let accepted = store.get_accepted_status(rid).await.unwrap().unwrap();
        assert_eq!(accepted, AcceptedStatus(vec![200, 301]));
    }

    #[tokio::test]
    async fn record_response_flips_status_and_domain_status() {
        let store = memory_store().await;
        let domain_id = register_domain_defaults(&store, "https://example.com").await;
        let accepted = AcceptedStatus::default();
        let request_id = store
            .register_request(domain_id, "https://example.com/ok", &json!({}), &accepted, None, None)
            .await
            .unwrap();

        store
            .record_response(request_id, 200, &json!({}), Some(b"hello"), &accepted, 0.2)
            .await
            .unwrap();

        let status = store.request_status(request_id).await.unwrap().unwrap();
        assert_eq!(status.status(), RequestStatus::Satisfied);

        let resp = store.get_latest_accepted_response(request_id).await.unwrap().unwrap();
        assert_eq!(resp.decompressed_content().unwrap().unwrap(), b"hello");
    }

    #[tokio::test]
    async fn a_later_failure_regresses_request_status_from_satisfied() {
        let store = memory_store().await;
        let domain_id = register_domain_defaults(&store, "https://example.com").await;
        let accepted = AcceptedStatus::default();
        let request_id = store
            .register_request(domain_id, "https://example.com/ok", &json!({}), &accepted, None, None)
            .await
            .unwrap();

        store
            .record_response(request_id, 200, &json!({}), None, &accepted, 0.1)
            .await
            .unwrap();
        let status = store.request_status(request_id).await.unwrap().unwrap();
        assert_eq!(status.status(), RequestStatus::Satisfied);

        store
            .record_response(request_id, 500, &json!({}), None, &accepted, 0.1)
            .await
            .unwrap();

        // RequestStatus is recomputed unconditionally on every insertion
        // (spec.md invariant 4) — there is no "satisfied is terminal" rule.
        let status = store.request_status(request_id).await.unwrap().unwrap();
        assert_eq!(status.status(), RequestStatus::Failed);
    }

    #[tokio::test]
    async fn latest_accepted_response_ignores_a_later_failure() {
        let store = memory_store().await;
        let domain_id = register_domain_defaults(&store, "https://example.com").await;
        let accepted = AcceptedStatus::default();
        let request_id = store
            .register_request(domain_id, "https://example.com/ok", &json!({}), &accepted, None, None)
            .await
            .unwrap();

        store.record_response(request_id, 500, &json!({}), None, &accepted, 0.1).await.unwrap();
        store.record_response(request_id, 200, &json!({}), Some(b"ok"), &accepted, 0.1).await.unwrap();
        store.record_response(request_id, 500, &json!({}), None, &accepted, 0.1).await.unwrap();

        let resp = store.get_latest_accepted_response(request_id).await.unwrap().unwrap();
        assert_eq!(resp.status_code, 200);

        // spec.md scenario 4's actual point: RequestStatus tracks the latest
        // response's own classification (FAILED, since the last response was
        // a 500), even though get_latest_accepted_response still resolves to
        // the earlier 200 — "satisfied" and "latest overall" are different
        // questions answered by different tables.
        let status = store.request_status(request_id).await.unwrap().unwrap();
        assert_eq!(status.status(), RequestStatus::Failed);
    }

    #[tokio::test]
    async fn domain_retry_blocks_requests_sharing_the_failed_header_pair() {
        let store = memory_store().await;
        let domain_id = store
            .register_domain(
                "https://example.com",
                None,
                None,
                None,
                3,
                0.0,
                0.0,
                false,
                false,
                false,
                None,
                Some(900),
            )
            .await
            .unwrap();
        let header = json!({"accept": "text/html"});
        let accepted = AcceptedStatus::default();

        let failing = store
            .register_request(domain_id, "https://example.com/a", &header, &accepted, None, None)
            .await
            .unwrap();
        store.record_response(failing, 504, &json!({}), None, &accepted, 0.1).await.unwrap();

        // A brand new request sharing the same (domain, header) pair is
        // still blocked by the pair's retry clock even though it has never
        // itself been attempted.
        let now = Utc::now();
        let sibling = store
            .register_request(
                domain_id,
                "https://example.com/b",
                &header,
                &accepted,
                Some(now - chrono::Duration::seconds(1)),
                Some(now + chrono::Duration::seconds(1)),
            )
            .await
            .unwrap();
        assert_ne!(failing, sibling);

        let pending = store.pending_requests_for_domain(domain_id).await.unwrap();
        assert!(pending.iter().all(|r| r.id != sibling));

        let failed = store.failed_requests_for_domain(domain_id).await.unwrap();
        assert!(failed.is_empty(), "retry clock hasn't elapsed yet");
    }

    #[tokio::test]
    async fn fill_missing_request_statuses_is_idempotent() {
        let store = memory_store().await;
        let domain_id = register_domain_defaults(&store, "https://example.com").await;
        let url_id = sqlx::query("INSERT INTO url (domain_id, path, query, path_hash, query_hash) VALUES (?1, '/orphan', '', 'p', 'q')")
            .bind(domain_id)
            .execute(&store.pool)
            .await
            .unwrap()
            .last_insert_rowid();
        let header_id = sqlx::query("INSERT INTO header (json, hash) VALUES ('{}', 'h')")
            .execute(&store.pool)
            .await
            .unwrap()
            .last_insert_rowid();
        sqlx::query("INSERT INTO request (url_id, header_id, domain_id, accepted_status, date, created_at) VALUES (?1, ?2, ?3, '200', ?4, ?4)")
            .bind(url_id)
            .bind(header_id)
            .bind(domain_id)
            .bind(Utc::now())
            .execute(&store.pool)
            .await
            .unwrap();

        let repaired = store.fill_missing_request_statuses().await.unwrap();
        assert_eq!(repaired, 1);
        let repaired_again = store.fill_missing_request_statuses().await.unwrap();
        assert_eq!(repaired_again, 0);
    }

    #[tokio::test]
    async fn proxies_sort_ascending_with_unknown_last() {
        let store = memory_store().await;
        store.upsert_proxy("10.0.0.1:8080", "http", Some(0.5)).await.unwrap();
        store.upsert_proxy("10.0.0.2:8080", "http", None).await.unwrap();
        store.upsert_proxy("10.0.0.3:8080", "http", Some(0.1)).await.unwrap();

        let proxies = store.proxies_for_protocol("http").await.unwrap();
        let addrs: Vec<&str> = proxies.iter().map(|p| p.address.as_str()).collect();
        assert_eq!(addrs, vec!["10.0.0.3:8080", "10.0.0.1:8080", "10.0.0.2:8080"]);
    }
}
