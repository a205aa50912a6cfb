//! Schema bootstrap. Run once against a fresh pool; every statement is
//! `IF NOT EXISTS` so it's safe to call on an already-migrated database.
//!
//! Table shapes mirror the entities of the data model: `domain`, `url`, and
//! `header` are insert-or-reuse natural-key tables; `request` ties a
//! `(url_id, header_id)` pair to a registration date; `response` appends
//! fetch outcomes; `request_status`, `domain_status`, and `domain_retry` are
//! derived tables maintained by `Store`'s write paths rather than SQL
//! triggers (see DESIGN.md for why).

use sqlx::SqlitePool;

pub async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS domain (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            bps_limit REAL,
            max_concurrent INTEGER,
            timeout_secs INTEGER,
            retries INTEGER NOT NULL DEFAULT 3,
            retry_delay_min_secs REAL NOT NULL DEFAULT 1.0,
            retry_delay_max_secs REAL NOT NULL DEFAULT 5.0,
            retry_http INTEGER NOT NULL DEFAULT 0,
            retry_proxies INTEGER NOT NULL DEFAULT 0,
            proxy_default INTEGER NOT NULL DEFAULT 0,
            proxy_regions TEXT,
            retry_interval_secs INTEGER,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS url (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            domain_id INTEGER NOT NULL REFERENCES domain(id),
            path TEXT NOT NULL,
            query TEXT NOT NULL DEFAULT '',
            path_hash TEXT NOT NULL,
            query_hash TEXT NOT NULL,
            UNIQUE(domain_id, path_hash, query_hash)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS header (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            json TEXT NOT NULL,
            hash TEXT NOT NULL UNIQUE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS request (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            url_id INTEGER NOT NULL REFERENCES url(id),
            header_id INTEGER NOT NULL REFERENCES header(id),
            domain_id INTEGER NOT NULL REFERENCES domain(id),
            accepted_status TEXT NOT NULL,
            date TEXT NOT NULL,
            min_date TEXT,
            max_date TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_request_url_header ON request(url_id, header_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS response (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            request_id INTEGER NOT NULL REFERENCES request(id),
            status_code INTEGER NOT NULL,
            header TEXT NOT NULL,
            content BLOB,
            elapsed_secs REAL NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_response_statuscode ON response(status_code)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_response_requestid_created ON response(request_id, created_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS request_status (
            request_id INTEGER PRIMARY KEY REFERENCES request(id),
            status INTEGER NOT NULL DEFAULT 0,
            changed_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_request_status_status ON request_status(status)")
        .execute(pool)
        .await?;

    // Derived per-(domain, header) view: mirrors the latest response's
    // outcome for any request sharing that pair.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS domain_status (
            domain_id INTEGER NOT NULL REFERENCES domain(id),
            header_id INTEGER NOT NULL REFERENCES header(id),
            last_attempt_at TEXT NOT NULL,
            status INTEGER NOT NULL,
            PRIMARY KEY (domain_id, header_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS domain_retry (
            domain_id INTEGER NOT NULL REFERENCES domain(id),
            header_id INTEGER NOT NULL REFERENCES header(id),
            not_before TEXT,
            PRIMARY KEY (domain_id, header_id)
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_domain_retry_not_before ON domain_retry(not_before)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS proxy (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            address TEXT NOT NULL,
            protocol TEXT NOT NULL,
            last_latency_secs REAL,
            last_checked_at TEXT,
            UNIQUE(address, protocol)
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_proxy_protocol_latency ON proxy(protocol, last_latency_secs)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
