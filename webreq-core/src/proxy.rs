//! Proxy selection with a short freshness window over `webreq_store`'s
//! latency table, so a hot tick doesn't hit the database for every pick.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use webreq_store::{ProxyRecord, Store, StoreError};

const DEFAULT_FRESHNESS_SECS: i64 = 300;

struct CachedList {
    fetched_at: chrono::DateTime<Utc>,
    proxies: Vec<ProxyRecord>,
}

/// Caches each protocol's ascending-latency proxy list for
/// `freshness_secs`, refetching from the Store once it goes stale.
pub struct ProxyPool {
    freshness: Duration,
    cache: Mutex<HashMap<String, CachedList>>,
}

impl ProxyPool {
    pub fn new(freshness_secs: u64) -> Self {
        Self {
            freshness: Duration::from_secs(freshness_secs),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_FRESHNESS_SECS as u64)
    }

    /// Ascending-latency proxies for `protocol`, refreshed from `store` when
    /// the cached list has aged past the freshness window.
    pub async fn proxies_for(&self, store: &Store, protocol: &str) -> Result<Vec<ProxyRecord>, StoreError> {
        let stale = {
            let cache = self.cache.lock().expect("proxy pool lock poisoned");
            match cache.get(protocol) {
                Some(entry) => {
                    let age = Utc::now() - entry.fetched_at;
                    age.to_std().unwrap_or(Duration::MAX) > self.freshness
                }
                None => true,
            }
        };

        if stale {
            let fresh = store.proxies_for_protocol(protocol).await?;
            let mut cache = self.cache.lock().expect("proxy pool lock poisoned");
            cache.insert(
                protocol.to_string(),
                CachedList {
                    fetched_at: Utc::now(),
                    proxies: fresh,
                },
            );
        }

        let cache = self.cache.lock().expect("proxy pool lock poisoned");
        Ok(cache
            .get(protocol)
            .map(|entry| entry.proxies.clone())
            .unwrap_or_default())
    }

    /// Record an observed latency (or `None` on failure) for a proxy,
    /// persisting it and invalidating the cached list for `protocol` so the
    /// next pick sees the updated ordering.
    pub async fn record_latency(
        &self,
        store: &Store,
        address: &str,
        protocol: &str,
        latency_secs: Option<f64>,
    ) -> Result<(), StoreError> {
        store.upsert_proxy(address, protocol, latency_secs).await?;
        let mut cache = self.cache.lock().expect("proxy pool lock poisoned");
        cache.remove(protocol);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn caches_until_freshness_expires() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store.upsert_proxy("10.0.0.1:8080", "http", Some(0.3)).await.unwrap();

        let pool = ProxyPool::new(300);
        let first = pool.proxies_for(&store, "http").await.unwrap();
        assert_eq!(first.len(), 1);

        store.upsert_proxy("10.0.0.2:8080", "http", Some(0.1)).await.unwrap();
        let still_cached = pool.proxies_for(&store, "http").await.unwrap();
        assert_eq!(still_cached.len(), 1, "cache should not have refreshed yet");
    }

    #[tokio::test]
    async fn record_latency_invalidates_cache() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store.upsert_proxy("10.0.0.1:8080", "http", Some(0.3)).await.unwrap();

        let pool = ProxyPool::new(300);
        pool.proxies_for(&store, "http").await.unwrap();
        pool.record_latency(&store, "10.0.0.2:8080", "http", Some(0.1)).await.unwrap();

        let refreshed = pool.proxies_for(&store, "http").await.unwrap();
        assert_eq!(refreshed.len(), 2);
    }
}
