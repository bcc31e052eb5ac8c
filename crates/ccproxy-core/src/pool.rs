use crate::error::{ProxyError, Result};
use parking_lot::Mutex;
use reqwest::Client;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle connections kept per upstream host. hyper pools per host,
    /// so the global idle cap maps onto this knob.
    pub max_idle_conns_per_host: usize,
    pub idle_conn_timeout: Duration,
    /// Cached per-account clients before LRU eviction.
    pub max_clients: usize,
    pub client_idle_ttl: Duration,
    /// End-to-end deadline for one upstream exchange, streaming reads
    /// included.
    pub response_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_conns_per_host: 10,
            idle_conn_timeout: Duration::from_secs(90),
            max_clients: 100,
            client_idle_ttl: Duration::from_secs(30 * 60),
            response_timeout: Duration::from_secs(10 * 60),
        }
    }
}

struct ClientEntry {
    client: Client,
    #[allow(dead_code)] // Reserved for admin/introspection surface
    created_at: Instant,
    last_used_at: Instant,
}

struct PoolInner {
    entries: HashMap<String, ClientEntry>,
    /// Most recently used at the front.
    lru: VecDeque<String>,
}

/// Keyed cache of connection-pooled HTTP clients, one per account id,
/// plus a shared client for unkeyed traffic. The pool owns every
/// transport it hands out; dropping an entry closes its idle
/// connections. It holds no credentials and no sessions.
pub struct ClientPool {
    cfg: PoolConfig,
    shared: Client,
    inner: Mutex<PoolInner>,
}

impl ClientPool {
    pub fn new(cfg: PoolConfig) -> Result<Self> {
        let shared = build_client(&cfg)?;
        Ok(Self {
            cfg,
            shared,
            inner: Mutex::new(PoolInner {
                entries: HashMap::new(),
                lru: VecDeque::new(),
            }),
        })
    }

    /// Client for calls not tied to any account (token refresh, health
    /// probes).
    pub fn shared(&self) -> Client {
        self.shared.clone()
    }

    /// Returns the account's client, creating it on first use. Touches
    /// the LRU position; may evict the coldest entry to stay within
    /// `max_clients`.
    pub fn client_for(&self, account_id: &str) -> Result<Client> {
        let mut inner = self.inner.lock();

        if let Some(entry) = inner.entries.get_mut(account_id) {
            entry.last_used_at = Instant::now();
            let client = entry.client.clone();
            touch_lru(&mut inner.lru, account_id);
            return Ok(client);
        }

        let client = build_client(&self.cfg)?;

        if inner.entries.len() >= self.cfg.max_clients {
            if let Some(coldest) = inner.lru.pop_back() {
                inner.entries.remove(&coldest);
                debug!(account_id = %coldest, "Evicted coldest pooled client");
            }
        }

        let now = Instant::now();
        inner.entries.insert(
            account_id.to_string(),
            ClientEntry {
                client: client.clone(),
                created_at: now,
                last_used_at: now,
            },
        );
        inner.lru.push_front(account_id.to_string());

        Ok(client)
    }

    /// Drops entries idle longer than `client_idle_ttl`.
    pub fn sweep_idle(&self) -> usize {
        let mut inner = self.inner.lock();
        let ttl = self.cfg.client_idle_ttl;
        let now = Instant::now();

        let stale: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_used_at) >= ttl)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            inner.entries.remove(id);
            inner.lru.retain(|key| key != id);
        }

        if !stale.is_empty() {
            debug!(evicted = stale.len(), "Swept idle pooled clients");
        }
        stale.len()
    }

    pub fn contains(&self, account_id: &str) -> bool {
        self.inner.lock().entries.contains_key(account_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every cached client.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.lru.clear();
    }
}

fn touch_lru(lru: &mut VecDeque<String>, account_id: &str) {
    if let Some(pos) = lru.iter().position(|key| key == account_id) {
        lru.remove(pos);
    }
    lru.push_front(account_id.to_string());
}

fn build_client(cfg: &PoolConfig) -> Result<Client> {
    // Proxies come from the environment (reqwest's default behavior);
    // ALPN negotiates HTTP/2 when the upstream offers it.
    Client::builder()
        .pool_max_idle_per_host(cfg.max_idle_conns_per_host)
        .pool_idle_timeout(cfg.idle_conn_timeout)
        .timeout(cfg.response_timeout)
        .min_tls_version(reqwest::tls::Version::TLS_1_2)
        .build()
        .map_err(|e| ProxyError::Config(format!("failed to build HTTP client: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(max_clients: usize, idle_ttl: Duration) -> ClientPool {
        ClientPool::new(PoolConfig {
            max_clients,
            client_idle_ttl: idle_ttl,
            ..PoolConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn clients_are_cached_per_account() {
        let pool = pool(10, Duration::from_secs(60));

        pool.client_for("a1").unwrap();
        pool.client_for("a1").unwrap();
        pool.client_for("b1").unwrap();

        assert_eq!(pool.len(), 2);
        assert!(pool.contains("a1"));
        assert!(pool.contains("b1"));
    }

    #[test]
    fn shared_client_is_not_part_of_the_keyed_cache() {
        let pool = pool(10, Duration::from_secs(60));
        let _shared = pool.shared();
        assert!(pool.is_empty());
    }

    #[test]
    fn coldest_entry_is_evicted_at_capacity() {
        let pool = pool(2, Duration::from_secs(60));

        pool.client_for("a").unwrap();
        pool.client_for("b").unwrap();
        pool.client_for("c").unwrap();

        assert_eq!(pool.len(), 2);
        assert!(!pool.contains("a"), "oldest entry should be evicted");
        assert!(pool.contains("b"));
        assert!(pool.contains("c"));

        // A fresh request for the evicted account rebuilds its client,
        // displacing the now-coldest entry.
        pool.client_for("a").unwrap();
        assert!(pool.contains("a"));
        assert!(!pool.contains("b"));
    }

    #[test]
    fn recent_use_protects_an_entry_from_eviction() {
        let pool = pool(2, Duration::from_secs(60));

        pool.client_for("a").unwrap();
        pool.client_for("b").unwrap();
        // Touch "a" so "b" becomes the tail.
        pool.client_for("a").unwrap();
        pool.client_for("c").unwrap();

        assert!(pool.contains("a"));
        assert!(!pool.contains("b"));
        assert!(pool.contains("c"));
    }

    #[test]
    fn idle_sweep_reclaims_only_stale_entries() {
        let pool = pool(10, Duration::from_millis(30));

        pool.client_for("stale").unwrap();
        std::thread::sleep(Duration::from_millis(40));
        pool.client_for("fresh").unwrap();

        assert_eq!(pool.sweep_idle(), 1);
        assert!(!pool.contains("stale"));
        assert!(pool.contains("fresh"));
    }

    #[test]
    fn close_drops_everything() {
        let pool = pool(10, Duration::from_secs(60));
        pool.client_for("a").unwrap();
        pool.client_for("b").unwrap();

        pool.close();
        assert!(pool.is_empty());
    }
}
