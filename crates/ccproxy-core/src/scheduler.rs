use crate::account::Account;
use crate::error::{ProxyError, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Load view the scheduler consumes; the concurrency manager provides
/// it. Injected as a capability so neither side references the other.
pub trait LoadReader: Send + Sync {
    /// `current + waiting` for the account's slot.
    fn load(&self, account_id: &str) -> usize;
}

impl LoadReader for crate::concurrency::ConcurrencyManager {
    fn load(&self, account_id: &str) -> usize {
        self.account_load(account_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    LeastLoaded,
    RoundRobin,
    Random,
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "least_loaded" => Ok(Strategy::LeastLoaded),
            "round_robin" => Ok(Strategy::RoundRobin),
            "random" => Ok(Strategy::Random),
            other => Err(format!("unknown scheduler strategy: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub strategy: Strategy,
    pub sticky_ttl: Duration,
    /// A sticky hit only rewrites its expiry when less than this much
    /// lifetime remains, keeping the hot path read-mostly.
    pub renewal_threshold: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::LeastLoaded,
            sticky_ttl: Duration::hours(1),
            renewal_threshold: Duration::minutes(5),
        }
    }
}

#[derive(Debug, Clone)]
struct StickyBinding {
    account_id: String,
    #[allow(dead_code)] // Reserved for admin/introspection surface
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub account_id: String,
    pub from_sticky: bool,
    pub load_score: usize,
}

/// Picks one account per request: sticky-session cache first, then the
/// configured strategy. Owns the binding table; bindings die by expiry,
/// by rebind when their account leaves the candidate set, or in the
/// periodic sweep.
pub struct Scheduler {
    cfg: SchedulerConfig,
    loads: Arc<dyn LoadReader>,
    bindings: RwLock<HashMap<String, StickyBinding>>,
    round_robin: AtomicU64,
}

impl Scheduler {
    pub fn new(cfg: SchedulerConfig, loads: Arc<dyn LoadReader>) -> Self {
        Self {
            cfg,
            loads,
            bindings: RwLock::new(HashMap::new()),
            round_robin: AtomicU64::new(0),
        }
    }

    /// `candidates` have already passed the schedulability filter;
    /// `excluded` holds accounts switched away from in this request.
    pub fn select(
        &self,
        candidates: &[Account],
        session_hash: Option<&str>,
        excluded: &HashSet<String>,
    ) -> Result<Selection> {
        let now = Utc::now();
        let available: Vec<&Account> = candidates
            .iter()
            .filter(|a| !excluded.contains(&a.id))
            .collect();

        if available.is_empty() {
            return Err(ProxyError::NoAvailableAccounts);
        }

        if let Some(hash) = session_hash {
            if let Some(account_id) = self.sticky_lookup(hash, &available, now) {
                debug!(session_hash = %hash, account_id = %account_id, "Using sticky session account");
                return Ok(Selection {
                    load_score: self.loads.load(&account_id),
                    account_id,
                    from_sticky: true,
                });
            }
        }

        let chosen = match self.cfg.strategy {
            Strategy::LeastLoaded => self.pick_least_loaded(&available),
            Strategy::RoundRobin => {
                let n = self.round_robin.fetch_add(1, Ordering::Relaxed);
                available[(n % available.len() as u64) as usize]
            }
            Strategy::Random => {
                available[rand::thread_rng().gen_range(0..available.len())]
            }
        };

        if let Some(hash) = session_hash {
            self.bind(hash, &chosen.id, now);
            debug!(session_hash = %hash, account_id = %chosen.id, "Created sticky session");
        }

        let load_score = self.loads.load(&chosen.id);
        info!(
            account_id = %chosen.id,
            account_name = %chosen.name,
            priority = chosen.priority,
            load_score = load_score,
            "Selected account for request"
        );

        Ok(Selection {
            account_id: chosen.id.clone(),
            from_sticky: false,
            load_score,
        })
    }

    fn pick_least_loaded<'a>(&self, available: &[&'a Account]) -> &'a Account {
        let mut best = available[0];
        let mut best_load = self.loads.load(&best.id);

        for account in &available[1..] {
            let load = self.loads.load(&account.id);
            let better = load < best_load
                || (load == best_load
                    && (account.priority < best.priority
                        || (account.priority == best.priority
                            && older(account.last_used_at, best.last_used_at))));
            if better {
                best = account;
                best_load = load;
            }
        }
        best
    }

    fn sticky_lookup(
        &self,
        hash: &str,
        available: &[&Account],
        now: DateTime<Utc>,
    ) -> Option<String> {
        let (account_id, expires_at) = {
            let bindings = self.bindings.read();
            let binding = bindings.get(hash)?;
            (binding.account_id.clone(), binding.expires_at)
        };

        if now >= expires_at {
            self.bindings.write().remove(hash);
            return None;
        }

        // A binding whose account fell out of the candidate set is
        // bypassed; the strategy pick below overwrites it.
        if !available.iter().any(|a| a.id == account_id) {
            return None;
        }

        if expires_at - now < self.cfg.renewal_threshold {
            if let Some(binding) = self.bindings.write().get_mut(hash) {
                binding.expires_at = now + self.cfg.sticky_ttl;
            }
        }

        Some(account_id)
    }

    fn bind(&self, hash: &str, account_id: &str, now: DateTime<Utc>) {
        self.bindings.write().insert(
            hash.to_string(),
            StickyBinding {
                account_id: account_id.to_string(),
                created_at: now,
                expires_at: now + self.cfg.sticky_ttl,
            },
        );
    }

    /// Drops expired bindings. Expiry is also enforced lazily on read;
    /// this bounds table growth for hashes never looked up again.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut bindings = self.bindings.write();
        let before = bindings.len();
        bindings.retain(|_, binding| now < binding.expires_at);
        let removed = before - bindings.len();
        if removed > 0 {
            debug!(removed = removed, "Swept expired sticky bindings");
        }
        removed
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.read().len()
    }
}

fn older(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> bool {
    match (a, b) {
        (None, Some(_)) => true,
        (Some(_), None) => false,
        (Some(a), Some(b)) => a < b,
        (None, None) => false,
    }
}
