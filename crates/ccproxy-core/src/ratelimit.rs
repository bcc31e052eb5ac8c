use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitRule {
    pub requests: u64,
    pub window: Duration,
}

impl RateLimitRule {
    pub fn new(requests: u64, window: Duration) -> Self {
        Self { requests, window }
    }

    fn is_active(&self) -> bool {
        self.requests > 0 && !self.window.is_zero()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub global: Option<RateLimitRule>,
    pub user: Option<RateLimitRule>,
    pub account: Option<RateLimitRule>,
    pub ip: Option<RateLimitRule>,
}

/// Outcome of a gate check. On denial `reset_at` is the start of the
/// next window and drives the Retry-After header.
#[derive(Debug, Clone)]
pub struct RateDecision {
    pub allowed: bool,
    pub scope: &'static str,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub retry_after: Duration,
}

impl RateDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            scope: "",
            limit: 0,
            remaining: 0,
            reset_at: Utc::now(),
            retry_after: Duration::ZERO,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    count: u64,
    window_id: i64,
}

/// One fixed-window counter family. Fixed windows admit boundary
/// bursts; that tradeoff is accepted for O(1) state per key.
struct WindowFamily {
    scope: &'static str,
    requests: u64,
    window_nanos: i64,
    buckets: DashMap<String, Mutex<Bucket>>,
}

impl WindowFamily {
    fn new(scope: &'static str, rule: RateLimitRule) -> Self {
        Self {
            scope,
            requests: rule.requests,
            window_nanos: rule.window.as_nanos() as i64,
            buckets: DashMap::new(),
        }
    }

    fn hit(&self, key: &str, now_nanos: i64) -> RateDecision {
        let window_id = now_nanos / self.window_nanos;

        let bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(Bucket { count: 0, window_id }));
        let mut bucket = bucket.lock();

        if bucket.window_id != window_id {
            bucket.window_id = window_id;
            bucket.count = 0;
        }

        if bucket.count >= self.requests {
            let reset_nanos = (window_id + 1) * self.window_nanos;
            let reset_at = Utc
                .timestamp_nanos(reset_nanos);
            let retry_after =
                Duration::from_nanos(reset_nanos.saturating_sub(now_nanos).max(0) as u64);
            return RateDecision {
                allowed: false,
                scope: self.scope,
                limit: self.requests,
                remaining: 0,
                reset_at,
                retry_after,
            };
        }

        bucket.count += 1;
        RateDecision {
            allowed: true,
            scope: self.scope,
            limit: self.requests,
            remaining: self.requests - bucket.count,
            reset_at: Utc.timestamp_nanos((window_id + 1) * self.window_nanos),
            retry_after: Duration::ZERO,
        }
    }

    /// Drops buckets two or more windows behind the clock.
    fn sweep(&self, now_nanos: i64) -> usize {
        let window_id = now_nanos / self.window_nanos;
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| window_id - bucket.lock().window_id < 2);
        before - self.buckets.len()
    }
}

/// Four independent fixed-window gates, evaluated
/// global → user → account → ip. A denial stops the chain, so traffic a
/// pre-gate refused is never recorded downstream.
pub struct RateLimiter {
    enabled: bool,
    global: Option<WindowFamily>,
    user: Option<WindowFamily>,
    account: Option<WindowFamily>,
    ip: Option<WindowFamily>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimitConfig) -> Self {
        let family = |scope, rule: Option<RateLimitRule>| {
            rule.filter(RateLimitRule::is_active)
                .map(|r| WindowFamily::new(scope, r))
        };
        Self {
            enabled: cfg.enabled,
            global: family("global", cfg.global),
            user: family("user", cfg.user),
            account: family("account", cfg.account),
            ip: family("ip", cfg.ip),
        }
    }

    pub fn disabled() -> Self {
        Self::new(RateLimitConfig::default())
    }

    pub fn check_all(
        &self,
        user_id: &str,
        account_id: Option<&str>,
        ip: &str,
    ) -> RateDecision {
        if !self.enabled {
            return RateDecision::allow();
        }

        let now_nanos = now_nanos();

        if let Some(global) = &self.global {
            let decision = global.hit("global", now_nanos);
            if !decision.allowed {
                return decision;
            }
        }

        if let Some(user) = &self.user {
            let decision = user.hit(user_id, now_nanos);
            if !decision.allowed {
                return decision;
            }
        }

        if let (Some(account), Some(id)) = (&self.account, account_id) {
            let decision = account.hit(id, now_nanos);
            if !decision.allowed {
                return decision;
            }
        }

        if let Some(ip_family) = &self.ip {
            let decision = ip_family.hit(ip, now_nanos);
            if !decision.allowed {
                return decision;
            }
        }

        RateDecision::allow()
    }

    /// Account gate alone, consulted once the scheduler has picked an
    /// account for a request already admitted by the pre-gates.
    pub fn check_account(&self, account_id: &str) -> RateDecision {
        if !self.enabled {
            return RateDecision::allow();
        }
        match &self.account {
            Some(account) => account.hit(account_id, now_nanos()),
            None => RateDecision::allow(),
        }
    }

    pub fn sweep_stale(&self) -> usize {
        let now_nanos = now_nanos();
        [&self.global, &self.user, &self.account, &self.ip]
            .into_iter()
            .flatten()
            .map(|family| family.sweep(now_nanos))
            .sum()
    }
}

fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}
