use crate::backoff::backoff_delay;
use crate::error::{ProxyError, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct ConcurrencyConfig {
    /// In-flight cap per user.
    pub user_max: usize,
    /// In-flight cap per account, unless the account carries its own.
    pub account_max: usize,
    /// Waiters allowed per slot before fail-fast.
    pub max_wait_queue: usize,
    /// Upper bound on any one wait, regardless of caller deadline.
    pub wait_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub backoff_jitter: f64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            user_max: 10,
            account_max: 5,
            max_wait_queue: 20,
            wait_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(2),
            backoff_jitter: 0.5,
        }
    }
}

/// Counters are atomics so load reads never touch the admit lock; the
/// lock only serializes the check-and-increment on admission.
#[derive(Debug)]
struct Slot {
    max: usize,
    admit: Mutex<()>,
    current: AtomicUsize,
    waiting: AtomicUsize,
    total_served: AtomicU64,
    notify: Notify,
}

impl Slot {
    fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            admit: Mutex::new(()),
            current: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
            total_served: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    fn load(&self) -> usize {
        self.current.load(Ordering::SeqCst) + self.waiting.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SlotStats {
    pub current: usize,
    pub max: usize,
    pub waiting: usize,
    pub total_served: u64,
}

/// Releases the slot on drop, including drops caused by caller
/// cancellation mid-stream.
#[derive(Debug)]
pub struct SlotGuard {
    slot: Arc<Slot>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.slot.current.fetch_sub(1, Ordering::SeqCst);
        self.slot.notify.notify_one();
    }
}

/// Removes a cancelled waiter from the queue accounting.
struct WaitRegistration {
    slot: Arc<Slot>,
    armed: bool,
}

impl WaitRegistration {
    fn disarm(&mut self) {
        if self.armed {
            self.slot.waiting.fetch_sub(1, Ordering::SeqCst);
            self.armed = false;
        }
    }
}

impl Drop for WaitRegistration {
    fn drop(&mut self) {
        self.disarm();
    }
}

/// Two counting-semaphore families, keyed by user id and account id.
/// Slots are created lazily on first reference and kept for the process
/// lifetime; memory is bounded by the number of distinct ids.
pub struct ConcurrencyManager {
    cfg: ConcurrencyConfig,
    users: DashMap<String, Arc<Slot>>,
    accounts: DashMap<String, Arc<Slot>>,
}

impl ConcurrencyManager {
    pub fn new(cfg: ConcurrencyConfig) -> Self {
        Self {
            cfg,
            users: DashMap::new(),
            accounts: DashMap::new(),
        }
    }

    pub async fn acquire_user(
        &self,
        user_id: &str,
        deadline: Option<Duration>,
    ) -> Result<SlotGuard> {
        let slot = self.slot_for(&self.users, user_id, self.cfg.user_max);
        self.acquire(slot, deadline).await
    }

    /// `max_override` carries the account's own `max_concurrency`; zero
    /// falls back to the configured account default.
    pub async fn acquire_account(
        &self,
        account_id: &str,
        max_override: u32,
        deadline: Option<Duration>,
    ) -> Result<SlotGuard> {
        let max = if max_override > 0 {
            max_override as usize
        } else {
            self.cfg.account_max
        };
        let slot = self.slot_for(&self.accounts, account_id, max);
        self.acquire(slot, deadline).await
    }

    /// `current + waiting` for the scheduler's least-loaded strategy.
    /// Lock-free; an id never seen counts as idle.
    pub fn account_load(&self, account_id: &str) -> usize {
        self.accounts
            .get(account_id)
            .map(|slot| slot.load())
            .unwrap_or(0)
    }

    pub fn user_load(&self, user_id: &str) -> usize {
        self.users.get(user_id).map(|slot| slot.load()).unwrap_or(0)
    }

    pub fn account_stats(&self, account_id: &str) -> Option<SlotStats> {
        self.accounts.get(account_id).map(|slot| SlotStats {
            current: slot.current.load(Ordering::SeqCst),
            max: slot.max,
            waiting: slot.waiting.load(Ordering::SeqCst),
            total_served: slot.total_served.load(Ordering::SeqCst),
        })
    }

    /// Wakes every waiter in both families. Called once at shutdown so
    /// parked tasks recheck their predicate and drain via timeout.
    pub fn shutdown(&self) {
        for slot in self.users.iter() {
            slot.notify.notify_waiters();
        }
        for slot in self.accounts.iter() {
            slot.notify.notify_waiters();
        }
    }

    fn slot_for(&self, map: &DashMap<String, Arc<Slot>>, id: &str, max: usize) -> Arc<Slot> {
        if let Some(slot) = map.get(id) {
            return slot.clone();
        }
        map.entry(id.to_string())
            .or_insert_with(|| Arc::new(Slot::new(max)))
            .clone()
    }

    async fn acquire(&self, slot: Arc<Slot>, deadline: Option<Duration>) -> Result<SlotGuard> {
        {
            let _admit = slot.admit.lock();
            if slot.current.load(Ordering::SeqCst) < slot.max {
                slot.current.fetch_add(1, Ordering::SeqCst);
                slot.total_served.fetch_add(1, Ordering::SeqCst);
                drop(_admit);
                return Ok(SlotGuard { slot });
            }
            if slot.waiting.load(Ordering::SeqCst) >= self.cfg.max_wait_queue {
                return Err(ProxyError::QueueFull);
            }
            slot.waiting.fetch_add(1, Ordering::SeqCst);
        }

        let mut registration = WaitRegistration {
            slot: slot.clone(),
            armed: true,
        };

        let wait_cap = deadline.map_or(self.cfg.wait_timeout, |d| d.min(self.cfg.wait_timeout));
        let deadline_at = Instant::now() + wait_cap;
        let mut attempt: u32 = 2;

        loop {
            let remaining = deadline_at.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                registration.disarm();
                return Err(ProxyError::QueueTimeout);
            }

            // Woken by Release, or by the backoff timer; either way the
            // predicate is rechecked, so a consumed wakeup is never
            // lost correctness, only latency bounded by the backoff cap.
            let nap = backoff_delay(
                attempt,
                self.cfg.backoff_base,
                self.cfg.backoff_max,
                self.cfg.backoff_jitter,
            )
            .min(remaining);

            tokio::select! {
                _ = slot.notify.notified() => {}
                _ = tokio::time::sleep(nap) => {}
            }

            {
                let _admit = slot.admit.lock();
                if slot.current.load(Ordering::SeqCst) < slot.max {
                    slot.current.fetch_add(1, Ordering::SeqCst);
                    slot.total_served.fetch_add(1, Ordering::SeqCst);
                    registration.disarm();
                    return Ok(SlotGuard { slot: slot.clone() });
                }
            }

            attempt = attempt.saturating_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(cfg: ConcurrencyConfig) -> Arc<ConcurrencyManager> {
        Arc::new(ConcurrencyManager::new(cfg))
    }

    fn small_cfg() -> ConcurrencyConfig {
        ConcurrencyConfig {
            user_max: 1,
            account_max: 2,
            max_wait_queue: 4,
            wait_timeout: Duration::from_millis(200),
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(40),
            backoff_jitter: 0.0,
        }
    }

    #[tokio::test]
    async fn acquire_and_release_track_counts() {
        let m = manager(small_cfg());

        let guard = m.acquire_account("a1", 0, None).await.unwrap();
        assert_eq!(m.account_load("a1"), 1);

        let stats = m.account_stats("a1").unwrap();
        assert_eq!(stats.current, 1);
        assert_eq!(stats.total_served, 1);

        drop(guard);
        assert_eq!(m.account_load("a1"), 0);
    }

    #[tokio::test]
    async fn unknown_ids_report_zero_load() {
        let m = manager(small_cfg());
        assert_eq!(m.account_load("never-seen"), 0);
        assert_eq!(m.user_load("never-seen"), 0);
    }

    #[tokio::test]
    async fn account_override_caps_beat_the_default() {
        let m = manager(small_cfg());

        let _g1 = m.acquire_account("big", 3, None).await.unwrap();
        let _g2 = m.acquire_account("big", 3, None).await.unwrap();
        let _g3 = m.acquire_account("big", 3, None).await.unwrap();
        // Fourth must wait; cap is 3, not the config default of 2.
        let err = m
            .acquire_account("big", 3, Some(Duration::from_millis(30)))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::QueueTimeout));
    }

    #[tokio::test]
    async fn full_queue_fails_fast() {
        let cfg = ConcurrencyConfig {
            max_wait_queue: 0,
            ..small_cfg()
        };
        let m = manager(cfg);

        let _held = m.acquire_user("u1", None).await.unwrap();
        let err = m.acquire_user("u1", None).await.unwrap_err();
        assert!(matches!(err, ProxyError::QueueFull));
    }

    #[tokio::test]
    async fn waiter_times_out_and_leaves_the_queue() {
        let m = manager(small_cfg());

        let _held = m.acquire_user("u1", None).await.unwrap();
        let start = Instant::now();
        let err = m
            .acquire_user("u1", Some(Duration::from_millis(50)))
            .await
            .unwrap_err();

        assert!(matches!(err, ProxyError::QueueTimeout));
        assert!(start.elapsed() >= Duration::from_millis(45));
        assert_eq!(m.user_load("u1"), 1, "timed-out waiter must deregister");
    }

    #[tokio::test]
    async fn release_wakes_a_waiter() {
        let m = manager(small_cfg());

        let held = m.acquire_user("u1", None).await.unwrap();
        let m2 = m.clone();
        let waiter = tokio::spawn(async move {
            m2.acquire_user("u1", Some(Duration::from_millis(150))).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        let guard = waiter.await.unwrap();
        assert!(guard.is_ok());
    }

    #[tokio::test]
    async fn cancelled_waiter_deregisters() {
        let m = manager(small_cfg());

        let _held = m.acquire_user("u1", None).await.unwrap();

        let m2 = m.clone();
        let waiter = tokio::spawn(async move {
            m2.acquire_user("u1", Some(Duration::from_millis(500))).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(m.user_load("u1"), 2);

        waiter.abort();
        let _ = waiter.await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(m.user_load("u1"), 1);
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_max() {
        let cfg = ConcurrencyConfig {
            account_max: 3,
            max_wait_queue: 32,
            wait_timeout: Duration::from_secs(5),
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_millis(20),
            backoff_jitter: 0.5,
            ..ConcurrencyConfig::default()
        };
        let m = manager(cfg);

        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();

        for _ in 0..20 {
            let m = m.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = m.acquire_account("a1", 0, None).await.unwrap();
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(m.account_stats("a1").unwrap().total_served, 20);
        assert_eq!(m.account_load("a1"), 0);
    }
}
