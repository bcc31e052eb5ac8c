use crate::account::{Account, AccountKind, OAuthTokens};
use crate::backoff::backoff_delay;
use crate::classifier::{classify, Disposition};
use crate::error::{ProxyError, Result};
use crate::scheduler::Selection;
use crate::store::{AccountAction, AccountStore};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// External OAuth collaborator. Only the refresh half of the flow is
/// visible to the core; the bootstrap dance lives elsewhere.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, account: &Account) -> Result<OAuthTokens>;
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Same-account attempts per selection.
    pub max_attempts: u32,
    /// Accounts tried per request before giving up.
    pub max_account_switches: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_account_switches: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            jitter: 0.5,
        }
    }
}

#[derive(Debug)]
pub struct Execution<T> {
    pub value: T,
    pub account_id: String,
    pub attempts: u32,
    pub switches: u32,
    pub elapsed: Duration,
}

/// Runs one upstream operation with same-account retries inside an
/// account-switching loop. The classifier decides which loop advances;
/// its account mutation is applied exactly once per upstream response.
pub struct RetryExecutor {
    cfg: RetryConfig,
    store: Arc<dyn AccountStore>,
    refresher: Option<Arc<dyn TokenRefresher>>,
}

impl RetryExecutor {
    pub fn new(
        cfg: RetryConfig,
        store: Arc<dyn AccountStore>,
        refresher: Option<Arc<dyn TokenRefresher>>,
    ) -> Self {
        Self {
            cfg,
            store,
            refresher,
        }
    }

    pub async fn execute<T, Sel, SelFut, Op, OpFut>(
        &self,
        mut select: Sel,
        mut op: Op,
    ) -> Result<Execution<T>>
    where
        Sel: FnMut(HashSet<String>) -> SelFut,
        SelFut: Future<Output = Result<Selection>>,
        Op: FnMut(Account) -> OpFut,
        OpFut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut excluded: HashSet<String> = HashSet::new();
        let mut total_attempts: u32 = 0;
        let mut last_error: Option<ProxyError> = None;

        for switches in 0..self.cfg.max_account_switches {
            let selection = match select(excluded.clone()).await {
                Ok(s) => s,
                Err(e) => return Err(last_error.unwrap_or(e)),
            };

            let mut account = self
                .store
                .get(&selection.account_id)
                .await?
                .ok_or_else(|| {
                    ProxyError::Internal(format!(
                        "selected account {} vanished from the store",
                        selection.account_id
                    ))
                })?;

            if switches > 0 {
                info!(
                    account_id = %account.id,
                    switches = switches,
                    "Retrying with different account"
                );
            }

            let mut refreshed = false;
            let mut attempt: u32 = 0;

            let failure = loop {
                attempt += 1;
                total_attempts += 1;

                if attempt >= 2 {
                    let delay = backoff_delay(
                        attempt,
                        self.cfg.initial_backoff,
                        self.cfg.max_backoff,
                        self.cfg.jitter,
                    );
                    tokio::time::sleep(delay).await;
                }

                let error = match op(account.clone()).await {
                    Ok(value) => {
                        if let Err(e) = self.store.apply(&account.id, AccountAction::MarkSuccess).await
                        {
                            warn!(account_id = %account.id, error = %e, "Failed to record success");
                        }
                        return Ok(Execution {
                            value,
                            account_id: account.id,
                            attempts: total_attempts,
                            switches,
                            elapsed: started.elapsed(),
                        });
                    }
                    Err(e) => e,
                };

                // One in-line refresh per account on 401/403 before the
                // classifier gets to park it; a refreshed account earns
                // exactly one more attempt.
                if matches!(error, ProxyError::UpstreamAuth { .. })
                    && matches!(account.kind, AccountKind::Oauth { .. })
                    && !refreshed
                {
                    refreshed = true;
                    if let Some(refresher) = &self.refresher {
                        match refresher.refresh(&account).await {
                            Ok(tokens) => {
                                self.store.update_oauth_tokens(&account.id, tokens).await?;
                                if let Some(fresh) = self.store.get(&account.id).await? {
                                    account = fresh;
                                }
                                info!(
                                    account_id = %account.id,
                                    "Refreshed OAuth token after upstream auth error"
                                );
                                continue;
                            }
                            Err(refresh_error) => {
                                warn!(
                                    account_id = %account.id,
                                    error = %refresh_error,
                                    "OAuth refresh failed, parking account"
                                );
                            }
                        }
                    }
                }

                let classification = classify(&error, Utc::now());
                if let Some(action) = classification.action {
                    if let Err(store_error) = self.store.apply(&account.id, action).await {
                        warn!(
                            account_id = %account.id,
                            error = %store_error,
                            "Failed to apply classifier action"
                        );
                    }
                }

                match classification.disposition {
                    Disposition::RetrySameAccount if attempt < self.cfg.max_attempts => {
                        warn!(
                            account_id = %account.id,
                            attempt = attempt,
                            error = %error,
                            "Attempt failed, retrying on same account"
                        );
                        continue;
                    }
                    Disposition::FatalRequest => return Err(error),
                    _ => break error,
                }
            };

            warn!(
                account_id = %account.id,
                error = %failure,
                "Account failed, switching"
            );
            excluded.insert(account.id);
            last_error = Some(failure);
        }

        Err(last_error.unwrap_or(ProxyError::NoAvailableAccounts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AccountStatus;
    use crate::scheduler::{LoadReader, Scheduler, SchedulerConfig};
    use crate::store::MemoryAccountStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct IdleLoads;

    impl LoadReader for IdleLoads {
        fn load(&self, _account_id: &str) -> usize {
            0
        }
    }

    fn oauth_account(id: &str, priority: i32) -> Account {
        let mut a = Account::new(
            id,
            id,
            AccountKind::Oauth {
                access_token: "at".to_string(),
                refresh_token: "rt".to_string(),
            },
        );
        a.priority = priority;
        a
    }

    fn api_account(id: &str, priority: i32) -> Account {
        let mut a = Account::new(
            id,
            id,
            AccountKind::ApiKey {
                key: "sk".to_string(),
            },
        );
        a.priority = priority;
        a
    }

    fn fast_cfg() -> RetryConfig {
        RetryConfig {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            jitter: 0.0,
            ..RetryConfig::default()
        }
    }

    fn fixture(
        accounts: Vec<Account>,
        refresher: Option<Arc<dyn TokenRefresher>>,
    ) -> (Arc<MemoryAccountStore>, Arc<Scheduler>, RetryExecutor) {
        let store = Arc::new(MemoryAccountStore::new(accounts));
        let scheduler = Arc::new(Scheduler::new(
            SchedulerConfig::default(),
            Arc::new(IdleLoads),
        ));
        let executor = RetryExecutor::new(fast_cfg(), store.clone(), refresher);
        (store, scheduler, executor)
    }

    async fn run<T, Op, OpFut>(
        executor: &RetryExecutor,
        store: &Arc<MemoryAccountStore>,
        scheduler: &Arc<Scheduler>,
        op: Op,
    ) -> Result<Execution<T>>
    where
        Op: FnMut(Account) -> OpFut,
        OpFut: Future<Output = Result<T>>,
    {
        let store = store.clone();
        let scheduler = scheduler.clone();
        executor
            .execute(
                move |excluded| {
                    let store = store.clone();
                    let scheduler = scheduler.clone();
                    async move {
                        let now = Utc::now();
                        let candidates: Vec<Account> = store
                            .list_accounts()
                            .await?
                            .into_iter()
                            .filter(|a| a.is_schedulable(now))
                            .collect();
                        scheduler.select(&candidates, None, &excluded)
                    }
                },
                op,
            )
            .await
    }

    async fn network_error() -> ProxyError {
        // A URL with no host fails inside reqwest without touching the
        // network, which is all the classifier needs.
        ProxyError::Network(
            reqwest::Client::new()
                .get("http://")
                .send()
                .await
                .unwrap_err(),
        )
    }

    #[tokio::test]
    async fn first_attempt_success_records_and_returns() {
        let (store, scheduler, executor) = fixture(vec![api_account("a", 10)], None);

        let result = run(&executor, &store, &scheduler, |account| async move {
            Ok::<_, ProxyError>(account.id)
        })
        .await
        .unwrap();

        assert_eq!(result.value, "a");
        assert_eq!(result.attempts, 1);
        assert_eq!(result.switches, 0);

        let a = store.get("a").await.unwrap().unwrap();
        assert_eq!(a.success_count, 1);
        assert!(a.last_used_at.is_some());
    }

    #[tokio::test]
    async fn network_errors_retry_same_account_then_switch() {
        let (store, scheduler, executor) =
            fixture(vec![api_account("a", 10), api_account("b", 20)], None);

        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result = run(&executor, &store, &scheduler, move |account| {
            let calls = calls2.clone();
            async move {
                if account.id == "a" {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(network_error().await)
                } else {
                    Ok(account.id)
                }
            }
        })
        .await
        .unwrap();

        // Three inner attempts on "a" (the inner loop defends against
        // network faults), then failover to "b".
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.value, "b");
        assert_eq!(result.switches, 1);
        assert_eq!(result.attempts, 4);

        // Network faults never withdraw an account.
        let a = store.get("a").await.unwrap().unwrap();
        assert!(a.is_schedulable(Utc::now()));
        assert_eq!(a.error_count, 3);
    }

    #[tokio::test]
    async fn rate_limited_account_is_withdrawn_and_switched() {
        let (store, scheduler, executor) =
            fixture(vec![api_account("a", 10), api_account("b", 20)], None);

        let result = run(&executor, &store, &scheduler, |account| async move {
            if account.id == "a" {
                Err(ProxyError::from_upstream(429, Some(30), "limited"))
            } else {
                Ok(account.id)
            }
        })
        .await
        .unwrap();

        assert_eq!(result.value, "b");

        let a = store.get("a").await.unwrap().unwrap();
        assert!(!a.is_schedulable(Utc::now()));
        assert!(a.is_schedulable(Utc::now() + chrono::Duration::seconds(31)));
    }

    #[tokio::test]
    async fn client_errors_are_fatal_without_switching() {
        let (store, scheduler, executor) =
            fixture(vec![api_account("a", 10), api_account("b", 20)], None);

        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let err = run::<String, _, _>(&executor, &store, &scheduler, move |_account| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProxyError::from_upstream(400, None, "bad request"))
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, ProxyError::UpstreamClient { status: 400, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let b = store.get("b").await.unwrap().unwrap();
        assert_eq!(b.error_count, 0);
    }

    #[tokio::test]
    async fn auth_error_on_api_key_account_parks_it() {
        let (store, scheduler, executor) =
            fixture(vec![api_account("a", 10), api_account("b", 20)], None);

        let result = run(&executor, &store, &scheduler, |account| async move {
            if account.id == "a" {
                Err(ProxyError::from_upstream(401, None, "bad key"))
            } else {
                Ok(account.id)
            }
        })
        .await
        .unwrap();

        assert_eq!(result.value, "b");
        let a = store.get("a").await.unwrap().unwrap();
        assert_eq!(a.status, AccountStatus::Error);
        assert!(!a.schedulable);
    }

    struct GoodRefresher;

    #[async_trait]
    impl TokenRefresher for GoodRefresher {
        async fn refresh(&self, _account: &Account) -> Result<OAuthTokens> {
            Ok(OAuthTokens {
                access_token: "fresh-at".to_string(),
                refresh_token: None,
                expires_at: Utc::now() + chrono::Duration::hours(8),
            })
        }
    }

    struct FailingRefresher;

    #[async_trait]
    impl TokenRefresher for FailingRefresher {
        async fn refresh(&self, _account: &Account) -> Result<OAuthTokens> {
            Err(ProxyError::Refresh("refresh_token revoked".to_string()))
        }
    }

    #[tokio::test]
    async fn oauth_401_refreshes_once_and_retries_same_account() {
        let (store, scheduler, executor) = fixture(
            vec![oauth_account("a", 10), oauth_account("b", 20)],
            Some(Arc::new(GoodRefresher)),
        );

        let result = run(&executor, &store, &scheduler, |account| async move {
            match &account.kind {
                AccountKind::Oauth { access_token, .. } if access_token == "fresh-at" => {
                    Ok(account.id.clone())
                }
                _ => Err(ProxyError::from_upstream(401, None, "expired token")),
            }
        })
        .await
        .unwrap();

        // Recovered on the original account, no switch.
        assert_eq!(result.value, "a");
        assert_eq!(result.switches, 0);

        let a = store.get("a").await.unwrap().unwrap();
        assert_eq!(a.status, AccountStatus::Active);
        assert!(a.schedulable);
    }

    #[tokio::test]
    async fn failed_refresh_parks_account_and_switches() {
        let (store, scheduler, executor) = fixture(
            vec![oauth_account("a", 10), oauth_account("b", 20)],
            Some(Arc::new(FailingRefresher)),
        );

        let result = run(&executor, &store, &scheduler, |account| async move {
            if account.id == "a" {
                Err(ProxyError::from_upstream(401, None, "expired token"))
            } else {
                Ok(account.id)
            }
        })
        .await
        .unwrap();

        assert_eq!(result.value, "b");
        assert_eq!(result.switches, 1);

        let a = store.get("a").await.unwrap().unwrap();
        assert_eq!(a.status, AccountStatus::Error);
        assert!(!a.schedulable);
    }

    #[tokio::test]
    async fn exhaustion_surfaces_the_last_upstream_error() {
        let (store, scheduler, executor) =
            fixture(vec![api_account("a", 10), api_account("b", 20)], None);

        let err = run::<String, _, _>(&executor, &store, &scheduler, |_account| async move {
            Err(ProxyError::from_upstream(502, None, "bad gateway"))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, ProxyError::UpstreamServer { status: 502, .. }));

        // Both accounts stay in service.
        for id in ["a", "b"] {
            let account = store.get(id).await.unwrap().unwrap();
            assert!(account.is_schedulable(Utc::now()));
            assert!(account.error_count > 0);
        }
    }
}
