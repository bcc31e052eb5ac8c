use crate::account::{Account, AccountKind, AccountStatus, OAuthTokens};
use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

/// The classifier's named state mutations. These are the only writers of
/// the transient account fields; timer writes are monotone
/// (`max(existing, new)`) so replayed classifications cannot shorten a
/// withdrawal.
#[derive(Debug, Clone, PartialEq)]
pub enum AccountAction {
    MarkSuccess,
    RateLimited {
        reset_at: DateTime<Utc>,
    },
    Overloaded {
        until: DateTime<Utc>,
    },
    AuthFailed {
        message: String,
    },
    RecordFailure,
    TempUnschedulable {
        until: DateTime<Utc>,
        reason: String,
    },
}

fn max_instant(existing: Option<DateTime<Utc>>, new: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Some(match existing {
        Some(old) if old > new => old,
        _ => new,
    })
}

/// Applies an action to an account snapshot. Shared by every store
/// implementation so the mutation semantics cannot drift between the
/// in-memory and SQLite backends.
pub fn apply_account_action(account: &mut Account, action: &AccountAction, now: DateTime<Utc>) {
    match action {
        AccountAction::MarkSuccess => {
            account.success_count += 1;
            account.error_count = 0;
            account.last_used_at = Some(now);
        }
        AccountAction::RateLimited { reset_at } => {
            account.rate_limited_at = Some(now);
            account.rate_limit_reset_at = max_instant(account.rate_limit_reset_at, *reset_at);
            account.temp_unschedulable_until =
                max_instant(account.temp_unschedulable_until, *reset_at);
            account.temp_unschedulable_reason = Some("rate_limited".to_string());
        }
        AccountAction::Overloaded { until } => {
            account.overload_until = max_instant(account.overload_until, *until);
        }
        AccountAction::AuthFailed { message } => {
            account.status = AccountStatus::Error;
            account.schedulable = false;
            account.error_message = Some(message.clone());
            account.error_count += 1;
        }
        AccountAction::RecordFailure => {
            account.error_count += 1;
        }
        AccountAction::TempUnschedulable { until, reason } => {
            account.temp_unschedulable_until = max_instant(account.temp_unschedulable_until, *until);
            account.temp_unschedulable_reason = Some(reason.clone());
        }
    }
}

/// Query surface the pipeline consumes. Persistence lives behind this
/// trait; the core holds only account ids between calls.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn list_accounts(&self) -> Result<Vec<Account>>;

    async fn get(&self, id: &str) -> Result<Option<Account>>;

    async fn apply(&self, id: &str, action: AccountAction) -> Result<()>;

    /// Swap access/refresh tokens and expiry in one write, and restore
    /// the account to service if a 401 had parked it.
    async fn update_oauth_tokens(&self, id: &str, tokens: OAuthTokens) -> Result<()>;
}

/// In-process store. Backs tests and config-file-only deployments.
#[derive(Default)]
pub struct MemoryAccountStore {
    accounts: RwLock<HashMap<String, Account>>,
}

impl MemoryAccountStore {
    pub fn new(accounts: Vec<Account>) -> Self {
        Self {
            accounts: RwLock::new(
                accounts
                    .into_iter()
                    .map(|a| (a.id.clone(), a))
                    .collect(),
            ),
        }
    }

    pub fn insert(&self, account: Account) {
        self.accounts.write().insert(account.id.clone(), account);
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn list_accounts(&self) -> Result<Vec<Account>> {
        let mut accounts: Vec<Account> = self.accounts.read().values().cloned().collect();
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(accounts)
    }

    async fn get(&self, id: &str) -> Result<Option<Account>> {
        Ok(self.accounts.read().get(id).cloned())
    }

    async fn apply(&self, id: &str, action: AccountAction) -> Result<()> {
        let mut accounts = self.accounts.write();
        let account = accounts
            .get_mut(id)
            .ok_or_else(|| ProxyError::Store(format!("unknown account: {}", id)))?;
        apply_account_action(account, &action, Utc::now());
        Ok(())
    }

    async fn update_oauth_tokens(&self, id: &str, tokens: OAuthTokens) -> Result<()> {
        let mut accounts = self.accounts.write();
        let account = accounts
            .get_mut(id)
            .ok_or_else(|| ProxyError::Store(format!("unknown account: {}", id)))?;

        match &mut account.kind {
            AccountKind::Oauth {
                access_token,
                refresh_token,
            } => {
                *access_token = tokens.access_token;
                if let Some(rt) = tokens.refresh_token {
                    *refresh_token = rt;
                }
            }
            other => {
                return Err(ProxyError::Store(format!(
                    "account {} is {}, not oauth",
                    id,
                    other.label()
                )))
            }
        }
        account.expires_at = Some(tokens.expires_at);
        account.status = AccountStatus::Active;
        account.schedulable = true;
        account.error_message = None;
        Ok(())
    }
}
