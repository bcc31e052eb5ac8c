use async_trait::async_trait;
use ccproxy_core::{
    apply_account_action, Account, AccountAction, AccountKind, AccountStatus, AccountStore,
    OAuthTokens, ProxyError,
};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;
use tracing::info;

pub type DbPool = Pool<Sqlite>;

pub async fn init_database(path: &str) -> Result<DbPool, sqlx::Error> {
    if let Some(parent) = Path::new(path).parent() {
        std::fs::create_dir_all(parent).ok();
    }

    let database_url = format!("sqlite:{}?mode=rwc", path);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            access_token TEXT,
            refresh_token TEXT,
            session_cookie TEXT,
            api_key TEXT,
            organization_id TEXT,
            api_url TEXT,
            expires_at TEXT,
            auto_pause_on_expired INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'active',
            schedulable INTEGER NOT NULL DEFAULT 1,
            rate_limited_at TEXT,
            rate_limit_reset_at TEXT,
            overload_until TEXT,
            temp_unschedulable_until TEXT,
            temp_unschedulable_reason TEXT,
            priority INTEGER NOT NULL DEFAULT 100,
            max_concurrency INTEGER NOT NULL DEFAULT 0,
            last_used_at TEXT,
            error_count INTEGER NOT NULL DEFAULT 0,
            success_count INTEGER NOT NULL DEFAULT 0,
            error_message TEXT
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS usage_stats (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            token_hash TEXT NOT NULL,
            account_id TEXT NOT NULL,
            model TEXT NOT NULL,
            input_tokens INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            cache_creation_tokens INTEGER NOT NULL DEFAULT 0,
            cache_read_tokens INTEGER NOT NULL DEFAULT 0,
            request_count INTEGER NOT NULL DEFAULT 1,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_usage_account_date
        ON usage_stats(account_id, created_at)
        "#,
    )
    .execute(&pool)
    .await?;

    info!(database = %path, "Database initialized");

    Ok(pool)
}

/// Seeds the store from the config file. Credentials and shape fields
/// are overwritten; runtime state (status, timers, counters) is left to
/// the classifier's actions so a restart does not un-park accounts.
pub async fn upsert_account(pool: &DbPool, account: &Account) -> Result<(), sqlx::Error> {
    let (access_token, refresh_token, session_cookie, api_key) = credential_columns(&account.kind);

    sqlx::query(
        r#"
        INSERT INTO accounts (
            id, name, kind, access_token, refresh_token, session_cookie, api_key,
            organization_id, api_url, expires_at, auto_pause_on_expired,
            status, schedulable, priority, max_concurrency
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            kind = excluded.kind,
            access_token = excluded.access_token,
            refresh_token = excluded.refresh_token,
            session_cookie = excluded.session_cookie,
            api_key = excluded.api_key,
            organization_id = excluded.organization_id,
            api_url = excluded.api_url,
            expires_at = excluded.expires_at,
            auto_pause_on_expired = excluded.auto_pause_on_expired,
            priority = excluded.priority,
            max_concurrency = excluded.max_concurrency
        "#,
    )
    .bind(&account.id)
    .bind(&account.name)
    .bind(account.kind.label())
    .bind(access_token)
    .bind(refresh_token)
    .bind(session_cookie)
    .bind(api_key)
    .bind(&account.organization_id)
    .bind(&account.api_url)
    .bind(account.expires_at.map(|t| t.to_rfc3339()))
    .bind(account.auto_pause_on_expired as i64)
    .bind(account.status.to_string())
    .bind(account.schedulable as i64)
    .bind(account.priority as i64)
    .bind(account.max_concurrency as i64)
    .execute(pool)
    .await?;

    Ok(())
}

fn credential_columns(
    kind: &AccountKind,
) -> (Option<&str>, Option<&str>, Option<&str>, Option<&str>) {
    match kind {
        AccountKind::Oauth {
            access_token,
            refresh_token,
        } => (Some(access_token), Some(refresh_token), None, None),
        AccountKind::SessionCookie { cookie } => (None, None, Some(cookie), None),
        AccountKind::ApiKey { key } => (None, None, None, Some(key)),
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AccountRow {
    id: String,
    name: String,
    kind: String,
    access_token: Option<String>,
    refresh_token: Option<String>,
    session_cookie: Option<String>,
    api_key: Option<String>,
    organization_id: Option<String>,
    api_url: Option<String>,
    expires_at: Option<String>,
    auto_pause_on_expired: i64,
    status: String,
    schedulable: i64,
    rate_limited_at: Option<String>,
    rate_limit_reset_at: Option<String>,
    overload_until: Option<String>,
    temp_unschedulable_until: Option<String>,
    temp_unschedulable_reason: Option<String>,
    priority: i64,
    max_concurrency: i64,
    last_used_at: Option<String>,
    error_count: i64,
    success_count: i64,
    error_message: Option<String>,
}

fn parse_instant(value: Option<String>) -> Result<Option<DateTime<Utc>>, ProxyError> {
    value
        .map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| ProxyError::Store(format!("bad timestamp '{}': {}", raw, e)))
        })
        .transpose()
}

impl AccountRow {
    fn into_account(self) -> Result<Account, ProxyError> {
        let kind = match self.kind.as_str() {
            "oauth" => AccountKind::Oauth {
                access_token: self.access_token.unwrap_or_default(),
                refresh_token: self.refresh_token.unwrap_or_default(),
            },
            "session_cookie" => AccountKind::SessionCookie {
                cookie: self.session_cookie.unwrap_or_default(),
            },
            "api_key" => AccountKind::ApiKey {
                key: self.api_key.unwrap_or_default(),
            },
            other => {
                return Err(ProxyError::Store(format!(
                    "unknown account kind in store: {}",
                    other
                )))
            }
        };

        let status: AccountStatus = self
            .status
            .parse()
            .map_err(ProxyError::Store)?;

        let mut account = Account::new(self.id, self.name, kind);
        account.organization_id = self.organization_id;
        account.api_url = self.api_url;
        account.expires_at = parse_instant(self.expires_at)?;
        account.auto_pause_on_expired = self.auto_pause_on_expired != 0;
        account.status = status;
        account.schedulable = self.schedulable != 0;
        account.rate_limited_at = parse_instant(self.rate_limited_at)?;
        account.rate_limit_reset_at = parse_instant(self.rate_limit_reset_at)?;
        account.overload_until = parse_instant(self.overload_until)?;
        account.temp_unschedulable_until = parse_instant(self.temp_unschedulable_until)?;
        account.temp_unschedulable_reason = self.temp_unschedulable_reason;
        account.priority = self.priority as i32;
        account.max_concurrency = self.max_concurrency as u32;
        account.last_used_at = parse_instant(self.last_used_at)?;
        account.error_count = self.error_count as u32;
        account.success_count = self.success_count as u64;
        account.error_message = self.error_message;
        Ok(account)
    }
}

const SELECT_ACCOUNT_COLUMNS: &str = r#"
    SELECT id, name, kind, access_token, refresh_token, session_cookie, api_key,
           organization_id, api_url, expires_at, auto_pause_on_expired,
           status, schedulable, rate_limited_at, rate_limit_reset_at,
           overload_until, temp_unschedulable_until, temp_unschedulable_reason,
           priority, max_concurrency, last_used_at, error_count, success_count,
           error_message
    FROM accounts
"#;

/// SQLite-backed account store. Classifier actions run as
/// read-modify-write inside a transaction; the shared mutation helper
/// keeps the semantics identical to the in-memory store.
pub struct SqliteAccountStore {
    pool: DbPool,
}

impl SqliteAccountStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn write_state(
        executor: &mut sqlx::SqliteConnection,
        account: &Account,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE accounts SET
                status = ?,
                schedulable = ?,
                rate_limited_at = ?,
                rate_limit_reset_at = ?,
                overload_until = ?,
                temp_unschedulable_until = ?,
                temp_unschedulable_reason = ?,
                last_used_at = ?,
                error_count = ?,
                success_count = ?,
                error_message = ?
            WHERE id = ?
            "#,
        )
        .bind(account.status.to_string())
        .bind(account.schedulable as i64)
        .bind(account.rate_limited_at.map(|t| t.to_rfc3339()))
        .bind(account.rate_limit_reset_at.map(|t| t.to_rfc3339()))
        .bind(account.overload_until.map(|t| t.to_rfc3339()))
        .bind(account.temp_unschedulable_until.map(|t| t.to_rfc3339()))
        .bind(&account.temp_unschedulable_reason)
        .bind(account.last_used_at.map(|t| t.to_rfc3339()))
        .bind(account.error_count as i64)
        .bind(account.success_count as i64)
        .bind(&account.error_message)
        .bind(&account.id)
        .execute(executor)
        .await?;
        Ok(())
    }
}

fn store_err(e: sqlx::Error) -> ProxyError {
    ProxyError::Store(e.to_string())
}

#[async_trait]
impl AccountStore for SqliteAccountStore {
    async fn list_accounts(&self) -> ccproxy_core::Result<Vec<Account>> {
        let rows: Vec<AccountRow> =
            sqlx::query_as(&format!("{} ORDER BY id", SELECT_ACCOUNT_COLUMNS))
                .fetch_all(&self.pool)
                .await
                .map_err(store_err)?;

        rows.into_iter().map(AccountRow::into_account).collect()
    }

    async fn get(&self, id: &str) -> ccproxy_core::Result<Option<Account>> {
        let row: Option<AccountRow> =
            sqlx::query_as(&format!("{} WHERE id = ?", SELECT_ACCOUNT_COLUMNS))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(store_err)?;

        row.map(AccountRow::into_account).transpose()
    }

    async fn apply(&self, id: &str, action: AccountAction) -> ccproxy_core::Result<()> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        let row: Option<AccountRow> =
            sqlx::query_as(&format!("{} WHERE id = ?", SELECT_ACCOUNT_COLUMNS))
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(store_err)?;

        let mut account = row
            .ok_or_else(|| ProxyError::Store(format!("unknown account: {}", id)))?
            .into_account()?;

        apply_account_action(&mut account, &action, Utc::now());

        Self::write_state(&mut *tx, &account)
            .await
            .map_err(store_err)?;
        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    async fn update_oauth_tokens(&self, id: &str, tokens: OAuthTokens) -> ccproxy_core::Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE accounts SET
                access_token = ?,
                refresh_token = COALESCE(?, refresh_token),
                expires_at = ?,
                status = 'active',
                schedulable = 1,
                error_message = NULL
            WHERE id = ? AND kind = 'oauth'
            "#,
        )
        .bind(&tokens.access_token)
        .bind(&tokens.refresh_token)
        .bind(tokens.expires_at.to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        if result.rows_affected() == 0 {
            return Err(ProxyError::Store(format!(
                "no oauth account with id {}",
                id
            )));
        }
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn record_usage(
    pool: &DbPool,
    token_hash: &str,
    account_id: &str,
    model: &str,
    input_tokens: u32,
    output_tokens: u32,
    cache_creation_tokens: u32,
    cache_read_tokens: u32,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO usage_stats
        (token_hash, account_id, model, input_tokens, output_tokens, cache_creation_tokens, cache_read_tokens)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(token_hash)
    .bind(account_id)
    .bind(model)
    .bind(input_tokens as i64)
    .bind(output_tokens as i64)
    .bind(cache_creation_tokens as i64)
    .bind(cache_read_tokens as i64)
    .execute(pool)
    .await?;

    Ok(())
}

#[derive(Debug, sqlx::FromRow)]
pub struct UsageAggregate {
    pub account_id: String,
    pub total_input: i64,
    pub total_output: i64,
    pub total_requests: i64,
}

pub async fn get_usage_by_account(
    pool: &DbPool,
    account_id: &str,
    days: i32,
) -> Result<UsageAggregate, sqlx::Error> {
    let result = sqlx::query_as::<_, UsageAggregate>(
        r#"
        SELECT
            account_id,
            COALESCE(SUM(input_tokens), 0) as total_input,
            COALESCE(SUM(output_tokens), 0) as total_output,
            COALESCE(SUM(request_count), 0) as total_requests
        FROM usage_stats
        WHERE account_id = ?
        AND created_at >= datetime('now', ? || ' days')
        GROUP BY account_id
        "#,
    )
    .bind(account_id)
    .bind(-days)
    .fetch_optional(pool)
    .await?;

    Ok(result.unwrap_or(UsageAggregate {
        account_id: account_id.to_string(),
        total_input: 0,
        total_output: 0,
        total_requests: 0,
    }))
}
