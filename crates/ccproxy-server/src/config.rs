use ccproxy_core::{
    Account, AccountKind, AccountStatus, ConcurrencyConfig, PoolConfig, RateLimitConfig,
    RateLimitRule, RetryConfig, SchedulerConfig, Strategy,
};
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Environment variables prefixed `CCPROXY_` override the YAML file
/// after parse; see `apply_env_overrides` for the recognized keys.
pub const ENV_PREFIX: &str = "CCPROXY_";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub concurrency: ConcurrencySection,
    #[serde(default)]
    pub ratelimit: RateLimitSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub circuit: CircuitSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_seconds: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_seconds: u64,
    #[serde(default = "default_db_path")]
    pub database_path: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_mode() -> String {
    "production".to_string()
}

fn default_read_timeout() -> u64 {
    120
}

fn default_write_timeout() -> u64 {
    600
}

fn default_db_path() -> String {
    "data/ccproxy.db".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            mode: default_mode(),
            read_timeout_seconds: default_read_timeout(),
            write_timeout_seconds: default_write_timeout(),
            database_path: default_db_path(),
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuthConfig {
    /// HS256 secret for client bearer JWTs. Absent means JWT auth is
    /// off and only `api_keys` (or anonymous mode) applies.
    #[serde(default)]
    pub jwt_secret: Option<String>,
    /// Static client keys accepted via `x-api-key` or as a bearer.
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Revoked JWT ids (the `jti` claim); tokens carrying one are
    /// rejected even when the signature checks out.
    #[serde(default)]
    pub revoked_token_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AccountConfig {
    Oauth {
        id: String,
        name: String,
        access_token: String,
        refresh_token: String,
        #[serde(default)]
        expires_at: Option<chrono::DateTime<chrono::Utc>>,
        #[serde(default)]
        auto_pause_on_expired: bool,
        #[serde(default = "default_priority")]
        priority: i32,
        #[serde(default = "default_enabled")]
        enabled: bool,
        #[serde(default)]
        max_concurrency: u32,
        #[serde(default)]
        organization_id: Option<String>,
        #[serde(default)]
        api_url: Option<String>,
    },
    SessionCookie {
        id: String,
        name: String,
        cookie: String,
        #[serde(default = "default_priority")]
        priority: i32,
        #[serde(default = "default_enabled")]
        enabled: bool,
        #[serde(default)]
        max_concurrency: u32,
        #[serde(default)]
        organization_id: Option<String>,
        #[serde(default)]
        api_url: Option<String>,
    },
    ApiKey {
        id: String,
        name: String,
        api_key: String,
        #[serde(default = "default_priority")]
        priority: i32,
        #[serde(default = "default_enabled")]
        enabled: bool,
        #[serde(default)]
        max_concurrency: u32,
        #[serde(default)]
        organization_id: Option<String>,
        #[serde(default)]
        api_url: Option<String>,
    },
}

fn default_priority() -> i32 {
    100
}

fn default_enabled() -> bool {
    true
}

impl AccountConfig {
    pub fn id(&self) -> &str {
        match self {
            AccountConfig::Oauth { id, .. } => id,
            AccountConfig::SessionCookie { id, .. } => id,
            AccountConfig::ApiKey { id, .. } => id,
        }
    }

    pub fn to_account(&self) -> Account {
        match self {
            AccountConfig::Oauth {
                id,
                name,
                access_token,
                refresh_token,
                expires_at,
                auto_pause_on_expired,
                priority,
                enabled,
                max_concurrency,
                organization_id,
                api_url,
            } => {
                let mut account = Account::new(
                    id.clone(),
                    name.clone(),
                    AccountKind::Oauth {
                        access_token: access_token.clone(),
                        refresh_token: refresh_token.clone(),
                    },
                );
                account.expires_at = *expires_at;
                account.auto_pause_on_expired = *auto_pause_on_expired;
                account.priority = *priority;
                account.max_concurrency = *max_concurrency;
                account.organization_id = organization_id.clone();
                account.api_url = api_url.clone();
                if !enabled {
                    account.status = AccountStatus::Disabled;
                }
                account
            }
            AccountConfig::SessionCookie {
                id,
                name,
                cookie,
                priority,
                enabled,
                max_concurrency,
                organization_id,
                api_url,
            } => {
                let mut account = Account::new(
                    id.clone(),
                    name.clone(),
                    AccountKind::SessionCookie {
                        cookie: cookie.clone(),
                    },
                );
                account.priority = *priority;
                account.max_concurrency = *max_concurrency;
                account.organization_id = organization_id.clone();
                account.api_url = api_url.clone();
                if !enabled {
                    account.status = AccountStatus::Disabled;
                }
                account
            }
            AccountConfig::ApiKey {
                id,
                name,
                api_key,
                priority,
                enabled,
                max_concurrency,
                organization_id,
                api_url,
            } => {
                let mut account = Account::new(
                    id.clone(),
                    name.clone(),
                    AccountKind::ApiKey {
                        key: api_key.clone(),
                    },
                );
                account.priority = *priority;
                account.max_concurrency = *max_concurrency;
                account.organization_id = organization_id.clone();
                account.api_url = api_url.clone();
                if !enabled {
                    account.status = AccountStatus::Disabled;
                }
                account
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolSection {
    #[serde(default = "default_max_idle_conns")]
    pub max_idle_conns: usize,
    #[serde(default = "default_max_idle_conns_per_host")]
    pub max_idle_conns_per_host: usize,
    #[serde(default = "default_idle_conn_timeout")]
    pub idle_conn_timeout_seconds: u64,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    #[serde(default = "default_client_idle_ttl")]
    pub client_idle_ttl_seconds: u64,
    #[serde(default = "default_response_timeout")]
    pub response_timeout_seconds: u64,
}

fn default_max_idle_conns() -> usize {
    100
}

fn default_max_idle_conns_per_host() -> usize {
    10
}

fn default_idle_conn_timeout() -> u64 {
    90
}

fn default_max_clients() -> usize {
    100
}

fn default_client_idle_ttl() -> u64 {
    30 * 60
}

fn default_response_timeout() -> u64 {
    10 * 60
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_idle_conns: default_max_idle_conns(),
            max_idle_conns_per_host: default_max_idle_conns_per_host(),
            idle_conn_timeout_seconds: default_idle_conn_timeout(),
            max_clients: default_max_clients(),
            client_idle_ttl_seconds: default_client_idle_ttl(),
            response_timeout_seconds: default_response_timeout(),
        }
    }
}

impl PoolSection {
    pub fn to_core(&self) -> PoolConfig {
        PoolConfig {
            // hyper pools connections per host; the tighter of the two
            // idle knobs applies there.
            max_idle_conns_per_host: self.max_idle_conns_per_host.min(self.max_idle_conns.max(1)),
            idle_conn_timeout: Duration::from_secs(self.idle_conn_timeout_seconds),
            max_clients: self.max_clients,
            client_idle_ttl: Duration::from_secs(self.client_idle_ttl_seconds),
            response_timeout: Duration::from_secs(self.response_timeout_seconds),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConcurrencySection {
    #[serde(default = "default_user_max")]
    pub user_max: usize,
    #[serde(default = "default_account_max")]
    pub account_max: usize,
    #[serde(default = "default_max_wait_queue")]
    pub max_wait_queue: usize,
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_seconds: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,
}

fn default_user_max() -> usize {
    10
}

fn default_account_max() -> usize {
    5
}

fn default_max_wait_queue() -> usize {
    20
}

fn default_wait_timeout() -> u64 {
    10
}

fn default_backoff_base_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    2000
}

fn default_backoff_jitter() -> f64 {
    0.5
}

impl Default for ConcurrencySection {
    fn default() -> Self {
        Self {
            user_max: default_user_max(),
            account_max: default_account_max(),
            max_wait_queue: default_max_wait_queue(),
            wait_timeout_seconds: default_wait_timeout(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_jitter: default_backoff_jitter(),
        }
    }
}

impl ConcurrencySection {
    pub fn to_core(&self) -> ConcurrencyConfig {
        ConcurrencyConfig {
            user_max: self.user_max,
            account_max: self.account_max,
            max_wait_queue: self.max_wait_queue,
            wait_timeout: Duration::from_secs(self.wait_timeout_seconds),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
            backoff_jitter: self.backoff_jitter,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitRuleSection {
    pub requests: u64,
    pub window_seconds: u64,
}

impl RateLimitRuleSection {
    fn to_core(&self) -> RateLimitRule {
        RateLimitRule::new(self.requests, Duration::from_secs(self.window_seconds))
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RateLimitSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub global_limit: Option<RateLimitRuleSection>,
    #[serde(default)]
    pub user_limit: Option<RateLimitRuleSection>,
    #[serde(default)]
    pub account_limit: Option<RateLimitRuleSection>,
    #[serde(default)]
    pub ip_limit: Option<RateLimitRuleSection>,
}

impl RateLimitSection {
    pub fn to_core(&self) -> RateLimitConfig {
        RateLimitConfig {
            enabled: self.enabled,
            global: self.global_limit.as_ref().map(RateLimitRuleSection::to_core),
            user: self.user_limit.as_ref().map(RateLimitRuleSection::to_core),
            account: self
                .account_limit
                .as_ref()
                .map(RateLimitRuleSection::to_core),
            ip: self.ip_limit.as_ref().map(RateLimitRuleSection::to_core),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_max_account_switches")]
    pub max_account_switches: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_retry_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_max_account_switches() -> u32 {
    10
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    2000
}

fn default_retry_jitter() -> f64 {
    0.5
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            max_account_switches: default_max_account_switches(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter: default_retry_jitter(),
        }
    }
}

impl RetrySection {
    pub fn to_core(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            max_account_switches: self.max_account_switches,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            jitter: self.jitter,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default = "default_sticky_ttl")]
    pub sticky_session_ttl_seconds: u64,
    #[serde(default = "default_renewal_threshold")]
    pub renewal_threshold_seconds: u64,
}

fn default_strategy() -> String {
    "least_loaded".to_string()
}

fn default_sticky_ttl() -> u64 {
    3600
}

fn default_renewal_threshold() -> u64 {
    300
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            sticky_session_ttl_seconds: default_sticky_ttl(),
            renewal_threshold_seconds: default_renewal_threshold(),
        }
    }
}

impl SchedulerSection {
    pub fn to_core(&self) -> Result<SchedulerConfig, ConfigError> {
        let strategy = Strategy::from_str(&self.strategy).map_err(ConfigError::Validation)?;
        Ok(SchedulerConfig {
            strategy,
            sticky_ttl: chrono::Duration::seconds(self.sticky_session_ttl_seconds as i64),
            renewal_threshold: chrono::Duration::seconds(self.renewal_threshold_seconds as i64),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthSection {
    #[serde(default = "default_health_enabled")]
    pub enabled: bool,
    #[serde(default = "default_check_interval")]
    pub check_interval_seconds: u64,
    #[serde(default = "default_token_refresh_before")]
    pub token_refresh_before_seconds: u64,
    #[serde(default = "default_health_timeout")]
    pub timeout_seconds: u64,
}

fn default_health_enabled() -> bool {
    true
}

fn default_check_interval() -> u64 {
    60
}

fn default_token_refresh_before() -> u64 {
    10 * 60
}

fn default_health_timeout() -> u64 {
    30
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            enabled: default_health_enabled(),
            check_interval_seconds: default_check_interval(),
            token_refresh_before_seconds: default_token_refresh_before(),
            timeout_seconds: default_health_timeout(),
        }
    }
}

/// Legacy failure-count breaker options. Accepted so old config files
/// still parse, but the account state model supersedes the breaker and
/// nothing consumes these values.
#[derive(Debug, Clone, Deserialize)]
pub struct CircuitSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_open_timeout")]
    pub open_timeout_seconds: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_open_timeout() -> u64 {
    60
}

impl Default for CircuitSection {
    fn default() -> Self {
        Self {
            enabled: false,
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            open_timeout_seconds: default_open_timeout(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        let mut config: Config =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse { source: e })?;

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Scalar fields can be overridden per deployment without editing
    /// the file. Unparseable values are ignored with a warning rather
    /// than failing startup.
    pub fn apply_env_overrides(&mut self) {
        override_from_env(&mut self.server.host, "CCPROXY_SERVER_HOST");
        override_from_env(&mut self.server.port, "CCPROXY_SERVER_PORT");
        override_from_env(&mut self.server.mode, "CCPROXY_SERVER_MODE");
        override_from_env(&mut self.server.database_path, "CCPROXY_SERVER_DATABASE_PATH");
        override_from_env(&mut self.server.log_level, "CCPROXY_SERVER_LOG_LEVEL");

        if let Ok(secret) = std::env::var("CCPROXY_AUTH_JWT_SECRET") {
            if !secret.is_empty() {
                self.auth.jwt_secret = Some(secret);
            }
        }

        override_from_env(&mut self.ratelimit.enabled, "CCPROXY_RATELIMIT_ENABLED");
        override_from_env(&mut self.concurrency.user_max, "CCPROXY_CONCURRENCY_USER_MAX");
        override_from_env(
            &mut self.concurrency.account_max,
            "CCPROXY_CONCURRENCY_ACCOUNT_MAX",
        );
        override_from_env(&mut self.retry.max_attempts, "CCPROXY_RETRY_MAX_ATTEMPTS");
        override_from_env(
            &mut self.retry.max_account_switches,
            "CCPROXY_RETRY_MAX_ACCOUNT_SWITCHES",
        );
        override_from_env(&mut self.scheduler.strategy, "CCPROXY_SCHEDULER_STRATEGY");
        override_from_env(
            &mut self.scheduler.sticky_session_ttl_seconds,
            "CCPROXY_SCHEDULER_STICKY_SESSION_TTL_SECONDS",
        );
        override_from_env(&mut self.pool.max_clients, "CCPROXY_POOL_MAX_CLIENTS");
        override_from_env(
            &mut self.pool.response_timeout_seconds,
            "CCPROXY_POOL_RESPONSE_TIMEOUT_SECONDS",
        );
        override_from_env(&mut self.health.enabled, "CCPROXY_HEALTH_ENABLED");
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut ids = std::collections::HashSet::new();
        for account in &self.accounts {
            if !ids.insert(account.id().to_string()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate account id: {}",
                    account.id()
                )));
            }
        }

        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::Validation(
                "retry.jitter must be within [0, 1]".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.concurrency.backoff_jitter) {
            return Err(ConfigError::Validation(
                "concurrency.backoff_jitter must be within [0, 1]".to_string(),
            ));
        }

        // Fail early instead of at the first select.
        self.scheduler.to_core().map(|_| ())
    }
}

fn override_from_env<T: FromStr>(target: &mut T, key: &str) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => warn!(key = key, value = %raw, "Ignoring unparseable env override"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {source}")]
    Parse {
        #[source]
        source: serde_yaml::Error,
    },
    #[error("config validation error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config: Config = serde_yaml::from_str(
            r#"
server:
  port: 8080
accounts:
  - type: api_key
    id: key-1
    name: Key Account
    api_key: sk-test
"#,
        )
        .unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.concurrency.user_max, 10);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.max_account_switches, 10);
        assert_eq!(config.scheduler.strategy, "least_loaded");
        assert_eq!(config.pool.response_timeout_seconds, 600);
        assert!(!config.ratelimit.enabled);
        assert!(!config.circuit.enabled);
    }

    #[test]
    fn all_account_kinds_parse() {
        let config: Config = serde_yaml::from_str(
            r#"
accounts:
  - type: oauth
    id: oauth-1
    name: OAuth Account
    access_token: at
    refresh_token: rt
    auto_pause_on_expired: true
    priority: 10
  - type: session_cookie
    id: web-1
    name: Web Account
    cookie: sessionKey=abc
  - type: api_key
    id: key-1
    name: Key Account
    api_key: sk-test
    max_concurrency: 7
"#,
        )
        .unwrap();

        assert_eq!(config.accounts.len(), 3);

        let oauth = config.accounts[0].to_account();
        assert_eq!(oauth.kind.label(), "oauth");
        assert!(oauth.auto_pause_on_expired);
        assert_eq!(oauth.priority, 10);

        let web = config.accounts[1].to_account();
        assert_eq!(web.kind.label(), "session_cookie");

        let key = config.accounts[2].to_account();
        assert_eq!(key.kind.label(), "api_key");
        assert_eq!(key.max_concurrency, 7);
    }

    #[test]
    fn disabled_account_maps_to_disabled_status() {
        let config: Config = serde_yaml::from_str(
            r#"
accounts:
  - type: api_key
    id: key-1
    name: Key
    api_key: sk
    enabled: false
"#,
        )
        .unwrap();

        let account = config.accounts[0].to_account();
        assert_eq!(account.status, AccountStatus::Disabled);
        assert!(!account.is_schedulable(chrono::Utc::now()));
    }

    #[test]
    fn duplicate_account_ids_are_rejected() {
        let config: Config = serde_yaml::from_str(
            r#"
accounts:
  - type: api_key
    id: dup
    name: One
    api_key: sk1
  - type: api_key
    id: dup
    name: Two
    api_key: sk2
"#,
        )
        .unwrap();

        assert!(matches!(
            config.validate(),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn unknown_strategy_fails_validation() {
        let config: Config = serde_yaml::from_str(
            r#"
scheduler:
  strategy: fastest_first
"#,
        )
        .unwrap();

        assert!(config.validate().is_err());
    }

    #[test]
    fn ratelimit_rules_convert() {
        let config: Config = serde_yaml::from_str(
            r#"
ratelimit:
  enabled: true
  user_limit:
    requests: 60
    window_seconds: 60
  global_limit:
    requests: 1000
    window_seconds: 60
"#,
        )
        .unwrap();

        let core = config.ratelimit.to_core();
        assert!(core.enabled);
        assert_eq!(core.user.unwrap().requests, 60);
        assert_eq!(core.global.unwrap().requests, 1000);
        assert!(core.account.is_none());
    }

    #[test]
    fn env_overrides_apply_after_parse() {
        let mut config = Config::default();
        assert_eq!(config.server.port, 3000);

        std::env::set_var("CCPROXY_SERVER_PORT", "9100");
        std::env::set_var("CCPROXY_RETRY_MAX_ATTEMPTS", "5");
        std::env::set_var("CCPROXY_RATELIMIT_ENABLED", "true");
        config.apply_env_overrides();
        std::env::remove_var("CCPROXY_SERVER_PORT");
        std::env::remove_var("CCPROXY_RETRY_MAX_ATTEMPTS");
        std::env::remove_var("CCPROXY_RATELIMIT_ENABLED");

        assert_eq!(config.server.port, 9100);
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.ratelimit.enabled);
    }

    #[test]
    fn unparseable_env_override_is_ignored() {
        let mut config = Config::default();
        std::env::set_var("CCPROXY_CONCURRENCY_USER_MAX", "lots");
        config.apply_env_overrides();
        std::env::remove_var("CCPROXY_CONCURRENCY_USER_MAX");

        assert_eq!(config.concurrency.user_max, 10);
    }

    #[test]
    fn legacy_circuit_section_still_parses() {
        let config: Config = serde_yaml::from_str(
            r#"
circuit:
  enabled: true
  failure_threshold: 3
"#,
        )
        .unwrap();

        assert!(config.circuit.enabled);
        assert_eq!(config.circuit.failure_threshold, 3);
    }
}
