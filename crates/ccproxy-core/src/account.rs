use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Error,
    Disabled,
    Paused,
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccountStatus::Active => write!(f, "active"),
            AccountStatus::Error => write!(f, "error"),
            AccountStatus::Disabled => write!(f, "disabled"),
            AccountStatus::Paused => write!(f, "paused"),
        }
    }
}

impl std::str::FromStr for AccountStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AccountStatus::Active),
            "error" => Ok(AccountStatus::Error),
            "disabled" => Ok(AccountStatus::Disabled),
            "paused" => Ok(AccountStatus::Paused),
            other => Err(format!("unknown account status: {}", other)),
        }
    }
}

/// Credential bundle, tagged by account type. Header production and the
/// refresh predicate dispatch on the variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AccountKind {
    Oauth {
        access_token: String,
        refresh_token: String,
    },
    SessionCookie {
        cookie: String,
    },
    ApiKey {
        key: String,
    },
}

impl AccountKind {
    pub fn label(&self) -> &'static str {
        match self {
            AccountKind::Oauth { .. } => "oauth",
            AccountKind::SessionCookie { .. } => "session_cookie",
            AccountKind::ApiKey { .. } => "api_key",
        }
    }

    /// Headers this account authenticates outbound requests with.
    pub fn auth_headers(&self) -> Vec<(&'static str, String)> {
        match self {
            AccountKind::Oauth { access_token, .. } => {
                vec![("Authorization", format!("Bearer {}", access_token))]
            }
            AccountKind::SessionCookie { cookie } => {
                vec![("Cookie", cookie.clone())]
            }
            AccountKind::ApiKey { key } => vec![("x-api-key", key.clone())],
        }
    }

    /// Whether this account can serve a request forced into `mode` via
    /// `X-Proxy-Mode`. Web traffic rides session cookies; API traffic
    /// rides OAuth tokens and raw keys.
    pub fn compatible_with(&self, mode: Option<ProxyMode>) -> bool {
        match mode {
            None => true,
            Some(ProxyMode::Web) => matches!(self, AccountKind::SessionCookie { .. }),
            Some(ProxyMode::Api) => !matches!(self, AccountKind::SessionCookie { .. }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    Web,
    Api,
}

impl std::str::FromStr for ProxyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "web" => Ok(ProxyMode::Web),
            "api" => Ok(ProxyMode::Api),
            other => Err(format!("unknown proxy mode: {}", other)),
        }
    }
}

/// Result of a successful OAuth refresh, applied to the store atomically.
#[derive(Debug, Clone)]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub name: String,
    pub kind: AccountKind,
    pub organization_id: Option<String>,
    /// Override base URL for this account's upstream; default endpoint
    /// otherwise.
    pub api_url: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub auto_pause_on_expired: bool,
    pub status: AccountStatus,
    pub schedulable: bool,
    pub rate_limited_at: Option<DateTime<Utc>>,
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    pub overload_until: Option<DateTime<Utc>>,
    pub temp_unschedulable_until: Option<DateTime<Utc>>,
    pub temp_unschedulable_reason: Option<String>,
    /// Lower is preferred.
    pub priority: i32,
    /// Per-account concurrency cap; 0 falls back to the configured
    /// account default.
    pub max_concurrency: u32,
    pub last_used_at: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub success_count: u64,
    pub error_message: Option<String>,
}

impl Account {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: AccountKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            organization_id: None,
            api_url: None,
            expires_at: None,
            auto_pause_on_expired: false,
            status: AccountStatus::Active,
            schedulable: true,
            rate_limited_at: None,
            rate_limit_reset_at: None,
            overload_until: None,
            temp_unschedulable_until: None,
            temp_unschedulable_reason: None,
            priority: 100,
            max_concurrency: 0,
            last_used_at: None,
            error_count: 0,
            success_count: 0,
            error_message: None,
        }
    }

    /// Whether this account is currently eligible for selection.
    ///
    /// Every temporary withdrawal is a time-bounded field, so eligibility
    /// returns on its own once the clock passes the deadline; no repair
    /// task is involved.
    pub fn is_schedulable(&self, now: DateTime<Utc>) -> bool {
        if self.status != AccountStatus::Active || !self.schedulable {
            return false;
        }

        if self.auto_pause_on_expired {
            if let Some(expires_at) = self.expires_at {
                if now >= expires_at {
                    return false;
                }
            }
        }

        if let Some(until) = self.overload_until {
            if now < until {
                return false;
            }
        }

        if let Some(reset_at) = self.rate_limit_reset_at {
            if now < reset_at {
                return false;
            }
        }

        if let Some(until) = self.temp_unschedulable_until {
            if now < until {
                return false;
            }
        }

        true
    }

    /// True when the access token is close enough to expiry that the
    /// refresh collaborator should run. Only meaningful for OAuth
    /// accounts.
    pub fn needs_refresh(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        if !matches!(self.kind, AccountKind::Oauth { .. }) {
            return false;
        }
        match self.expires_at {
            Some(expires_at) => expires_at - now < threshold,
            None => false,
        }
    }
}
