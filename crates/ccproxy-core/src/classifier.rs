use crate::error::ProxyError;
use crate::store::AccountAction;
use chrono::{DateTime, Duration, Utc};

/// Fallback applied when a 429 carries no parseable `Retry-After`.
/// Must never be zero.
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// How long a 503 withdraws an account.
pub const OVERLOAD_COOLDOWN_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Success,
    /// Retry against the same account while inner attempts remain; the
    /// executor switches once they are exhausted.
    RetrySameAccount,
    SwitchAccount,
    FatalRequest,
}

#[derive(Debug, Clone)]
pub struct Classification {
    pub disposition: Disposition,
    pub action: Option<AccountAction>,
}

/// Maps an upstream failure into a retry disposition and the account
/// mutation to apply. Account-faulting and request-faulting conditions
/// are kept apart so a transient upstream 5xx cannot withdraw the whole
/// fleet at once.
pub fn classify(error: &ProxyError, now: DateTime<Utc>) -> Classification {
    match error {
        ProxyError::UpstreamRateLimited { retry_after_secs } => Classification {
            disposition: Disposition::SwitchAccount,
            action: Some(AccountAction::RateLimited {
                reset_at: now + Duration::seconds(*retry_after_secs as i64),
            }),
        },
        ProxyError::UpstreamAuth { message, .. } => Classification {
            disposition: Disposition::SwitchAccount,
            action: Some(AccountAction::AuthFailed {
                message: message.clone(),
            }),
        },
        ProxyError::UpstreamOverloaded => Classification {
            disposition: Disposition::SwitchAccount,
            action: Some(AccountAction::Overloaded {
                until: now + Duration::seconds(OVERLOAD_COOLDOWN_SECS as i64),
            }),
        },
        ProxyError::UpstreamServer { .. } => Classification {
            disposition: Disposition::SwitchAccount,
            action: Some(AccountAction::RecordFailure),
        },
        ProxyError::Network(_) => Classification {
            disposition: Disposition::RetrySameAccount,
            action: Some(AccountAction::RecordFailure),
        },
        ProxyError::UpstreamClient { .. } => Classification {
            disposition: Disposition::FatalRequest,
            action: Some(AccountAction::RecordFailure),
        },
        // The account's own request window is saturated: withdraw it
        // until the window resets and move on. Not an upstream fault.
        ProxyError::AccountWindowExhausted { retry_after_secs } => Classification {
            disposition: Disposition::SwitchAccount,
            action: Some(AccountAction::TempUnschedulable {
                until: now + Duration::seconds(*retry_after_secs as i64),
                reason: "account_window".to_string(),
            }),
        },
        ProxyError::Refresh(_) => Classification {
            disposition: Disposition::SwitchAccount,
            action: None,
        },
        _ => Classification {
            disposition: Disposition::FatalRequest,
            action: None,
        },
    }
}
