use crate::config::HealthSection;
use crate::pipeline::AppState;
use ccproxy_core::{AccountStatus, TokenRefresher};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Periodic housekeeping: rate-bucket GC and idle-client eviction every
/// minute, sticky-binding sweep every five. All state also self-heals
/// lazily; these only bound memory.
pub fn spawn_maintenance(state: Arc<AppState>) {
    let minute_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            minute_state.ratelimit.sweep_stale();
            minute_state.pool.sweep_idle();
        }
    });

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            state.scheduler.sweep_expired();
        }
    });
}

/// Refreshes OAuth tokens ahead of expiry so requests rarely hit the
/// in-line 401 path. Disabled and paused accounts are the operator's
/// business and are left alone.
pub fn spawn_health(
    state: Arc<AppState>,
    cfg: HealthSection,
    refresher: Arc<dyn TokenRefresher>,
) {
    if !cfg.enabled {
        info!("Health refresh task disabled");
        return;
    }

    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(cfg.check_interval_seconds.max(1)));
        let threshold = chrono::Duration::seconds(cfg.token_refresh_before_seconds as i64);
        let refresh_timeout = Duration::from_secs(cfg.timeout_seconds.max(1));

        loop {
            interval.tick().await;

            let accounts = match state.store.list_accounts().await {
                Ok(accounts) => accounts,
                Err(e) => {
                    error!(error = %e, "Health task failed to list accounts");
                    continue;
                }
            };

            let now = Utc::now();
            for account in accounts {
                if matches!(
                    account.status,
                    AccountStatus::Disabled | AccountStatus::Paused
                ) {
                    continue;
                }
                if !account.needs_refresh(now, threshold) {
                    continue;
                }

                match tokio::time::timeout(refresh_timeout, refresher.refresh(&account)).await {
                    Ok(Ok(tokens)) => {
                        match state.store.update_oauth_tokens(&account.id, tokens).await {
                            Ok(()) => {
                                info!(account_id = %account.id, "Proactively refreshed OAuth token")
                            }
                            Err(e) => {
                                error!(account_id = %account.id, error = %e, "Failed to store refreshed tokens")
                            }
                        }
                    }
                    Ok(Err(e)) => {
                        warn!(account_id = %account.id, error = %e, "Scheduled token refresh failed")
                    }
                    Err(_) => {
                        warn!(account_id = %account.id, "Scheduled token refresh timed out")
                    }
                }
            }
        }
    });
}
