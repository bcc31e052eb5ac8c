#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("concurrency wait queue is full")]
    QueueFull,

    #[error("timed out waiting for a concurrency slot")]
    QueueTimeout,

    #[error("no available accounts")]
    NoAvailableAccounts,

    #[error("upstream auth error: {status} - {message}")]
    UpstreamAuth { status: u16, message: String },

    #[error("upstream rate limited, retry after {retry_after_secs}s")]
    UpstreamRateLimited { retry_after_secs: u64 },

    #[error("upstream overloaded")]
    UpstreamOverloaded,

    #[error("upstream server error: {status} - {message}")]
    UpstreamServer { status: u16, message: String },

    #[error("upstream client error: {status} - {message}")]
    UpstreamClient { status: u16, message: String },

    #[error("account request window exhausted, resets in {retry_after_secs}s")]
    AccountWindowExhausted { retry_after_secs: u64 },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("token refresh failed: {0}")]
    Refresh(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Maps an upstream HTTP status into the error kind the classifier
    /// consumes. `retry_after` comes from the `Retry-After` header when
    /// present and parseable.
    pub fn from_upstream(status: u16, retry_after_secs: Option<u64>, body: &str) -> Self {
        match status {
            401 | 403 => ProxyError::UpstreamAuth {
                status,
                message: body.to_string(),
            },
            429 => ProxyError::UpstreamRateLimited {
                retry_after_secs: retry_after_secs
                    .filter(|s| *s > 0)
                    .unwrap_or(crate::classifier::DEFAULT_RETRY_AFTER_SECS),
            },
            503 | 529 => ProxyError::UpstreamOverloaded,
            500 | 502 | 504 => ProxyError::UpstreamServer {
                status,
                message: body.to_string(),
            },
            s if (400..500).contains(&s) => ProxyError::UpstreamClient {
                status,
                message: body.to_string(),
            },
            _ => ProxyError::UpstreamServer {
                status,
                message: body.to_string(),
            },
        }
    }

    /// Upstream-shaped JSON error body returned to clients on terminal
    /// failure.
    pub fn to_json_error(&self) -> serde_json::Value {
        match self {
            ProxyError::RateLimited { retry_after_secs }
            | ProxyError::UpstreamRateLimited { retry_after_secs } => serde_json::json!({
                "type": "error",
                "error": {
                    "type": "rate_limited",
                    "message": format!("Rate limited. Retry after {} seconds.", retry_after_secs)
                }
            }),
            ProxyError::QueueFull => serde_json::json!({
                "type": "error",
                "error": {
                    "type": "queue_full",
                    "message": "Too many queued requests for this user."
                }
            }),
            ProxyError::QueueTimeout => serde_json::json!({
                "type": "error",
                "error": {
                    "type": "queue_timeout",
                    "message": "Timed out waiting for an execution slot."
                }
            }),
            ProxyError::NoAvailableAccounts => serde_json::json!({
                "type": "error",
                "error": {
                    "type": "no_available_accounts",
                    "message": "no_available_accounts"
                }
            }),
            ProxyError::UpstreamAuth { status, .. } => serde_json::json!({
                "type": "error",
                "error": {
                    "type": "authentication_error",
                    "message": format!(
                        "Upstream rejected the account credentials ({}). \
                         Re-authenticate the affected account or contact the operator.",
                        status
                    )
                }
            }),
            ProxyError::UpstreamOverloaded => serde_json::json!({
                "type": "error",
                "error": {
                    "type": "overloaded_error",
                    "message": "Upstream is overloaded. Please retry shortly."
                }
            }),
            ProxyError::UpstreamServer { status, message } => serde_json::json!({
                "type": "error",
                "error": {
                    "type": "api_error",
                    "message": format!("Upstream error {}: {}", status, message)
                }
            }),
            ProxyError::UpstreamClient { status, message } => serde_json::json!({
                "type": "error",
                "error": {
                    "type": "invalid_request_error",
                    "message": format!("Upstream rejected the request ({}): {}", status, message)
                }
            }),
            ProxyError::Network(e) => serde_json::json!({
                "type": "error",
                "error": {
                    "type": "upstream_network_error",
                    "message": e.to_string()
                }
            }),
            _ => serde_json::json!({
                "type": "error",
                "error": {
                    "type": "internal_error",
                    "message": self.to_string()
                }
            }),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

impl From<serde_json::Error> for ProxyError {
    fn from(e: serde_json::Error) -> Self {
        ProxyError::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_statuses_map_to_auth_error() {
        for status in [401, 403] {
            match ProxyError::from_upstream(status, None, "denied") {
                ProxyError::UpstreamAuth { status: s, .. } => assert_eq!(s, status),
                other => panic!("expected UpstreamAuth, got {:?}", other),
            }
        }
    }

    #[test]
    fn rate_limit_uses_retry_after_header() {
        match ProxyError::from_upstream(429, Some(17), "slow down") {
            ProxyError::UpstreamRateLimited { retry_after_secs } => {
                assert_eq!(retry_after_secs, 17)
            }
            other => panic!("expected UpstreamRateLimited, got {:?}", other),
        }
    }

    #[test]
    fn rate_limit_falls_back_when_header_absent_or_zero() {
        for retry_after in [None, Some(0)] {
            match ProxyError::from_upstream(429, retry_after, "") {
                ProxyError::UpstreamRateLimited { retry_after_secs } => {
                    assert_eq!(retry_after_secs, crate::classifier::DEFAULT_RETRY_AFTER_SECS);
                    assert_ne!(retry_after_secs, 0);
                }
                other => panic!("expected UpstreamRateLimited, got {:?}", other),
            }
        }
    }

    #[test]
    fn overload_statuses() {
        assert!(matches!(
            ProxyError::from_upstream(503, None, ""),
            ProxyError::UpstreamOverloaded
        ));
        assert!(matches!(
            ProxyError::from_upstream(529, None, ""),
            ProxyError::UpstreamOverloaded
        ));
    }

    #[test]
    fn server_errors_keep_status() {
        match ProxyError::from_upstream(502, None, "bad gateway") {
            ProxyError::UpstreamServer { status, .. } => assert_eq!(status, 502),
            other => panic!("expected UpstreamServer, got {:?}", other),
        }
    }

    #[test]
    fn other_4xx_is_client_error() {
        match ProxyError::from_upstream(422, None, "invalid body") {
            ProxyError::UpstreamClient { status, .. } => assert_eq!(status, 422),
            other => panic!("expected UpstreamClient, got {:?}", other),
        }
    }

    #[test]
    fn no_available_accounts_body_is_distinguishable() {
        let body = ProxyError::NoAvailableAccounts.to_json_error();
        assert_eq!(body["error"]["type"], "no_available_accounts");
    }
}
