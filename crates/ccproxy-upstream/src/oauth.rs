use async_trait::async_trait;
use ccproxy_core::{Account, AccountKind, OAuthTokens, ProxyError, Result, TokenRefresher};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info};

/// Refresh half of the OAuth collaborator: exchanges a refresh token
/// for a new access token. The interactive bootstrap flow is not part
/// of the proxy.
pub struct OAuthRefresher {
    client: Client,
    token_url: String,
    client_id: String,
}

impl OAuthRefresher {
    const TOKEN_URL: &'static str = "https://console.anthropic.com/v1/oauth/token";
    const CLIENT_ID: &'static str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ProxyError::Config(format!("failed to build OAuth client: {}", e)))?;
        Ok(Self {
            client,
            token_url: Self::TOKEN_URL.to_string(),
            client_id: Self::CLIENT_ID.to_string(),
        })
    }

    pub fn with_token_url(mut self, token_url: impl Into<String>) -> Self {
        self.token_url = token_url.into();
        self
    }
}

#[async_trait]
impl TokenRefresher for OAuthRefresher {
    async fn refresh(&self, account: &Account) -> Result<OAuthTokens> {
        let refresh_token = match &account.kind {
            AccountKind::Oauth { refresh_token, .. } => refresh_token.clone(),
            other => {
                return Err(ProxyError::Refresh(format!(
                    "account {} is {}, not oauth",
                    account.id,
                    other.label()
                )))
            }
        };

        debug!(account_id = %account.id, "Refreshing OAuth token");

        let request = TokenRequest {
            grant_type: "refresh_token".to_string(),
            client_id: self.client_id.clone(),
            refresh_token,
        };

        let response = self
            .client
            .post(&self.token_url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(account_id = %account.id, status = %status, "Token refresh failed");
            return Err(ProxyError::Refresh(format!("HTTP {}: {}", status, body)));
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProxyError::Refresh(format!("failed to parse token response: {}", e)))?;

        info!(
            account_id = %account.id,
            expires_in = token_response.expires_in,
            "OAuth token refreshed"
        );

        Ok(OAuthTokens {
            access_token: token_response.access_token,
            refresh_token: token_response.refresh_token,
            expires_at: chrono::Utc::now()
                + chrono::Duration::seconds(token_response.expires_in as i64),
        })
    }
}

#[derive(Debug, Serialize)]
struct TokenRequest {
    grant_type: String,
    client_id: String,
    refresh_token: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refresh_rejects_non_oauth_accounts() {
        let refresher = OAuthRefresher::new().unwrap();
        let account = Account::new(
            "k1",
            "Key",
            AccountKind::ApiKey {
                key: "sk".to_string(),
            },
        );

        let err = refresher.refresh(&account).await.unwrap_err();
        assert!(matches!(err, ProxyError::Refresh(_)));
    }
}
