use crate::types::{extract_usage_from_chunk, ByteStream, ClientHeaders, UsageTotals};
use async_stream::try_stream;
use ccproxy_core::{Account, ClientPool, ProxyError, Result};
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Forwards one admitted request to an account's upstream. Pure
/// transport: credentials come from the account, the client from the
/// pool, and the body passes through unchanged.
pub struct UpstreamForwarder {
    pool: Arc<ClientPool>,
    default_base_url: String,
}

impl UpstreamForwarder {
    const DEFAULT_BASE_URL: &'static str = "https://api.anthropic.com";
    const API_VERSION: &'static str = "2023-06-01";

    pub fn new(pool: Arc<ClientPool>) -> Self {
        Self {
            pool,
            default_base_url: Self::DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Overrides the default upstream base URL (tests, gateways).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.default_base_url = base_url.into();
        self
    }

    /// Outbound URL mirrors the inbound endpoint shape against the
    /// account's base, so both dialects ride the same forwarder.
    fn endpoint_url(&self, account: &Account, path: &str) -> String {
        let base = account
            .api_url
            .as_deref()
            .unwrap_or(&self.default_base_url)
            .trim_end_matches('/');
        format!("{}{}", base, path)
    }

    fn request_builder(
        &self,
        account: &Account,
        path: &str,
        body: &serde_json::Value,
        client_headers: &ClientHeaders,
    ) -> Result<reqwest::RequestBuilder> {
        let client = self.pool.client_for(&account.id)?;
        let url = self.endpoint_url(account, path);

        let mut builder = client
            .post(&url)
            .header("anthropic-version", Self::API_VERSION)
            .header("Content-Type", "application/json");

        for (name, value) in account.kind.auth_headers() {
            builder = builder.header(name, value);
        }
        for (key, value) in client_headers.iter() {
            builder = builder.header(key.as_str(), value.as_str());
        }

        debug!(
            account_id = %account.id,
            auth_type = account.kind.label(),
            url = %url,
            "Prepared upstream request"
        );

        Ok(builder.json(body))
    }

    async fn error_from_response(response: reqwest::Response) -> ProxyError {
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();

        warn!(status = status, retry_after = ?retry_after, "Upstream returned error status");
        ProxyError::from_upstream(status, retry_after, &body)
    }

    /// Non-streaming exchange; returns the upstream JSON unchanged.
    pub async fn forward(
        &self,
        account: &Account,
        path: &str,
        body: &serde_json::Value,
        client_headers: &ClientHeaders,
    ) -> Result<serde_json::Value> {
        let response = self
            .request_builder(account, path, body, client_headers)?
            .send()
            .await?;

        let status = response.status();
        debug!(account_id = %account.id, status = %status, "Received upstream response");

        if !status.is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let value: serde_json::Value = response.json().await?;

        if let Some(usage) = crate::types::usage_from_value(&value) {
            info!(
                account_id = %account.id,
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                "Upstream request completed"
            );
        }

        Ok(value)
    }

    /// Streaming exchange; the returned stream yields upstream bytes
    /// unchanged and logs accumulated usage when the stream ends.
    /// Dropping the stream aborts the upstream read.
    pub async fn forward_stream(
        &self,
        account: &Account,
        path: &str,
        body: &serde_json::Value,
        client_headers: &ClientHeaders,
    ) -> Result<ByteStream> {
        let response = self
            .request_builder(account, path, body, client_headers)?
            .send()
            .await?;

        let status = response.status();
        debug!(account_id = %account.id, status = %status, "Received upstream stream response");

        if !status.is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let account_id = account.id.clone();

        let stream = try_stream! {
            let mut byte_stream = response.bytes_stream();
            let mut totals = UsageTotals::default();

            while let Some(chunk_result) = byte_stream.next().await {
                let chunk = chunk_result?;

                if let Some(usage) = extract_usage_from_chunk(&chunk) {
                    totals.merge_max(&usage);
                }

                yield chunk;
            }

            if totals.observed() {
                info!(
                    account_id = %account_id,
                    input_tokens = totals.input_tokens,
                    output_tokens = totals.output_tokens,
                    "Upstream streaming request completed"
                );
            }
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccproxy_core::{AccountKind, PoolConfig};

    fn forwarder() -> UpstreamForwarder {
        UpstreamForwarder::new(Arc::new(ClientPool::new(PoolConfig::default()).unwrap()))
    }

    fn account_with_url(url: Option<&str>) -> Account {
        let mut account = Account::new(
            "a1",
            "Account",
            AccountKind::ApiKey {
                key: "sk-test".to_string(),
            },
        );
        account.api_url = url.map(String::from);
        account
    }

    #[test]
    fn default_base_url_carries_the_inbound_path() {
        let f = forwarder();
        let url = f.endpoint_url(&account_with_url(None), "/v1/messages");
        assert_eq!(url, "https://api.anthropic.com/v1/messages");
    }

    #[test]
    fn account_base_url_overrides_and_trailing_slash_is_trimmed() {
        let f = forwarder();
        let url = f.endpoint_url(
            &account_with_url(Some("https://gateway.example.com/")),
            "/v1/chat/completions",
        );
        assert_eq!(url, "https://gateway.example.com/v1/chat/completions");
    }

    #[test]
    fn forwarder_base_override_applies_without_account_url() {
        let f = forwarder().with_base_url("http://127.0.0.1:8821");
        let url = f.endpoint_url(&account_with_url(None), "/v1/messages");
        assert_eq!(url, "http://127.0.0.1:8821/v1/messages");
    }
}
