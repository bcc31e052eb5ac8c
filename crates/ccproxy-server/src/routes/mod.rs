pub mod anthropic;
pub mod openai;

use axum::{
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use ccproxy_core::{ProxyError, ProxyMode};
use ccproxy_upstream::ClientHeaders;
use std::net::SocketAddr;
use tracing::error;

/// Inbound headers passed through to the upstream unchanged. Everything
/// else (auth, host, length) is rebuilt per account.
const FORWARDED_HEADER_KEYS: &[&str] = &[
    "anthropic-beta",
    "x-stainless-retry-count",
    "x-stainless-timeout",
    "x-stainless-lang",
    "x-stainless-package-version",
    "x-stainless-os",
    "x-stainless-arch",
    "x-stainless-runtime",
    "x-stainless-runtime-version",
    "x-app",
    "user-agent",
    "accept-language",
    "accept-encoding",
];

pub fn extract_client_headers(headers: &HeaderMap) -> ClientHeaders {
    let mut client_headers = ClientHeaders::new();

    for key in FORWARDED_HEADER_KEYS {
        if let Some(value) = headers.get(*key) {
            if let Ok(v) = value.to_str() {
                client_headers.insert(key.to_string(), v.to_string());
            }
        }
    }

    client_headers
}

/// `X-Proxy-Mode: web|api` forces the upstream credential family;
/// unknown values are ignored rather than rejected.
pub fn extract_proxy_mode(headers: &HeaderMap) -> Option<ProxyMode> {
    headers
        .get("x-proxy-mode")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Client address for the per-IP rate gate: leftmost X-Forwarded-For
/// entry when present, else the socket peer.
pub fn client_ip(headers: &HeaderMap, addr: &SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| addr.ip().to_string())
}

pub async fn health_check() -> &'static str {
    "OK"
}

pub struct AppError(pub ProxyError);

impl From<ProxyError> for AppError {
    fn from(err: ProxyError) -> Self {
        AppError(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ProxyError::RateLimited { .. }
            | ProxyError::UpstreamRateLimited { .. }
            | ProxyError::QueueFull => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::QueueTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::NoAvailableAccounts | ProxyError::UpstreamOverloaded => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::UpstreamAuth { status, .. }
            | ProxyError::UpstreamClient { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ProxyError::UpstreamServer { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::Network(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::AccountWindowExhausted { .. } => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        error!(error = %self.0, status = %status, "Request failed");

        let mut response = (status, Json(self.0.to_json_error())).into_response();

        let retry_after = match &self.0 {
            ProxyError::RateLimited { retry_after_secs }
            | ProxyError::UpstreamRateLimited { retry_after_secs }
            | ProxyError::AccountWindowExhausted { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        };
        if let Some(secs) = retry_after {
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarded_headers_are_allow_listed() {
        let mut headers = HeaderMap::new();
        headers.insert("user-agent", "test-client/1.0".parse().unwrap());
        headers.insert("authorization", "Bearer secret".parse().unwrap());
        headers.insert("x-custom-header", "nope".parse().unwrap());

        let extracted = extract_client_headers(&headers);
        let keys: Vec<&String> = extracted.iter().map(|(k, _)| k).collect();

        assert_eq!(keys, vec![&"user-agent".to_string()]);
    }

    #[test]
    fn proxy_mode_parses_known_values() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_proxy_mode(&headers), None);

        headers.insert("x-proxy-mode", "web".parse().unwrap());
        assert_eq!(extract_proxy_mode(&headers), Some(ProxyMode::Web));

        headers.insert("x-proxy-mode", "api".parse().unwrap());
        assert_eq!(extract_proxy_mode(&headers), Some(ProxyMode::Api));

        headers.insert("x-proxy-mode", "banana".parse().unwrap());
        assert_eq!(extract_proxy_mode(&headers), None);
    }

    #[test]
    fn client_ip_prefers_forwarded_for() {
        let addr: SocketAddr = "10.0.0.1:9999".parse().unwrap();

        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, &addr), "10.0.0.1");

        headers.insert("x-forwarded-for", "1.2.3.4, 5.6.7.8".parse().unwrap());
        assert_eq!(client_ip(&headers, &addr), "1.2.3.4");
    }

    #[test]
    fn queue_errors_map_to_client_statuses() {
        let full = AppError(ProxyError::QueueFull).into_response();
        assert_eq!(full.status(), StatusCode::TOO_MANY_REQUESTS);

        let timeout = AppError(ProxyError::QueueTimeout).into_response();
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);

        let empty = AppError(ProxyError::NoAvailableAccounts).into_response();
        assert_eq!(empty.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn upstream_rate_limit_carries_retry_after() {
        let response =
            AppError(ProxyError::UpstreamRateLimited { retry_after_secs: 30 }).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            "30"
        );
    }

    #[test]
    fn upstream_auth_status_passes_through() {
        let err = ProxyError::from_upstream(403, None, "forbidden");
        let response = AppError(err).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
