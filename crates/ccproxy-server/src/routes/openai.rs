use crate::middleware::ClientIdentity;
use crate::pipeline::{proxy_request, AppState};
use crate::routes::{client_ip, extract_client_headers, extract_proxy_mode, AppError};
use axum::{
    extract::{ConnectInfo, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    Extension, Json,
};
use std::net::SocketAddr;
use std::sync::Arc;

pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<ClientIdentity>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, AppError> {
    proxy_request(
        state,
        identity,
        client_ip(&headers, &addr),
        extract_proxy_mode(&headers),
        extract_client_headers(&headers),
        CHAT_COMPLETIONS_PATH,
        body,
    )
    .await
}

pub async fn models() -> impl IntoResponse {
    Json(serde_json::json!({
        "object": "list",
        "data": [
            {"id": "claude-sonnet-4-20250514", "object": "model", "created": 1704067200, "owned_by": "anthropic"},
            {"id": "claude-opus-4-20250514", "object": "model", "created": 1704067200, "owned_by": "anthropic"},
            {"id": "claude-3-5-sonnet-20241022", "object": "model", "created": 1704067200, "owned_by": "anthropic"},
            {"id": "claude-3-5-haiku-20241022", "object": "model", "created": 1704067200, "owned_by": "anthropic"}
        ]
    }))
}
