use crate::middleware::ClientIdentity;
use crate::pipeline::{proxy_request, AppState};
use crate::routes::{client_ip, extract_client_headers, extract_proxy_mode, AppError};
use axum::{
    extract::{ConnectInfo, State},
    http::HeaderMap,
    response::Response,
    Extension, Json,
};
use std::net::SocketAddr;
use std::sync::Arc;

pub const MESSAGES_PATH: &str = "/v1/messages";

pub async fn messages(
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
        MESSAGES_PATH,
        body,
    )
    .await
}
