use crate::db::{self, DbPool};
use crate::middleware::ClientIdentity;
use crate::routes::AppError;
use axum::{
    body::Body,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use ccproxy_core::{
    generate_session_hash, Account, AccountStore, ConcurrencyManager, ProxyError, ProxyMode,
    RateDecision, RateLimiter, RetryExecutor, Scheduler, SlotGuard,
};
use ccproxy_upstream::{
    extract_usage_from_chunk, usage_from_value, ByteStream, ClientHeaders, UpstreamForwarder,
    UsageTotals,
};
use chrono::Utc;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct AppState {
    pub store: Arc<dyn AccountStore>,
    pub scheduler: Arc<Scheduler>,
    pub concurrency: Arc<ConcurrencyManager>,
    pub ratelimit: Arc<RateLimiter>,
    pub pool: Arc<ccproxy_core::ClientPool>,
    pub forwarder: Arc<UpstreamForwarder>,
    pub executor: Arc<RetryExecutor>,
    pub db: Option<DbPool>,
}

enum RelayOutcome {
    Json(serde_json::Value),
    Stream(ByteStream),
}

/// What one executor attempt hands back: the upstream outcome plus the
/// account slot, which stays held until the response (streamed bodies
/// included) is done.
struct Forwarded {
    outcome: RelayOutcome,
    account_slot: SlotGuard,
}

/// The admission path shared by both inbound dialects, in strict order:
/// rate gate, user slot, sticky hash, candidate load, retry executor,
/// response streaming. Auth has already run in the middleware.
pub async fn proxy_request(
    state: Arc<AppState>,
    identity: ClientIdentity,
    client_ip: String,
    proxy_mode: Option<ProxyMode>,
    client_headers: ClientHeaders,
    path: &'static str,
    body: serde_json::Value,
) -> Result<Response, AppError> {
    let request_id = Uuid::new_v4();
    let model = body
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or("unknown")
        .to_string();
    let is_stream = body
        .get("stream")
        .and_then(|s| s.as_bool())
        .unwrap_or(false);

    info!(
        request_id = %request_id,
        user_id = %identity.user_id,
        model = %model,
        stream = is_stream,
        path = path,
        "Received proxy request"
    );

    let decision = state
        .ratelimit
        .check_all(&identity.user_id, None, &client_ip);
    if !decision.allowed {
        info!(
            request_id = %request_id,
            user_id = %identity.user_id,
            scope = decision.scope,
            "Request rate limited"
        );
        return Ok(rate_limited_response(&decision));
    }

    let user_slot = state
        .concurrency
        .acquire_user(&identity.user_id, None)
        .await
        .map_err(AppError)?;

    let session_hash = generate_session_hash(&body);

    let now = Utc::now();
    let candidates: Vec<Account> = state
        .store
        .list_accounts()
        .await
        .map_err(AppError)?
        .into_iter()
        .filter(|a| a.is_schedulable(now) && a.kind.compatible_with(proxy_mode))
        .collect();

    if candidates.is_empty() {
        warn!(request_id = %request_id, "No schedulable accounts for request");
        return Err(AppError(ProxyError::NoAvailableAccounts));
    }

    let candidates = Arc::new(candidates);
    let body = Arc::new(body);

    let select_scheduler = state.scheduler.clone();
    let select_candidates = candidates.clone();
    let select_hash = session_hash.clone();
    let select = move |excluded: HashSet<String>| {
        let scheduler = select_scheduler.clone();
        let candidates = select_candidates.clone();
        let hash = select_hash.clone();
        async move { scheduler.select(&candidates, hash.as_deref(), &excluded) }
    };

    let op_state = state.clone();
    let op_headers = client_headers.clone();
    let op_body = body.clone();
    let op = move |account: Account| {
        let state = op_state.clone();
        let headers = op_headers.clone();
        let body = op_body.clone();
        async move {
            let account_slot = state
                .concurrency
                .acquire_account(&account.id, account.max_concurrency, None)
                .await?;

            let gate = state.ratelimit.check_account(&account.id);
            if !gate.allowed {
                return Err(ProxyError::AccountWindowExhausted {
                    retry_after_secs: gate.retry_after.as_secs().max(1),
                });
            }

            let outcome = if is_stream {
                RelayOutcome::Stream(
                    state
                        .forwarder
                        .forward_stream(&account, path, &body, &headers)
                        .await?,
                )
            } else {
                RelayOutcome::Json(
                    state
                        .forwarder
                        .forward(&account, path, &body, &headers)
                        .await?,
                )
            };

            Ok(Forwarded {
                outcome,
                account_slot,
            })
        }
    };

    let execution = state.executor.execute(select, op).await.map_err(AppError)?;

    info!(
        request_id = %request_id,
        account_id = %execution.account_id,
        attempts = execution.attempts,
        switches = execution.switches,
        elapsed_ms = execution.elapsed.as_millis() as u64,
        sticky = session_hash.is_some(),
        "Upstream exchange succeeded"
    );

    let Forwarded {
        outcome,
        account_slot,
    } = execution.value;

    match outcome {
        RelayOutcome::Json(value) => {
            if let (Some(db), Some(usage)) = (&state.db, usage_from_value(&value)) {
                record_usage(
                    db,
                    &identity.token_hash,
                    &execution.account_id,
                    &model,
                    &usage,
                )
                .await;
            }
            drop(account_slot);
            drop(user_slot);
            Ok(Json(value).into_response())
        }
        RelayOutcome::Stream(stream) => Ok(stream_response(
            state.db.clone(),
            stream,
            account_slot,
            user_slot,
            identity.token_hash,
            execution.account_id,
            model,
            request_id,
        )),
    }
}

/// Bridges the upstream SSE stream to the client, recording TTFT on the
/// first chunk and usage at the end. The slots ride inside the task so
/// they release exactly when the streamed body completes or the client
/// disconnects.
#[allow(clippy::too_many_arguments)]
fn stream_response(
    db: Option<DbPool>,
    stream: ByteStream,
    account_slot: SlotGuard,
    user_slot: SlotGuard,
    token_hash: String,
    account_id: String,
    model: String,
    request_id: Uuid,
) -> Response {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(32);

    tokio::spawn(async move {
        // Locals drop in reverse order: the account slot releases
        // before the user slot.
        let _user_slot = user_slot;
        let _account_slot = account_slot;

        let mut stream = stream;
        let mut totals = UsageTotals::default();
        let started = Instant::now();
        let mut saw_first_chunk = false;

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    if !saw_first_chunk {
                        saw_first_chunk = true;
                        debug!(
                            request_id = %request_id,
                            account_id = %account_id,
                            ttft_ms = started.elapsed().as_millis() as u64,
                            "First upstream token"
                        );
                    }

                    if let Some(usage) = extract_usage_from_chunk(&bytes) {
                        totals.merge_max(&usage);
                    }

                    if tx.send(Ok(bytes)).await.is_err() {
                        debug!(request_id = %request_id, "Client disconnected mid-stream");
                        break;
                    }
                }
                Err(e) => {
                    error!(request_id = %request_id, error = %e, "Upstream stream error");
                    break;
                }
            }
        }

        if totals.observed() {
            if let Some(db) = &db {
                record_usage(db, &token_hash, &account_id, &model, &totals).await;
            }
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap()
}

async fn record_usage(
    db: &DbPool,
    token_hash: &str,
    account_id: &str,
    model: &str,
    usage: &UsageTotals,
) {
    if let Err(e) = db::record_usage(
        db,
        token_hash,
        account_id,
        model,
        usage.input_tokens,
        usage.output_tokens,
        usage.cache_creation_input_tokens.unwrap_or(0),
        usage.cache_read_input_tokens.unwrap_or(0),
    )
    .await
    {
        warn!(account_id = %account_id, error = %e, "Failed to record usage");
    }
}

fn rate_limited_response(decision: &RateDecision) -> Response {
    let retry_after_secs = decision.retry_after.as_secs().max(1);
    let body = serde_json::json!({
        "type": "error",
        "error": {
            "type": "rate_limited",
            "message": format!(
                "Rate limited ({} scope). Retry after {} seconds.",
                decision.scope, retry_after_secs
            )
        }
    });

    Response::builder()
        .status(StatusCode::TOO_MANY_REQUESTS)
        .header(header::RETRY_AFTER, retry_after_secs.to_string())
        .header("X-RateLimit-Limit", decision.limit.to_string())
        .header("X-RateLimit-Remaining", decision.remaining.to_string())
        .header("X-RateLimit-Reset", decision.reset_at.timestamp().to_string())
        .header("X-RateLimit-Scope", decision.scope)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}
