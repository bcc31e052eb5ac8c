mod config;
mod db;
mod middleware;
mod pipeline;
mod routes;
mod tasks;

use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use ccproxy_core::{
    AccountStore, ClientPool, ConcurrencyManager, RateLimiter, RetryExecutor, Scheduler,
    TokenRefresher,
};
use ccproxy_upstream::{OAuthRefresher, UpstreamForwarder};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;
use db::SqliteAccountStore;
use middleware::TokenVerifier;
use pipeline::AppState;

#[derive(Parser)]
#[command(name = "ccproxy")]
#[command(about = "Authenticating multi-account proxy for OpenAI/Anthropic-compatible APIs")]
struct Args {
    #[arg(short, long, default_value = "config.yaml")]
    config: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    init_tracing(&config.server.log_level);

    info!(
        config_path = %args.config,
        mode = %config.server.mode,
        read_timeout_seconds = config.server.read_timeout_seconds,
        write_timeout_seconds = config.server.write_timeout_seconds,
        "Starting ccproxy"
    );

    if config.circuit.enabled {
        warn!(
            "circuit.enabled is set but the legacy breaker is no longer wired; \
             the account state-model timers supersede it"
        );
    }

    let client_pool = match ClientPool::new(config.pool.to_core()) {
        Ok(pool) => Arc::new(pool),
        Err(e) => {
            error!(error = %e, "Failed to build HTTP client pool");
            std::process::exit(1);
        }
    };

    let db_pool = match db::init_database(&config.server.database_path).await {
        Ok(pool) => pool,
        Err(e) => {
            error!(error = %e, "Failed to initialize database");
            std::process::exit(1);
        }
    };

    for account_config in &config.accounts {
        let account = account_config.to_account();
        if let Err(e) = db::upsert_account(&db_pool, &account).await {
            error!(account_id = %account.id, error = %e, "Failed to seed account");
            std::process::exit(1);
        }
    }

    let store: Arc<dyn AccountStore> = Arc::new(SqliteAccountStore::new(db_pool.clone()));

    match store.list_accounts().await {
        Ok(accounts) => {
            let by_kind = |label: &str| {
                accounts
                    .iter()
                    .filter(|a| a.kind.label() == label)
                    .count()
            };
            info!(
                total = accounts.len(),
                oauth = by_kind("oauth"),
                session_cookie = by_kind("session_cookie"),
                api_key = by_kind("api_key"),
                "Loaded accounts"
            );
            if accounts.is_empty() {
                warn!("No accounts in store - all proxy requests will return 503");
            }
        }
        Err(e) => {
            error!(error = %e, "Failed to list accounts");
            std::process::exit(1);
        }
    }

    let concurrency = Arc::new(ConcurrencyManager::new(config.concurrency.to_core()));

    // Validated during config load.
    let scheduler_config = config
        .scheduler
        .to_core()
        .expect("scheduler config validated at load");
    let scheduler = Arc::new(Scheduler::new(scheduler_config, concurrency.clone()));

    let ratelimit = Arc::new(RateLimiter::new(config.ratelimit.to_core()));

    let refresher: Arc<dyn TokenRefresher> = match OAuthRefresher::new() {
        Ok(r) => Arc::new(r),
        Err(e) => {
            error!(error = %e, "Failed to build OAuth refresher");
            std::process::exit(1);
        }
    };

    let executor = Arc::new(RetryExecutor::new(
        config.retry.to_core(),
        store.clone(),
        Some(refresher.clone()),
    ));

    let forwarder = Arc::new(UpstreamForwarder::new(client_pool.clone()));

    let state = Arc::new(AppState {
        store,
        scheduler,
        concurrency,
        ratelimit,
        pool: client_pool,
        forwarder,
        executor,
        db: Some(db_pool),
    });

    tasks::spawn_maintenance(state.clone());
    tasks::spawn_health(state.clone(), config.health.clone(), refresher);

    let verifier = Arc::new(TokenVerifier::new(config.auth.clone()));
    if verifier.is_open() {
        info!("No client credentials configured - all requests are anonymous");
    }

    let app = Router::new()
        .route("/v1/messages", post(routes::anthropic::messages))
        .route("/v1/chat/completions", post(routes::openai::chat_completions))
        .route("/v1/models", get(routes::openai::models))
        .with_state(state.clone())
        .route("/health", get(routes::health_check))
        .layer(axum_middleware::from_fn_with_state(
            verifier,
            middleware::auth_middleware,
        ))
        .layer(TimeoutLayer::new(Duration::from_secs(
            config.server.read_timeout_seconds,
        )))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(address = %addr, error = %e, "Failed to bind listener");
            std::process::exit(1);
        }
    };

    info!(address = %addr, "Server listening");

    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    {
        error!(error = %e, "Server error");
        std::process::exit(1);
    }

    state.concurrency.shutdown();
    state.pool.close();
    info!("Shutdown complete");
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
}

fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false),
        )
        .with(filter)
        .init();
}
