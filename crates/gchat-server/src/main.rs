mod cleanup;
mod config;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderName, HeaderValue, Method, header};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use gchat_api::mailer::LogMailer;
use gchat_api::rate_limit::{self, RateLimiter};
use gchat_api::{AppStateInner, router};
use gchat_db::{Database, Store};

use crate::config::{Config, Environment};

const LIMITER_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const LIMITER_MAX_IDLE: Duration = Duration::from_secs(180);
const TOKEN_PURGE_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gchat=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env();
    info!(?config, "Loaded configuration");
    if config.environment == Environment::Production && config.cors_trusted_origins.is_empty() {
        warn!("No trusted CORS origins configured; browsers will be refused");
    }

    let db = Database::open(&config.db_path)?;
    let store = Store::new(db, config.db_timeout);

    let shutdown = CancellationToken::new();
    let tasks = TaskTracker::new();
    let limiter = RateLimiter::new(config.limiter);

    let state = Arc::new(AppStateInner {
        store: store.clone(),
        mailer: Arc::new(LogMailer::new(config.mailer_sender.clone())),
        limiter: limiter.clone(),
        tasks: tasks.clone(),
    });

    tasks.spawn(rate_limit::run_sweep(
        limiter,
        LIMITER_SWEEP_INTERVAL,
        LIMITER_MAX_IDLE,
        shutdown.clone(),
    ));
    tasks.spawn(cleanup::run_token_purge(
        store,
        TOKEN_PURGE_INTERVAL,
        shutdown.clone(),
    ));

    let app = router(state)
        .layer(cors_layer(&config.cors_trusted_origins))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    info!("gchat server listening on {}", config.addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
    .await?;

    // Stop background loops, then let pending mail drain.
    shutdown.cancel();
    tasks.close();
    tasks.wait().await;
    info!("gchat server stopped");

    Ok(())
}

fn cors_layer(trusted_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = trusted_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring malformed CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([
            Method::OPTIONS,
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_headers([header::AUTHORIZATION, HeaderName::from_static("content-type")])
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = shutdown.cancelled() => {},
    }

    info!("Shutdown signal received");
    shutdown.cancel();
}
