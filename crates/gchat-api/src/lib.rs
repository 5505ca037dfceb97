//! HTTP surface of gchat: identity gate, handlers and the router.

pub mod auth;
pub mod conversations;
pub mod error;
pub mod identity;
pub mod mailer;
pub mod messages;
pub mod rate_limit;
pub mod users;

use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{get, post},
};
use tokio_util::task::TaskTracker;

use gchat_db::Store;

use crate::mailer::Mailer;
use crate::rate_limit::RateLimiter;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub store: Store,
    pub mailer: Arc<dyn Mailer>,
    pub limiter: RateLimiter,
    /// Background work (mail delivery) that shutdown waits on.
    pub tasks: TaskTracker,
}

/// The full `/api/v1` router. CORS and request tracing are left to the
/// binary so tests can drive the bare routes.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/users", post(users::register))
        .route("/users/account/activate", post(users::activate))
        .route("/auth/token", post(auth::create_access_token));

    let protected_routes = Router::new()
        .route("/conversations", get(conversations::list))
        .route("/conversations/group", post(conversations::create_group))
        .route(
            "/conversations/group/{group_id}/participants",
            post(conversations::add_participant),
        )
        .route(
            "/conversations/private/{other_user_id}/messages",
            get(messages::list_private).post(messages::send_private),
        )
        .route(
            "/conversations/group/{group_id}/messages",
            get(messages::list_group).post(messages::send_group),
        )
        .route_layer(middleware::from_fn(identity::require_activated));

    let api = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(middleware::from_fn_with_state(state.clone(), identity::authenticate))
        .layer(middleware::from_fn_with_state(
            state.limiter.clone(),
            rate_limit::rate_limit_middleware,
        ))
        .with_state(state);

    Router::new().nest("/api/v1", api)
}

async fn healthcheck() -> &'static str {
    "OK"
}
