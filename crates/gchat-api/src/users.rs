use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;

use gchat_db::{NewUser, StoreError};
use gchat_types::api::{ActivateRequest, RegisterRequest, UserResponse};
use gchat_types::models::TokenScope;
use gchat_types::validator::{
    ValidationErrors, validate_bio, validate_email, validate_password_plaintext,
    validate_token_plaintext, validate_username,
};

use crate::AppState;
use crate::auth::hash_password;
use crate::error::{ApiError, ApiResult};
use crate::mailer::{activation_mail, dispatch};

/// POST /users: register an inactive account and mail out an activation
/// token.
pub async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(req) = payload?;

    let mut v = ValidationErrors::new();
    validate_username(&mut v, &req.username);
    validate_email(&mut v, &req.email);
    validate_bio(&mut v, req.bio.as_deref());
    validate_password_plaintext(&mut v, &req.password);
    v.into_result()?;

    let password = req.password;
    let password_hash = tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|e| ApiError::Internal(format!("password hash task failed: {e}")))??;

    let new = NewUser {
        username: req.username,
        email: req.email,
        bio: req.bio,
        password_hash,
    };
    let (user, token) = state.store.run(move |db| db.register_user(&new)).await?;

    info!(user_id = %user.id, "Registered user");
    dispatch(&state.tasks, state.mailer.clone(), activation_mail(&user, &token));

    Ok((StatusCode::CREATED, Json(UserResponse { user })))
}

/// POST /users/account/activate
pub async fn activate(
    State(state): State<AppState>,
    payload: Result<Json<ActivateRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(req) = payload?;

    let mut v = ValidationErrors::new();
    validate_token_plaintext(&mut v, &req.token);
    v.into_result()?;

    let user = state
        .store
        .run(move |db| {
            let mut user = db.user_for_token(&req.token, TokenScope::Activation)?;
            db.activate_user(&mut user)?;
            Ok(user)
        })
        .await
        .map_err(|e| match e {
            StoreError::NotFound => ApiError::field("token", "invalid or expired activation token"),
            other => other.into(),
        })?;

    info!(user_id = %user.id, "Activated user");
    Ok(Json(UserResponse { user }))
}
