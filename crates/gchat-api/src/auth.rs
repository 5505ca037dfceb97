use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;

use gchat_db::StoreError;
use gchat_types::api::{TokenRequest, TokenResponse};
use gchat_types::models::TokenScope;
use gchat_types::validator::{ValidationErrors, validate_email, validate_password_plaintext};

use crate::AppState;
use crate::error::{ApiError, ApiResult};

/// Hash with Argon2id into a PHC string.
pub fn hash_password(plaintext: &str) -> ApiResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Ok(Argon2::default()
        .hash_password(plaintext.as_bytes(), &salt)?
        .to_string())
}

/// `Ok(false)` on a mismatch; `Err` only when the stored hash is unreadable.
pub fn verify_password(plaintext: &str, hash: &str) -> ApiResult<bool> {
    let parsed = PasswordHash::new(hash)?;
    match Argon2::default().verify_password(plaintext.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// POST /auth/token: exchange email and password for an access token.
pub async fn create_access_token(
    State(state): State<AppState>,
    payload: Result<Json<TokenRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(req) = payload?;

    let mut v = ValidationErrors::new();
    validate_email(&mut v, &req.email);
    validate_password_plaintext(&mut v, &req.password);
    v.into_result()?;

    let email = req.email.clone();
    let creds = match state
        .store
        .run(move |db| db.get_credentials_by_email(&email))
        .await
    {
        Ok(creds) => creds,
        Err(StoreError::NotFound) => return Err(ApiError::InvalidCredentials),
        Err(e) => return Err(e.into()),
    };

    let password = req.password;
    let hash = creds.password_hash;
    let matches = tokio::task::spawn_blocking(move || verify_password(&password, &hash))
        .await
        .map_err(|e| ApiError::Internal(format!("password check task failed: {e}")))??;
    if !matches {
        return Err(ApiError::InvalidCredentials);
    }

    let user_id = creds.user.id;
    let token = state
        .store
        .run(move |db| db.issue_token(user_id, TokenScope::Access.ttl(), TokenScope::Access))
        .await?;

    info!(user_id = %user_id, "Issued access token");
    Ok((
        StatusCode::CREATED,
        Json(TokenResponse {
            token: token.plaintext,
            expiry: token.expiry,
        }),
    ))
}
