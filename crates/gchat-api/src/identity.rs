//! Identity gate: turns the `Authorization` header into an [`Identity`].

use axum::{
    extract::{Request, State},
    http::{HeaderValue, header},
    middleware::Next,
    response::Response,
};

use gchat_db::StoreError;
use gchat_types::models::{TokenScope, User};
use gchat_types::validator::{ValidationErrors, validate_token_plaintext};

use crate::AppState;
use crate::error::{ApiError, ApiResult};

/// Who is making the request. Every request carries one, inserted by
/// [`authenticate`].
#[derive(Debug, Clone)]
pub enum Identity {
    Anonymous,
    Authenticated(User),
}

impl Identity {
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous)
    }

    pub fn user(&self) -> Option<&User> {
        match self {
            Self::Anonymous => None,
            Self::Authenticated(user) => Some(user),
        }
    }
}

/// Pull the token out of an `Authorization` header value. `Ok(None)` when
/// there is no header at all; any other shape is an invalid token.
pub fn bearer_token(value: Option<&HeaderValue>) -> ApiResult<Option<&str>> {
    let Some(value) = value else {
        return Ok(None);
    };

    let value = value.to_str().map_err(|_| ApiError::InvalidToken)?;
    let mut parts = value.split(' ');
    let (Some("Bearer"), Some(token), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(ApiError::InvalidToken);
    };

    let mut v = ValidationErrors::new();
    validate_token_plaintext(&mut v, token);
    if !v.is_empty() {
        return Err(ApiError::InvalidToken);
    }

    Ok(Some(token))
}

/// Resolve a bearer credential against the access-token scope. A token that
/// is well formed but unknown fails the same way as a malformed one.
pub async fn resolve(state: &AppState, value: Option<&HeaderValue>) -> ApiResult<Identity> {
    let Some(token) = bearer_token(value)? else {
        return Ok(Identity::Anonymous);
    };

    let token = token.to_string();
    match state
        .store
        .run(move |db| db.user_for_token(&token, TokenScope::Access))
        .await
    {
        Ok(user) => Ok(Identity::Authenticated(user)),
        Err(StoreError::NotFound) => Err(ApiError::InvalidToken),
        Err(e) => Err(e.into()),
    }
}

/// Middleware run on every route: attaches the caller's [`Identity`].
pub async fn authenticate(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> ApiResult<Response> {
    let identity = resolve(&state, req.headers().get(header::AUTHORIZATION)).await?;
    req.extensions_mut().insert(identity);

    let mut response = next.run(req).await;
    response
        .headers_mut()
        .append(header::VARY, HeaderValue::from_static("Authorization"));
    Ok(response)
}

/// Gate for routes that need an activated account. Anonymous callers get
/// 401, inactive accounts 403. On success the [`User`] itself is inserted
/// for handlers to extract.
pub async fn require_activated(mut req: Request, next: Next) -> ApiResult<Response> {
    let user = match req.extensions().get::<Identity>() {
        None | Some(Identity::Anonymous) => return Err(ApiError::AuthenticationRequired),
        Some(Identity::Authenticated(user)) if !user.is_active => {
            return Err(ApiError::InactiveAccount);
        }
        Some(Identity::Authenticated(user)) => user.clone(),
    };

    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}
