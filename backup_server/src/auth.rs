use crate::session::validate_session;
use crate::state::AppState;
use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use vault_core::metadata::UserId;

#[derive(Debug)]
pub enum AuthError {
    MissingToken,
    InvalidFormat,
    InvalidOrExpired,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingToken => (StatusCode::UNAUTHORIZED, "missing bearer token"),
            AuthError::InvalidFormat => (StatusCode::BAD_REQUEST, "invalid authorization header"),
            AuthError::InvalidOrExpired => (StatusCode::UNAUTHORIZED, "invalid or expired session"),
        };
        (status, Json(ErrorResponse { success: false, message: message.to_string() })).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    message: String,
}

/// Extracted on every authenticated route: the caller's user id, recovered
/// from a bearer token validated against that user's own token key.
#[derive(Debug, Clone, Copy)]
pub struct AuthContext {
    pub user: UserId,
}

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthContext {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .ok_or(AuthError::MissingToken)?
            .to_str()
            .map_err(|_| AuthError::InvalidFormat)?;
        let token = header.strip_prefix("Bearer ").ok_or(AuthError::InvalidFormat)?;

        let now_ms = crate::now_ms();
        let user = validate_session(&state.metadata, token, now_ms).map_err(|_| AuthError::InvalidOrExpired)?;
        Ok(AuthContext { user })
    }
}
