//! Bearer-token authentication.

use crate::{errors::AppError, services::state::AppState};
use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts},
};

/// Identity of the caller, resolved from `Authorization: Bearer <token>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner(pub String);

impl FromRequestParts<AppState> for Owner {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AppError::unauthorized("missing bearer token"))?;

        match state.tokens.resolve(token).await? {
            Some(owner) => Ok(Owner(owner)),
            None => Err(AppError::unauthorized("invalid token")),
        }
    }
}
