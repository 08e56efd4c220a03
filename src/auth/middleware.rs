use std::sync::Arc;

use axum::{
    Json,
    extract::FromRequestParts,
    http::{StatusCode, header::AUTHORIZATION, request::Parts},
    response::{IntoResponse, Response},
};
use serde_json::json;

use super::helpers::{TokenValidationError, extract_token_from_header, validate_token};
use crate::server::AppState;
use crate::types::{PrincipalRecord, Token};

/// Extractor that requires admin authentication
pub struct RequireAdmin(pub Token);

/// Extractor that requires a principal-scoped token (non-admin)
pub struct RequirePrincipal {
    pub token: Token,
    pub principal: PrincipalRecord,
}

#[derive(Debug)]
pub enum AuthError {
    MissingAuth,
    InvalidScheme,
    InvalidToken,
    TokenExpired,
    NotAdmin,
    NotPrincipal,
    InternalError,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingAuth => (StatusCode::UNAUTHORIZED, "Authentication required"),
            AuthError::InvalidScheme => (StatusCode::UNAUTHORIZED, "Invalid authorization scheme"),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid token"),
            AuthError::TokenExpired => (StatusCode::UNAUTHORIZED, "Token expired"),
            AuthError::NotAdmin => (StatusCode::FORBIDDEN, "Admin access required"),
            AuthError::NotPrincipal => (
                StatusCode::FORBIDDEN,
                "Principal token required for this operation",
            ),
            AuthError::InternalError => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };

        let body = json!({ "data": null, "error": message });

        let mut response = (status, Json(body)).into_response();

        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                "WWW-Authenticate",
                "Bearer realm=\"datagate\"".parse().unwrap(),
            );
        }

        response
    }
}

impl FromRequestParts<Arc<AppState>> for RequireAdmin {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let validated = extract_and_validate_token(parts, state)?;

        if !validated.token.is_admin {
            return Err(AuthError::NotAdmin);
        }

        Ok(RequireAdmin(validated.token))
    }
}

impl FromRequestParts<Arc<AppState>> for RequirePrincipal {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let validated = extract_and_validate_token(parts, state)?;

        if validated.token.is_admin {
            return Err(AuthError::NotPrincipal);
        }

        let principal = validated.principal.ok_or(AuthError::NotPrincipal)?;

        Ok(RequirePrincipal {
            token: validated.token,
            principal,
        })
    }
}

fn extract_and_validate_token(
    parts: &mut Parts,
    state: &Arc<AppState>,
) -> Result<super::helpers::ValidatedToken, AuthError> {
    let auth_header = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let raw_token = extract_token_from_header(auth_header)
        .map_err(|e| match e {
            TokenValidationError::InvalidScheme => AuthError::InvalidScheme,
            TokenValidationError::InvalidToken => AuthError::InvalidToken,
            _ => AuthError::InternalError,
        })?
        .ok_or(AuthError::MissingAuth)?;

    validate_token(state, &raw_token).map_err(|e| match e {
        TokenValidationError::InvalidScheme => AuthError::InvalidScheme,
        TokenValidationError::InvalidToken => AuthError::InvalidToken,
        TokenValidationError::TokenExpired => AuthError::TokenExpired,
        TokenValidationError::InternalError => AuthError::InternalError,
    })
}
