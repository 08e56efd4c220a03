use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::auth::{RequireAdmin, TokenGenerator};
use crate::server::AppState;
use crate::server::dto::{
    CreatePrincipalRequest, CreatePrincipalTokenRequest, CreateTokenResponse, TokenResponse,
};
use crate::server::response::{ApiError, ApiResponse, StoreOptionExt, StoreResultExt};
use crate::types::{PrincipalRecord, Token};

pub async fn create_principal(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreatePrincipalRequest>,
) -> impl IntoResponse {
    if req.external_id.is_empty() || req.email.is_empty() {
        return Err(ApiError::bad_request("external_id and email are required"));
    }

    let existing = state
        .store
        .get_principal_by_external_id(&req.external_id)
        .api_err("Failed to check existing principal")?;
    if existing.is_some() {
        return Err(ApiError {
            status: StatusCode::CONFLICT,
            message: "Principal already exists for this external id".to_string(),
        });
    }

    let now = Utc::now();
    let principal = PrincipalRecord {
        id: Uuid::new_v4().to_string(),
        external_id: req.external_id,
        email: req.email,
        privileged: req.privileged,
        created_at: now,
        updated_at: now,
    };

    state
        .store
        .create_principal(&principal)
        .api_err("Failed to create principal")?;

    Ok((StatusCode::CREATED, Json(ApiResponse::success(principal))))
}

pub async fn list_principals(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let principals = state
        .store
        .list_principals()
        .api_err("Failed to list principals")?;

    Ok::<_, ApiError>(Json(ApiResponse::success(principals)))
}

pub async fn get_principal(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let principal = state
        .store
        .get_principal(&id)
        .api_err("Failed to get principal")?
        .or_not_found("Principal not found")?;

    Ok::<_, ApiError>(Json(ApiResponse::success(principal)))
}

pub async fn create_principal_token(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<CreatePrincipalTokenRequest>,
) -> impl IntoResponse {
    let principal = state
        .store
        .get_principal(&id)
        .api_err("Failed to get principal")?
        .or_not_found("Principal not found")?;

    if let Some(seconds) = req.expires_in_seconds {
        if seconds < 0 {
            return Err(ApiError::bad_request(
                "expires_in_seconds cannot be negative",
            ));
        }
    }

    let expires_at = req
        .expires_in_seconds
        .map(|s| Utc::now() + Duration::seconds(s));

    let generator = TokenGenerator::new();

    // A lookup collision is a unique-constraint violation; retry with a
    // fresh lookup.
    const MAX_RETRIES: u32 = 3;
    for _ in 0..MAX_RETRIES {
        let (raw_token, lookup, hash) = generator
            .generate()
            .map_err(|_| ApiError::internal("Failed to generate token"))?;

        let now = Utc::now();
        let token = Token {
            id: Uuid::new_v4().to_string(),
            token_hash: hash,
            token_lookup: lookup,
            is_admin: false,
            principal_id: Some(principal.id.clone()),
            created_at: now,
            expires_at,
            last_used_at: None,
        };

        match state.store.create_token(&token) {
            Ok(()) => {
                let metadata = TokenResponse {
                    id: token.id,
                    is_admin: token.is_admin,
                    principal_id: token.principal_id,
                    created_at: token.created_at,
                    expires_at: token.expires_at,
                    last_used_at: token.last_used_at,
                };
                return Ok((
                    StatusCode::CREATED,
                    Json(ApiResponse::success(CreateTokenResponse {
                        token: raw_token,
                        metadata,
                    })),
                ));
            }
            Err(crate::error::Error::Catalog(_)) => continue,
            Err(_) => return Err(ApiError::internal("Failed to create token")),
        }
    }

    Err(ApiError::internal("Failed to create token after retries"))
}
