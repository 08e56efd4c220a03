use std::sync::Arc;

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use tracing::warn;

use crate::auth::RequirePrincipal;
use crate::catalog::projection;
use crate::identity;
use crate::server::AppState;
use crate::server::dto::{
    CredentialFailure, IssueCredentialsRequest, IssueCredentialsResponse, TableResponse,
};
use crate::server::response::{ApiError, ApiResponse, StoreResultExt};

pub fn access_router() -> axum::Router<Arc<AppState>> {
    axum::Router::new()
        .route("/tables", get(list_tables))
        .route("/credentials", post(issue_credentials))
}

/// The source tables the caller may currently read, per the catalog.
pub async fn list_tables(
    RequirePrincipal { principal, .. }: RequirePrincipal,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let refs = projection::allowed_tables(state.store.as_ref(), &principal)
        .api_err("Failed to compute allowed tables")?;

    let tables: Vec<TableResponse> = refs
        .into_iter()
        .map(|r| TableResponse {
            database: r.database,
            schema: r.schema,
            table: r.table,
        })
        .collect();

    Ok::<_, ApiError>(Json(ApiResponse::success(tables)))
}

/// Reconciles every reachable database and hands back fresh login
/// credentials. Partial failure is a 201 with the failing databases listed;
/// no readable tables at all is a 403.
pub async fn issue_credentials(
    RequirePrincipal { principal, .. }: RequirePrincipal,
    State(state): State<Arc<AppState>>,
    Json(req): Json<IssueCredentialsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let allowed = projection::allowed_tables(state.store.as_ref(), &principal)
        .api_err("Failed to compute allowed tables")?;

    let suffix = req.suffix.unwrap_or_default();
    let ephemeral_user = identity::ephemeral_user_name(&principal.email, &suffix)?;

    let outcome = state
        .reconciler
        .issue_credentials(
            &principal,
            &allowed,
            &ephemeral_user,
            state.settings.credential_valid_for(),
            &state.settings.force_databases,
        )
        .await?;

    // Publish failures never invalidate the Postgres state already applied.
    let digest = identity::long_digest(&principal.external_id);
    for credentials in &outcome.credentials {
        if let Err(e) = state.publisher.publish(&digest, credentials).await {
            warn!(
                "publishing credentials for '{}' failed: {e}",
                credentials.memorable_name
            );
        }
    }

    let response = IssueCredentialsResponse {
        credentials: outcome.credentials,
        failures: outcome
            .failures
            .into_iter()
            .map(|(database, error)| CredentialFailure {
                database,
                error: error.to_string(),
            })
            .collect(),
    };

    Ok((StatusCode::CREATED, Json(ApiResponse::success(response))))
}
