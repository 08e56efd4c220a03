use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
    routing::post,
};
use tracing::info;

use crate::auth::RequirePrincipal;
use crate::identity;
use crate::server::AppState;
use crate::server::dto::DownloadRequest;
use crate::server::response::ApiError;
use crate::stream::pg_source::PgCursor;
use crate::stream::{StreamOptions, spawn_download};

pub fn download_router() -> axum::Router<Arc<AppState>> {
    axum::Router::new().route("/download/{database}", post(download))
}

/// Streams a query's result set as a CSV attachment.
///
/// Opening the cursor is the only fallible step before the body starts; any
/// later error truncates the CSV without its trailer row. Nothing past this
/// point touches the catalog store, so a slow client never pins it.
pub async fn download(
    RequirePrincipal { principal, .. }: RequirePrincipal,
    State(state): State<Arc<AppState>>,
    Path(database): Path<String>,
    Json(req): Json<DownloadRequest>,
) -> Result<Response, ApiError> {
    let cfg = state.settings.database(&database)?.clone();

    let source = PgCursor::open(
        &cfg,
        &req.sql,
        req.unfiltered_sql.clone(),
        state.settings.query_timeout_ms,
        state.settings.idle_in_txn_timeout_ms,
        None,
    )
    .await?;

    let database_name = database.clone();
    let options = StreamOptions {
        principal_email: principal.email.clone(),
        database,
        sql_digest: identity::long_digest(&req.sql)[..12].to_string(),
        batch_size: state.settings.batch_size,
        put_timeout: state.settings.query_timeout(),
        metrics: Some(Box::new(move |m| {
            info!(
                database = %database_name,
                rows = m.row_count,
                rows_filtered = m.row_count_filtered,
                columns = m.column_count,
                columns_filtered = m.column_count_filtered,
                bytes = m.bytes_downloaded,
                "download metrics"
            );
        })),
    };

    let body = Body::from_stream(spawn_download(Box::new(source), options));

    Ok((
        [
            (header::CONTENT_TYPE, "text/csv".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", sanitise_filename(&req.filename)),
            ),
        ],
        body,
    )
        .into_response())
}

/// Keeps the attachment filename inside one quoted header token.
fn sanitise_filename(filename: &str) -> String {
    filename
        .chars()
        .filter(|c| !c.is_control() && *c != '"' && *c != '\\')
        .collect()
}
