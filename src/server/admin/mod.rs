mod principals;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};

use crate::server::AppState;

pub fn admin_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/principals", post(principals::create_principal))
        .route("/principals", get(principals::list_principals))
        .route("/principals/{id}", get(principals::get_principal))
        .route(
            "/principals/{id}/tokens",
            post(principals::create_principal_token),
        )
}
