//! File read routes (§6): metadata/manifest/stream, delegating to the read
//! proxy handlers.

use crate::read_proxy;
use crate::state::AppState;
use axum::Router;
use axum::routing::get;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/{file_id}/metadata", get(read_proxy::metadata))
        .route("/{file_id}/manifest", get(read_proxy::manifest))
        .route("/{file_id}/stream", get(read_proxy::stream).head(read_proxy::stream))
}
