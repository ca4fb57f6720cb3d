//! HTTP surface (§4.9, §6): route dispatch over the shared `AppState`.

pub mod files;
pub mod health;
pub mod metrics;
pub mod uploads;

use crate::state::AppState;
use axum::Router;
use axum::routing::{delete, get, post, put};
use std::sync::Arc;

pub fn router(state: Arc<AppState>) -> Router {
    let upload_routes = Router::new()
        .route("/create", post(uploads::create_upload))
        .route("/{upload_id}/chunk/{index}", put(uploads::upload_chunk))
        .route("/{upload_id}/status", get(uploads::status))
        .route("/{upload_id}/complete", post(uploads::complete))
        .route("/{upload_id}", delete(uploads::cancel));

    let v1 = Router::new()
        .nest("/uploads", upload_routes)
        .nest("/files", files::router());

    Router::new()
        .nest("/v1", v1)
        .route("/health", get(health::health))
        .route("/metrics", get(metrics::metrics))
        .with_state(state)
}
