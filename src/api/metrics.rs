//! Prometheus text-exposition endpoint, rendered from the handle installed
//! at startup (§ ambient metrics stack).

use crate::state::AppState;
use axum::extract::State;
use std::sync::Arc;

pub async fn metrics(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}
