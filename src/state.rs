//! Shared application state, wired once at startup and handed to every
//! route as `axum::extract::State`, the same shape as the teacher's
//! `api::AppState`.

use crate::config::Config;
use crate::finalize::FinalizeEngine;
use crate::kv::{KvStore, Keyspace};
use crate::read_proxy::stitcher::AggregatorPool;
use crate::registry::RegistryClient;
use crate::session::SessionService;
use crate::storage::ChunkStore;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub kv: Arc<dyn KvStore>,
    pub keys: Keyspace,
    pub sessions: SessionService,
    pub chunks: ChunkStore,
    pub finalize: Arc<FinalizeEngine>,
    pub registry: Arc<dyn RegistryClient>,
    pub aggregators: Arc<AggregatorPool>,
    pub metrics_handle: PrometheusHandle,
}
