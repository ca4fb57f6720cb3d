//! Test harness shared by the integration suites, shaped after the
//! teacher's `tests/common::setup_test_app`: a temp-dir-backed gateway
//! wired over in-process fakes instead of a live Redis/Walrus/Sui stack.

use axum::Router;
use floe_gateway::api;
use floe_gateway::config::Config;
use floe_gateway::finalize::FinalizeEngine;
use floe_gateway::kv::{KvStore, Keyspace};
use floe_gateway::read_proxy::stitcher::AggregatorPool;
use floe_gateway::registry::RegistryClient;
use floe_gateway::session::SessionService;
use floe_gateway::state::AppState;
use floe_gateway::storage::ChunkStore;
use floe_gateway::testing::{FakeKvStore, FakePublishClient, FakeRegistryClient};
use std::sync::Arc;
use tempfile::TempDir;

/// Everything a test needs to drive the router directly and still poke at
/// the fakes underneath it (e.g. to assert a mint only happened once).
pub struct TestApp {
    pub router: Router,
    pub state: Arc<AppState>,
    pub _tmp: TempDir,
}

pub async fn setup_test_app() -> TestApp {
    setup_test_app_with(FakePublishClient::succeeding("blob-test"), FakeRegistryClient::succeeding("file-test"))
        .await
}

pub async fn setup_test_app_with(publish: FakePublishClient, registry: FakeRegistryClient) -> TestApp {
    setup_test_app_with_aggregators(publish, registry, vec!["http://aggregator.invalid".to_string()]).await
}

pub async fn setup_test_app_with_aggregators(
    publish: FakePublishClient,
    registry: FakeRegistryClient,
    aggregator_urls: Vec<String>,
) -> TestApp {
    let tmp = TempDir::new().unwrap();

    let mut config = Config::for_tests();
    config.storage.tmp_dir = tmp.path().to_path_buf();
    config.walrus.aggregator_urls = aggregator_urls;
    // Unique prefix per test app so parallel tests sharing a FakeKvStore
    // process never collide on keys.
    config.kv.key_prefix = format!("floe:test:{}", uuid::Uuid::new_v4());

    let kv: Arc<dyn KvStore> = Arc::new(FakeKvStore::new());
    let keys = Keyspace::new(config.kv.key_prefix.clone());

    let sessions = SessionService::new(kv.clone(), &config);
    let chunks = ChunkStore::new(config.storage.tmp_dir.clone());
    let publish_client = Arc::new(publish);
    let registry_client: Arc<dyn RegistryClient> = Arc::new(registry);
    let aggregators = Arc::new(AggregatorPool::new(config.walrus.aggregator_urls.clone(), config.walrus.max_range_bytes).unwrap());

    let finalize = Arc::new(FinalizeEngine::new(
        sessions.clone(),
        chunks.clone(),
        publish_client,
        registry_client.clone(),
        &config,
    ));

    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .build_recorder()
        .handle();

    let state = Arc::new(AppState {
        config: Arc::new(config),
        kv,
        keys,
        sessions,
        chunks,
        finalize,
        registry: registry_client,
        aggregators,
        metrics_handle,
    });

    let router = api::router(state.clone());

    TestApp {
        router,
        state,
        _tmp: tmp,
    }
}
