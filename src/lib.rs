pub mod api;
pub mod config;
pub mod error;
pub mod finalize;
pub mod kv;
pub mod models;
pub mod publish_client;
pub mod read_proxy;
pub mod reaper;
pub mod reconciler;
pub mod registry;
pub mod session;
pub mod signer;
pub mod state;
pub mod storage;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

use config::Config;
use finalize::FinalizeEngine;
use kv::{Keyspace, KvStore, RedisKv};
use publish_client::WalrusPublishClient;
use read_proxy::stitcher::AggregatorPool;
use registry::SuiRegistryClient;
use session::SessionService;
use signer::Signer;
use state::AppState;
use std::io::IsTerminal;
use std::sync::Arc;
use storage::ChunkStore;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initializes the tracing subscriber: journald when running as a service
/// (no attached terminal), formatted output otherwise.
pub fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "floe_gateway=info,tower_http=warn".into());

    if std::io::stdout().is_terminal() {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_journald::layer().expect("failed to connect to journald"))
            .init();
    }
}

/// Runs the ingestion gateway end-to-end: validate config → validate tmpDir
/// → connect KV → reconcile orphans → start reaper → mount routes → listen.
pub async fn run_service(config_path: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    tracing::info!("floe-gateway version {}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(config_path)?;
    config.probe_tmp_dir_writable().await?;

    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| format!("failed to install metrics recorder: {e}"))?;

    let kv: Arc<dyn KvStore> = Arc::new(RedisKv::connect(&config.kv.url).await?);
    let keys = Keyspace::new(config.kv.key_prefix.clone());

    let recovered = reconciler::reconcile(&kv, &keys, &config.storage.tmp_dir).await?;
    if recovered > 0 {
        tracing::info!(recovered, "reconciled orphaned upload artifacts at startup");
    }

    let publish_signer = match &config.walrus.signer_secret {
        Some(secret) => Some(Signer::from_secret(secret)?),
        None => None,
    };
    let registry_signer = match &config.walrus.signer_secret {
        Some(secret) => Some(Signer::from_secret(secret)?),
        None => None,
    };

    let sessions = SessionService::new(kv.clone(), &config);
    let chunks = ChunkStore::new(config.storage.tmp_dir.clone());
    let publish_client = Arc::new(WalrusPublishClient::new(&config, publish_signer)?);
    let registry = Arc::new(SuiRegistryClient::new(&config, registry_signer)?);
    let aggregators = Arc::new(AggregatorPool::new(
        config.walrus.aggregator_urls.clone(),
        config.walrus.max_range_bytes,
    )?);

    let finalize_engine = Arc::new(FinalizeEngine::new(
        sessions.clone(),
        chunks.clone(),
        publish_client,
        registry.clone(),
        &config,
    ));

    let reaper = Arc::new(reaper::Reaper::new(kv.clone(), sessions.clone(), chunks.clone(), &config));
    reaper.spawn();

    let state = Arc::new(AppState {
        config: Arc::new(config.clone()),
        kv,
        keys,
        sessions,
        chunks,
        finalize: finalize_engine,
        registry,
        aggregators,
        metrics_handle,
    });

    let app = api::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
