mod config;
mod dest_adapter;
mod error;
mod health;
mod indexer;
mod mirror_worker;
mod model;
mod relayer;
mod source_adapter;
mod store;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderValue};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::BridgeConfig;
use crate::dest_adapter::LucidStyleDestAdapter;
use crate::health::{health, status, HealthState};
use crate::indexer::Indexer;
use crate::mirror_worker::MirrorWorker;
use crate::relayer::Relayer;
use crate::source_adapter::UtxorpcSourceAdapter;
use crate::store::SqliteStore;

const STATUS_REPORT_WARMUP_SECS: u64 = 5;
const STATUS_REPORT_INTERVAL_SECS: u64 = 30;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bridge_relay=info,tower_http=info".into()),
        )
        .init();

    let config = match BridgeConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[bridge-relay] configuration error: {e}");
            std::process::exit(1);
        }
    };

    if config.allowed_origins.is_empty() {
        if cfg!(debug_assertions) {
            warn!("BRIDGE_ALLOWED_ORIGINS not set — using permissive CORS (dev mode only)");
        } else {
            eprintln!("[bridge-relay] FATAL: BRIDGE_ALLOWED_ORIGINS must be set in production builds");
            std::process::exit(1);
        }
    }

    info!(
        source_network = %config.source_network_name,
        dest_network = %config.dest_network_name,
        deposit_addresses = config.source_deposit_addresses.len(),
        retry_attempts = config.retry_attempts,
        "starting bridge-relay"
    );

    let config = Arc::new(config);

    // Boot order: Durable Store -> Relayer -> Source Adapter -> Mirror
    // Worker (background) -> Indexer (blocks on its infinite loop).
    let store = match store::build_sqlite_store(&config.store_path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("[bridge-relay] could not open durable store: {e}");
            std::process::exit(1);
        }
    };

    let (relayer, mirror_rx) = Relayer::new(store.clone(), config.clone());
    let relayer = Arc::new(relayer);

    if let Err(e) = relayer.reemit_pending_on_boot().await {
        error!(error = %e, "failed to re-emit pending mirrors on boot");
    }

    let source_adapter = match UtxorpcSourceAdapter::connect(
        &config.source_utxorpc_url,
        config.source_utxorpc_api_key.clone(),
    )
    .await
    {
        Ok(a) => Arc::new(a),
        Err(e) => {
            eprintln!("[bridge-relay] could not connect source adapter: {e}");
            std::process::exit(1);
        }
    };

    let dest_adapter = match LucidStyleDestAdapter::connect(
        &config.dest_utxorpc_url,
        &config.dest_sender_wallet_seed,
    )
    .await
    {
        Ok(a) => Arc::new(a),
        Err(e) => {
            eprintln!("[bridge-relay] could not connect destination adapter: {e}");
            std::process::exit(1);
        }
    };

    let mirror_worker = Arc::new(MirrorWorker::new(dest_adapter, relayer.clone(), config.clone()));
    {
        let mirror_worker = mirror_worker.clone();
        tokio::spawn(async move {
            // Mirror Worker failures are retried forever by its own
            // internal retry-via-status-update loop; this task only
            // ends when the subscriber channel closes at shutdown.
            mirror_worker.run(mirror_rx).await;
        });
    }

    spawn_status_reporter(relayer.clone());

    let health_state = Arc::new(HealthState {
        relayer: relayer.clone(),
    });
    let http_handle = spawn_health_server(config.clone(), health_state);

    let mut indexer = Indexer::new(source_adapter, relayer.clone(), config.clone());
    let indexer_result = tokio::select! {
        result = indexer.run() => result,
        _ = shutdown_signal() => {
            info!("shutdown signal received before indexer exited");
            Ok(())
        }
    };

    if let Err(e) = indexer_result {
        error!(error = %e, "indexer failed fatally, shutting down");
    }

    info!("draining in-flight mirror attempts");
    mirror_worker.drain().await;

    if let Err(e) = relayer.persist_state().await {
        error!(error = %e, "failed to persist relayer state on shutdown");
    }
    if let Err(e) = store.close().await {
        error!(error = %e, "failed to close durable store on shutdown");
    }

    let _ = http_handle.await;
    info!("bridge-relay shut down");
}

fn spawn_status_reporter<S: store::DurableStore>(relayer: Arc<Relayer<S>>) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(STATUS_REPORT_WARMUP_SECS)).await;
        let mut interval = tokio::time::interval(Duration::from_secs(STATUS_REPORT_INTERVAL_SECS));
        loop {
            match relayer.get_bridge_state().await {
                Ok(state) => {
                    let most_recent = state
                        .processed_deposits
                        .iter()
                        .max_by_key(|p| p.processed_at)
                        .map(|p| p.mirror_tx_hash.clone());
                    info!(
                        processed_deposits = state.processed_deposits.len(),
                        pending_mirrors = state.pending_mirrors.len(),
                        most_recent_mirror_tx_hash = ?most_recent,
                        "status report"
                    );
                }
                Err(e) => warn!(error = %e, "status report failed to load bridge state"),
            }
            interval.tick().await;
        }
    });
}

fn spawn_health_server<S: store::DurableStore>(
    config: Arc<BridgeConfig>,
    health_state: Arc<HealthState<S>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let cors = if config.allowed_origins.is_empty() {
            CorsLayer::permissive()
        } else {
            let origins: Vec<_> = config
                .allowed_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods([axum::http::Method::GET])
                .allow_headers([header::CONTENT_TYPE])
        };

        let app = Router::new()
            .route("/health", axum::routing::get(health))
            .route("/status", axum::routing::get(status::<S>))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .layer(SetResponseHeaderLayer::overriding(
                header::X_CONTENT_TYPE_OPTIONS,
                HeaderValue::from_static("nosniff"),
            ))
            .layer(SetResponseHeaderLayer::overriding(
                header::X_FRAME_OPTIONS,
                HeaderValue::from_static("DENY"),
            ))
            .with_state(health_state);

        let addr: SocketAddr = format!("{}:{}", config.host, config.port)
            .parse()
            .expect("invalid listen address");

        info!(addr = %addr, "health/status surface listening");
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(error = %e, "failed to bind health/status surface");
                return;
            }
        };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
        {
            error!(error = %e, "health/status server error");
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
