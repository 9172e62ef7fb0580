use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use eyre::WrapErr;

use clearnode::config::Config;
use clearnode::msg_cache::MessageCache;
use clearnode::notifier::Notifier;
use clearnode::rpc::auth::{ChallengeStore, JwtIssuer};
use clearnode::rpc::hub::ConnectionHub;
use clearnode::rpc::node::AppState;
use clearnode::session_keys::SessionKeyStore;
use clearnode::signer::Signer;
use clearnode::{db, events, metrics, rpc, worker};

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    tracing::info!("Starting Clearnode broker");

    let cfg = Config::load()?;
    tracing::info!(
        blockchains = cfg.blockchains.len(),
        assets = cfg.assets.len(),
        mode = ?cfg.mode,
        "Configuration loaded"
    );

    let db = db::create_pool(&cfg.database_url).await?;
    tracing::info!("Database connected");

    db::run_migrations(&db).await?;
    tracing::info!("Database migrations complete");

    // Sync the configured asset catalog into the assets table.
    for token in &cfg.assets {
        db::upsert_asset(
            &db,
            &db::Asset {
                symbol: token.symbol.clone(),
                chain_id: token.chain_id as i64,
                token: token.address.to_lowercase(),
                decimals: token.decimals as i16,
            },
        )
        .await?;
    }

    let broker = Arc::new(Signer::new(&cfg.broker_private_key).wrap_err("Invalid broker key")?);
    tracing::info!(broker_address = %broker.address(), "Broker signer initialized");

    // A chain endpoint reporting the wrong chain id is fatal at boot.
    for chain in &cfg.blockchains {
        events::verify_chain_id(chain)
            .await
            .wrap_err_with(|| format!("chain id verification failed for {}", chain.name))?;
        tracing::info!(chain = %chain.name, chain_id = chain.id, "Chain endpoint verified");
    }

    let session_keys = SessionKeyStore::new(db.clone());
    session_keys.load_from_db().await?;

    let hub = Arc::new(ConnectionHub::new());
    let notifier = Notifier::new(hub.clone(), broker.clone());
    let jwt = JwtIssuer::from_broker_key(&broker.key_bytes())?;

    let state = Arc::new(AppState {
        msg_cache: MessageCache::new(cfg.msg_expiry),
        challenges: ChallengeStore::default(),
        jwt,
        notifier,
        session_keys,
        signer: broker,
        hub,
        db: db.clone(),
        cfg,
    });

    // Shutdown plumbing: signal task fans out to the worker and the listener.
    let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    let (http_shutdown_tx, mut http_shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(()).await;
        let _ = http_shutdown_tx.send(()).await;
    });

    // Metrics server
    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], state.cfg.metrics_port));
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(metrics_addr).await {
            tracing::error!(error = %e, "Metrics server error");
        }
    });

    // One listener per (chain, custody contract)
    let mut listeners = tokio::task::JoinSet::new();
    for chain in state.cfg.blockchains.clone() {
        let state = state.clone();
        listeners.spawn(async move { events::run_listener(state, chain).await });
    }

    // Action worker
    let worker_state = state.clone();
    let worker_handle =
        tokio::spawn(async move { worker::run_action_worker(worker_state, shutdown_rx).await });

    // Main HTTP listener: the WebSocket RPC channel and a health probe.
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .with_state(state.clone());
    let http_addr = SocketAddr::from(([0, 0, 0, 0], state.cfg.http_port));
    let listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .wrap_err_with(|| format!("Failed to bind {http_addr}"))?;
    tracing::info!(%http_addr, "RPC server started");

    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = http_shutdown_rx.recv().await;
    });

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!(error = %e, "RPC server error");
            }
        }
        Some(result) = listeners.join_next() => {
            match result {
                Ok(Ok(())) => tracing::error!("A listener exited unexpectedly"),
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "Listener stopped with error");
                    return Err(e);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Listener task panicked");
                    return Err(eyre::eyre!("listener task panicked: {e}"));
                }
            }
        }
        result = worker_handle => {
            if let Ok(Err(e)) = result {
                tracing::error!(error = %e, "Action worker error");
            }
        }
    }

    listeners.abort_all();
    tracing::info!("Clearnode broker stopped");
    Ok(())
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| rpc::node::handle_socket(state, socket))
}

async fn healthz() -> &'static str {
    "OK"
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default = std::env::var("CLEARNODE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{default},clearnode={default}")));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
