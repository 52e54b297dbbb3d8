// dashboard: reconciles reflector telemetry into live sessions and fans the
// stream out to WebSocket subscribers.

use clap::Parser;
use dashboard::clock::SystemClock;
use dashboard::{config, engine, http, ingest, Engine, Hub, Store};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "dashboard", version, about = "URF reflector live dashboard")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "dashboard.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "dashboard starting");

    let cfg = match config::load_config_from_path(&args.config) {
        Ok(cfg) => {
            info!(reflector = %cfg.reflector.name, addr = %cfg.server.addr, "config loaded");
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let store = match Store::open(std::path::Path::new(&cfg.server.db_path)) {
        Ok(store) => Arc::new(Mutex::new(store)),
        Err(e) => {
            eprintln!("FATAL: failed to open store: {e}");
            std::process::exit(1);
        }
    };

    let hub = Hub::new();
    let engine = Engine::new(store.clone(), hub.clone(), Arc::new(SystemClock));

    // Without the publisher there is nothing to reconcile; only the very
    // first connect is fatal, later drops reconnect with backoff.
    let upstream = match ingest::connect(&cfg.server.upstream_addr).await {
        Ok(socket) => socket,
        Err(e) => {
            eprintln!(
                "FATAL: failed to connect to upstream {}: {e}",
                cfg.server.upstream_addr
            );
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ingest_task = tokio::spawn(ingest::run_ingest(
        cfg.server.upstream_addr.clone(),
        upstream,
        engine.clone(),
        shutdown_rx.clone(),
    ));
    let sweep_task = tokio::spawn(engine::run_safety_net(engine.clone(), shutdown_rx));

    let app = http::router(http::AppState {
        hub,
        store,
        reflector: cfg.reflector.clone(),
        history_limit: cfg.history.limit,
    });
    let listener = match tokio::net::TcpListener::bind(&cfg.server.addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("FATAL: failed to bind {}: {e}", cfg.server.addr);
            std::process::exit(1);
        }
    };
    info!(addr = %cfg.server.addr, "http server listening");

    let serve = axum::serve(listener, app).with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
    });
    if let Err(e) = serve.await {
        error!(error = %e, "http server failed");
    }

    // Teardown order: ingestion first, then the safety net; hub and store go
    // down with their last handles. In-flight sessions are left open — the
    // recovery path reconciles them on next startup.
    let _ = shutdown_tx.send(true);
    let _ = ingest_task.await;
    let _ = sweep_task.await;
    info!("dashboard stopped");
}
