use synchrony::{
    AppState,
    config::{AppConfig, Env},
    create_router, shutdown_signal,
    snapshot::SnapshotStore,
};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// main
///
/// The asynchronous entry point: configuration, logging, snapshot hydration, the HTTP server,
/// and the final snapshot once traffic has drained.
#[tokio::main]
async fn main() {
    // 1. Configuration & Environment Loading (Fail-Fast)
    dotenv::dotenv().ok();
    let config = AppConfig::load().expect("FATAL: invalid configuration");

    // 2. Logging Filter Setup
    // RUST_LOG takes priority; otherwise debug for this crate and info for HTTP traces.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "synchrony=debug,tower_http=info".into());

    // 3. Initialize Logging based on Environment
    match config.env {
        Env::Local => {
            // LOCAL: Pretty print output for human readability.
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
        Env::Production => {
            // PROD: JSON output for log aggregators.
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
    }

    tracing::info!("Application starting in {:?} mode", config.env);

    // 4. Snapshot Hydration
    // Runs before the listener is bound: a corrupt snapshot must stop startup, not be served
    // as an empty registry.
    let store = SnapshotStore::new(&config.data_dir);
    let state = AppState::load(&store, &config).expect("FATAL: failed to load snapshots");
    tracing::info!(
        data_dir = %store.dir().display(),
        credentials = state.credentials.len(),
        projects = state.projects.len(),
        "registries loaded"
    );

    // 5. Router and Server Startup
    let app = create_router(state.clone());
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .expect("FATAL: failed to bind the HTTP listener. Check BIND_ADDR.");
    tracing::info!("Listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("FATAL: HTTP server error");

    // 6. Snapshot on Shutdown
    // Every connection has drained, so no request can mutate a registry mid-save.
    tracing::info!("shutting down, saving snapshots");
    state.persist(&store).expect("FATAL: failed to save snapshots");
}
