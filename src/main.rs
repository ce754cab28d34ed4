use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chunkhub::api::{self, AppState};
use chunkhub::config::Config;
use chunkhub::db;
use chunkhub::gc::{spawn_loop, Collector};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| Config::log_directives().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    tracing::info!("DATA_DIR = {:?}", config.data_dir);
    tracing::info!("READ_CONCURRENCY = {}", config.read_concurrency);
    tracing::info!("SAVE_CHUNKS = {}", config.save_chunks);
    if config.has_masters() {
        tracing::info!("MASTERS = {:?}", config.masters);
    }

    std::fs::create_dir_all(&config.data_dir).expect("Failed to create data dir");

    let database = db::init_database(&config.db_path)
        .await
        .expect("Failed to initialize database");

    let gc_interval = Duration::from_secs(config.gc_interval_secs.max(1));
    let host = config.host.clone();
    let port = config.port;

    let state = Arc::new(AppState::new(config, database).expect("Failed to build state"));

    let collector = Arc::new(Collector::new(
        Arc::clone(&state.meta),
        Arc::clone(&state.store),
        state.manager.gate().clone(),
    ));
    let _gc = spawn_loop(collector, gc_interval);

    let app = api::router()
        .with_state(state)
        // Whole-file uploads stream through; allow very large bodies.
        .layer(DefaultBodyLimit::max(10 * 1024 * 1024 * 1024))
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .expect("Invalid HOST:PORT combination");
    tracing::info!("chunkhub listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind");
    axum::serve(listener, app).await.expect("Server error");
}
