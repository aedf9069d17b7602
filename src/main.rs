use std::{process::ExitCode, sync::Arc};

use pointtiles::{
    app_state::AppState,
    config::{Config, ConfigError},
    routes::make_router,
    store::{PgTileStore, StoreError},
    tracing::setup_tracing,
};
use thiserror::Error;

#[derive(Error, Debug)]
enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("database error: {0}")]
    Store(#[from] StoreError),
    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let _guard = setup_tracing();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "server stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), StartupError> {
    let config = Config::from_env()?;
    tracing::info!(
        coalesce_misses = config.cache.coalesce_misses,
        cluster_max_zoom = config.selector.cluster_max_zoom(),
        max_zoom = config.max_zoom,
        pool_min = config.db.pool_min,
        pool_max = config.db.pool_max,
        "loaded config"
    );

    let store = PgTileStore::new(&config.db)?;
    // the server can start without the database; /health reports it
    if let Err(err) = store.warm_up(config.db.pool_min).await {
        tracing::warn!(error = %err, "could not warm up the database pool");
    }

    let state = Arc::new(AppState::new(&config, store));
    let cache = state.tiles.cache();
    tracing::info!(
        capacity = cache.capacity().get(),
        ttl_secs = cache.ttl().as_secs(),
        pool_size = state.tiles.store().pool_size(),
        "tile cache ready"
    );
    let app = make_router().with_state(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!("listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
