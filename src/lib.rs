pub mod api;
pub mod config;
pub mod jobs;
pub mod logic;
pub mod model;
pub mod seed;
pub mod store;

pub use api::handlers;
pub use api::routes;
pub use model::*;
pub use store::{MemoryStore, PostgresStore, Store};

/// Run the HTTP server end to end: env, logging, config, migrations,
/// optional seed, serve. Used by the binary and by integration tests.
pub async fn run_server() -> anyhow::Result<()> {
    use std::sync::Arc;
    use tokio::net::TcpListener;

    dotenvy::dotenv().ok();
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();

    let config = crate::config::AppConfig::load()?;

    let database_url = config.database_url()?;
    let postgres_store = crate::store::PostgresStore::new(&database_url).await?;
    postgres_store.migrate().await?;

    let store = Arc::new(postgres_store);
    crate::seed::load_seed_data(&*store).await?;

    let app = crate::api::routes::create_router(config.read_only)
        .with_state(store)
        .layer(tower_http::trace::TraceLayer::new_for_http());
    let listener = TcpListener::bind(config.server_address()).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
