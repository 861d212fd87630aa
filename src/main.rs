use std::sync::Arc;

use axum::serve;
use tokio::net::TcpListener;

use phenotype_library::api::routes::create_router;
use phenotype_library::config::AppConfig;
use phenotype_library::jobs::{sync_codelists, OpenCodelistsClient};
use phenotype_library::seed;
use phenotype_library::store::PostgresStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    use env_logger::Builder;
    use log::LevelFilter;

    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter_module("sqlx", LevelFilter::Warn)
        .init();

    let config = AppConfig::load()?;
    log::info!(
        "configuration loaded: server={} read_only={}",
        config.server_address(),
        config.read_only
    );

    let database_url = config.database_url()?;
    let postgres_store = PostgresStore::new(&database_url)
        .await?
        .with_template_cache_ttl(std::time::Duration::from_secs(config.cache.template_ttl_secs));
    postgres_store.migrate().await?;
    log::info!("database ready");

    let store = Arc::new(postgres_store);
    seed::load_seed_data(&*store).await?;

    let cache_store = Arc::clone(&store);
    let cache_sweep = std::time::Duration::from_secs(config.cache.template_ttl_secs);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(cache_sweep).await;
            cache_store.evict_expired_templates().await;
        }
    });

    // Optional scheduled import from the external codelist registry.
    if let (Some(base_url), Some(organisation)) =
        (config.sync.base_url.clone(), config.sync.organisation.clone())
    {
        let sync_store = Arc::clone(&store);
        tokio::spawn(async move {
            let client = match OpenCodelistsClient::new(&base_url) {
                Ok(client) => client,
                Err(err) => {
                    log::warn!("codelist sync disabled: {}", err);
                    return;
                }
            };
            loop {
                if let Err(err) =
                    sync_codelists(&*sync_store, &client, &organisation, "importer").await
                {
                    log::warn!("codelist sync failed: {}", err);
                }
                tokio::time::sleep(std::time::Duration::from_secs(24 * 60 * 60)).await;
            }
        });
    }

    let app = create_router(config.read_only)
        .with_state(store)
        .layer(tower::ServiceBuilder::new().layer(tower_http::trace::TraceLayer::new_for_http()));
    let bind_address = config.server_address();
    let listener = TcpListener::bind(&bind_address).await?;
    log::info!("phenotype library serving on http://{}", bind_address);
    serve(listener, app).await?;

    Ok(())
}
