use annotation_history::config::AppConfig;
use annotation_history::serve_dev_store;
use annotation_history::store::InMemoryEntityStore;
use log::info;
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    use env_logger::Builder;
    use log::LevelFilter;

    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter_module("hyper", LevelFilter::Warn)
        .filter_module("reqwest", LevelFilter::Warn)
        .parse_default_env()
        .init();

    let config = AppConfig::load()?;
    info!(
        "Configuration loaded: server={}, first id {}",
        config.server_address(),
        config.server.first_id
    );

    let store = Arc::new(InMemoryEntityStore::with_first_id(config.server.first_id));

    let bind_address = config.server_address();
    let listener = TcpListener::bind(&bind_address).await?;
    info!("Entity store running on http://{}", bind_address);

    serve_dev_store(listener, store).await?;

    Ok(())
}
