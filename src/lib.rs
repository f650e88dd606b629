pub mod api;
pub mod config;
pub mod error;
pub mod logic;
pub mod model;
pub mod store;

// Export API types
pub use api::handlers;
pub use api::routes;

// Export error types
pub use error::{CacheError, CacheResult, LogError, LogResult, StoreError, StoreResult};

// Export logic types
pub use logic::{CommandLog, Recreate, SubscriptionId, Subscribers};

// Export all model types
pub use model::*;

// Export store types
pub use store::{
    CollectionRefreshed, EntityStore, HttpEntityStore, InMemoryEntityStore, TypedReadCache,
};

/// Serve the development entity store on an already bound listener.
pub async fn serve_dev_store(
    listener: tokio::net::TcpListener,
    store: std::sync::Arc<InMemoryEntityStore>,
) -> anyhow::Result<()> {
    let app = routes::create_router().with_state(store);
    axum::serve(listener, app).await?;
    Ok(())
}
