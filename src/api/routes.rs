use axum::{routing::get, Router};
use std::sync::Arc;

use crate::api::handlers;
use crate::store::InMemoryEntityStore;

pub fn create_router() -> Router<Arc<InMemoryEntityStore>> {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Collection endpoints
        .route(
            "/:collection",
            get(handlers::list_entities).post(handlers::create_entity),
        )
        // Entity endpoints, plus creation under a parent
        .route(
            "/:collection/:id",
            get(handlers::get_entity)
                .patch(handlers::update_entity)
                .delete(handlers::delete_entity)
                .post(handlers::create_entity_under),
        )
}
