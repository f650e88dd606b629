use axum::{
    extract::{Path, RawQuery, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::error::StoreError;
use crate::model::{Body, Entity, EntityId};
use crate::store::{EntityStore, InMemoryEntityStore};

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: &str) -> Self {
        Self {
            error: message.to_string(),
        }
    }
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn store_error(err: StoreError) -> ApiError {
    match err {
        StoreError::Conflict { status, message } => (
            StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_REQUEST),
            Json(ErrorResponse::new(&message)),
        ),
        StoreError::Transport(message) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse::new(&message)),
        ),
        StoreError::Decode(message) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new(&message)),
        ),
    }
}

pub async fn health_check() -> &'static str {
    "OK"
}

/// `GET /{collection}?field=value&...`
pub async fn list_entities(
    State(store): State<Arc<InMemoryEntityStore>>,
    Path(collection): Path<String>,
    RawQuery(query): RawQuery,
) -> Result<Json<Vec<Entity>>, ApiError> {
    let path = match query {
        Some(query) => format!("{}?{}", collection, query),
        None => collection,
    };
    let entities = store.list(&path).await.map_err(store_error)?;
    Ok(Json(entities))
}

pub async fn create_entity(
    State(store): State<Arc<InMemoryEntityStore>>,
    Path(collection): Path<String>,
    Json(body): Json<Body>,
) -> Result<(StatusCode, Json<Entity>), ApiError> {
    let created = store.create(&collection, &body).await.map_err(store_error)?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// `POST /{collection}/{parent}` creates inside `collection`.
pub async fn create_entity_under(
    State(store): State<Arc<InMemoryEntityStore>>,
    Path((collection, parent)): Path<(String, String)>,
    Json(body): Json<Body>,
) -> Result<(StatusCode, Json<Entity>), ApiError> {
    let created = store
        .create(&format!("{}/{}", collection, parent), &body)
        .await
        .map_err(store_error)?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn get_entity(
    State(store): State<Arc<InMemoryEntityStore>>,
    Path((collection, id)): Path<(String, EntityId)>,
) -> Result<Json<Entity>, ApiError> {
    let entity = store.get(&collection, id).await.map_err(store_error)?;
    Ok(Json(entity))
}

pub async fn update_entity(
    State(store): State<Arc<InMemoryEntityStore>>,
    Path((collection, id)): Path<(String, EntityId)>,
    Json(patch): Json<Body>,
) -> Result<Json<serde_json::Value>, ApiError> {
    store
        .update(&collection, id, &patch)
        .await
        .map_err(store_error)?;
    Ok(Json(serde_json::json!({
        "message": format!("{} {} updated", collection, id)
    })))
}

pub async fn delete_entity(
    State(store): State<Arc<InMemoryEntityStore>>,
    Path((collection, id)): Path<(String, EntityId)>,
) -> Result<StatusCode, ApiError> {
    store.delete(&collection, id).await.map_err(store_error)?;
    Ok(StatusCode::NO_CONTENT)
}
