use crate::error::StoreResult;
use crate::model::{Body, Entity, EntityId};

/// Contract of the remote entity store.
///
/// Every call is idempotent from the caller's point of view and answers with
/// the canonical entity where one exists.
#[async_trait::async_trait]
pub trait EntityStore: Send + Sync {
    /// `GET /{collection}/{id}`
    async fn get(&self, collection: &str, id: EntityId) -> StoreResult<Entity>;
    /// `POST /{collection}`; the returned entity carries the assigned `id`.
    async fn create(&self, collection: &str, body: &Body) -> StoreResult<Entity>;
    /// `PATCH /{collection}/{id}` with a partial body.
    async fn update(&self, collection: &str, id: EntityId, patch: &Body) -> StoreResult<()>;
    /// `DELETE /{collection}/{id}`
    async fn delete(&self, collection: &str, id: EntityId) -> StoreResult<()>;
    /// `GET /{path}` returning a list of entities.
    async fn list(&self, path: &str) -> StoreResult<Vec<Entity>>;
}
