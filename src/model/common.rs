use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Server-assigned identifier of a persisted entity.
pub type EntityId = i64;

/// Identifier of an entity type (e.g. a localization type).
pub type EntityTypeId = i64;

/// JSON object payload sent to or received from the entity store.
pub type Body = serde_json::Map<String, serde_json::Value>;

pub type CommandId = Uuid;

/// Addresses one persisted entity: `/{collection}/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityReference {
    pub collection: String,
    pub id: EntityId,
}

impl EntityReference {
    pub fn new(collection: impl Into<String>, id: EntityId) -> Self {
        Self {
            collection: collection.into(),
            id,
        }
    }

    /// REST path of the entity, relative to the store base URL.
    pub fn path(&self) -> String {
        format!("{}/{}", self.collection, self.id)
    }
}

impl fmt::Display for EntityReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Patch,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

pub fn generate_command_id() -> CommandId {
    Uuid::new_v4()
}

/// Storage collection named by a REST path: the first path segment, without
/// any query string. `Localizations/1?type=7` lives in `Localizations`.
pub fn storage_collection(path: &str) -> &str {
    let path = path.split('?').next().unwrap_or(path);
    path.trim_start_matches('/')
        .split('/')
        .next()
        .unwrap_or_default()
}
