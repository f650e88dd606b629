use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{Body, EntityId, EntityTypeId};

/// Canonical entity as returned by the entity store.
///
/// Bodies are opaque apart from the `id` field, which the command log tracks.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Entity {
    pub fields: Body,
}

impl Entity {
    pub fn new(fields: Body) -> Self {
        Self { fields }
    }

    pub fn id(&self) -> Option<EntityId> {
        self.fields.get("id").and_then(Value::as_i64)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn into_body(self) -> Body {
        self.fields
    }
}

impl From<Body> for Entity {
    fn from(fields: Body) -> Self {
        Self { fields }
    }
}

/// Declares an entity type whose whole collection can be fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDescriptor {
    pub id: EntityTypeId,
    pub name: String,
    /// Path template for "all entities of this type". `{type}` is replaced
    /// with the type id, e.g. `Localizations?media=42&type={type}`.
    pub path: String,
}

impl TypeDescriptor {
    pub fn new(id: EntityTypeId, name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            path: path.into(),
        }
    }

    pub fn fetch_path(&self) -> String {
        self.path.replace("{type}", &self.id.to_string())
    }
}
