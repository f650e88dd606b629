use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{Body, Entity};

/// Fields the store manages itself; they never travel in a re-creation body.
pub const DEFAULT_SERVER_FIELDS: &[&str] = &[
    "id",
    "created_datetime",
    "modified_datetime",
    "created_by",
    "modified_by",
];

/// How a deleted entity is brought back when its deletion is undone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Recreate {
    /// Collection to POST the re-creation to; defaults to the entity's own.
    pub collection: Option<String>,
    /// Type/parent linkage a bare snapshot does not carry (owning media,
    /// frame, type, ...). Overrides snapshot fields of the same name.
    pub linkage: Body,
}

impl Recreate {
    pub fn in_collection(collection: impl Into<String>) -> Self {
        Self {
            collection: Some(collection.into()),
            linkage: Body::new(),
        }
    }

    pub fn with_link(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.linkage.insert(field.into(), value.into());
        self
    }
}

/// Pre-mutation values of exactly the fields `patch` touches.
///
/// A nested patch over an existing object is snapshotted key by key; any other
/// previous value is kept whole. Fields the entity does not have yet are
/// recorded as `null`.
pub fn snapshot_fields(current: &Body, patch: &Body) -> Body {
    patch
        .iter()
        .filter(|(key, _)| key.as_str() != "id")
        .map(|(key, value)| {
            let previous = match (current.get(key), value) {
                (Some(Value::Object(existing)), Value::Object(nested)) => {
                    Value::Object(snapshot_fields(existing, nested))
                }
                (Some(existing), _) => existing.clone(),
                (None, _) => Value::Null,
            };
            (key.clone(), previous)
        })
        .collect()
}

/// Body that re-creates `snapshot`: server-managed fields removed, linkage merged on top.
pub fn recreation_body(snapshot: &Entity, server_fields: &[String], linkage: &Body) -> Body {
    let mut body: Body = snapshot
        .fields
        .iter()
        .filter(|(key, _)| !server_fields.iter().any(|field| field == *key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    for (key, value) in linkage {
        body.insert(key.clone(), value.clone());
    }
    body
}
