use itertools::Itertools;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::{StoreError, StoreResult};
use crate::model::{storage_collection, Body, Entity, EntityId, Method};
use crate::store::traits::EntityStore;

/// One call observed by [`InMemoryEntityStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreCall {
    pub method: Method,
    pub path: String,
}

impl StoreCall {
    fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
        }
    }
}

#[derive(Debug)]
struct MemoryState {
    collections: HashMap<String, BTreeMap<EntityId, Entity>>,
    next_id: EntityId,
    /// Failures handed out to the next matching call (`None` matches any method)
    failures: VecDeque<(Option<Method>, StoreError)>,
    calls: Vec<StoreCall>,
}

impl MemoryState {
    fn record(&mut self, method: Method, path: String) -> StoreResult<()> {
        self.calls.push(StoreCall::new(method, path));
        let position = self
            .failures
            .iter()
            .position(|(wanted, _)| wanted.map_or(true, |wanted| wanted == method));
        match position.and_then(|index| self.failures.remove(index)) {
            Some((_, error)) => Err(error),
            None => Ok(()),
        }
    }

    fn entity_mut(&mut self, collection: &str, id: EntityId) -> StoreResult<&mut Entity> {
        self.collections
            .get_mut(collection)
            .and_then(|entities| entities.get_mut(&id))
            .ok_or_else(|| StoreError::not_found(collection, id))
    }
}

/// Authoritative in-process entity store.
///
/// Assigns increasing ids, applies PATCH bodies as JSON merge patches and
/// supports `field=value` query filters on list paths. Latency, injected
/// failures and a call journal make it usable as a test double.
#[derive(Debug)]
pub struct InMemoryEntityStore {
    state: Mutex<MemoryState>,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a InMemoryEntityStore);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::with_first_id(1)
    }

    /// Store whose first assigned id is `first_id`.
    pub fn with_first_id(first_id: EntityId) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                collections: HashMap::new(),
                next_id: first_id,
                failures: VecDeque::new(),
                calls: Vec::new(),
            }),
            latency: None,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Delay every call by `latency` before it touches the data.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make the next call of `method` (or any call, for `None`) fail with `error`.
    pub fn fail_next(&self, method: Option<Method>, error: StoreError) {
        self.state.lock().failures.push_back((method, error));
    }

    /// Seed an entity without journaling the call.
    pub fn insert(&self, collection: &str, body: Body) -> Entity {
        let mut state = self.state.lock();
        Self::insert_locked(&mut state, collection, body)
    }

    /// Current state of an entity, bypassing the journal.
    pub fn peek(&self, collection: &str, id: EntityId) -> Option<Entity> {
        self.state
            .lock()
            .collections
            .get(collection)
            .and_then(|entities| entities.get(&id))
            .cloned()
    }

    /// Number of stored entities in `collection`.
    pub fn count(&self, collection: &str) -> usize {
        self.state
            .lock()
            .collections
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Highest number of calls that were ever in progress at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Entities of `collection` whose fields match every `(field, value)` filter.
    pub fn query(&self, collection: &str, filters: &[(String, String)]) -> Vec<Entity> {
        let state = self.state.lock();
        let Some(entities) = state.collections.get(collection) else {
            return Vec::new();
        };
        entities
            .values()
            .filter(|entity| {
                filters
                    .iter()
                    .all(|(field, wanted)| field_matches(entity.get(field), wanted))
            })
            .cloned()
            .collect()
    }

    fn insert_locked(state: &mut MemoryState, collection: &str, mut body: Body) -> Entity {
        let id = state.next_id;
        state.next_id += 1;
        body.insert("id".to_string(), Value::from(id));
        let entity = Entity::new(body);
        state
            .collections
            .entry(storage_collection(collection).to_string())
            .or_default()
            .insert(id, entity.clone());
        entity
    }

    async fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let flight = InFlight(self);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        flight
    }
}

impl Default for InMemoryEntityStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply `patch` onto `target`; nested objects are merged key by key.
pub fn merge_patch(target: &mut Body, patch: &Body) {
    for (key, value) in patch {
        if key == "id" {
            continue;
        }
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(nested)) => merge_patch(existing, nested),
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

fn field_matches(value: Option<&Value>, wanted: &str) -> bool {
    match value {
        Some(Value::String(s)) => s == wanted,
        Some(other) => other.to_string() == wanted,
        None => false,
    }
}

/// Split `Collection/parent?field=value&...` into its query filters.
fn parse_filters(path: &str) -> Vec<(String, String)> {
    let Some((_, query)) = path.split_once('?') else {
        return Vec::new();
    };
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| pair.splitn(2, '=').collect_tuple::<(&str, &str)>())
        .map(|(field, value)| (field.to_string(), value.to_string()))
        .collect()
}

#[async_trait::async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn get(&self, collection: &str, id: EntityId) -> StoreResult<Entity> {
        let _flight = self.enter().await;
        let mut state = self.state.lock();
        state.record(Method::Get, format!("{}/{}", collection, id))?;
        state.entity_mut(collection, id).map(|entity| entity.clone())
    }

    async fn create(&self, collection: &str, body: &Body) -> StoreResult<Entity> {
        let _flight = self.enter().await;
        let mut state = self.state.lock();
        state.record(Method::Post, collection.to_string())?;
        Ok(Self::insert_locked(&mut state, collection, body.clone()))
    }

    async fn update(&self, collection: &str, id: EntityId, patch: &Body) -> StoreResult<()> {
        let _flight = self.enter().await;
        let mut state = self.state.lock();
        state.record(Method::Patch, format!("{}/{}", collection, id))?;
        let entity = state.entity_mut(collection, id)?;
        merge_patch(&mut entity.fields, patch);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: EntityId) -> StoreResult<()> {
        let _flight = self.enter().await;
        let mut state = self.state.lock();
        state.record(Method::Delete, format!("{}/{}", collection, id))?;
        state
            .collections
            .get_mut(collection)
            .and_then(|entities| entities.remove(&id))
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(collection, id))
    }

    async fn list(&self, path: &str) -> StoreResult<Vec<Entity>> {
        {
            let _flight = self.enter().await;
            self.state.lock().record(Method::Get, path.to_string())?;
        }
        Ok(self.query(storage_collection(path), &parse_filters(path)))
    }
}
