use futures::future::{BoxFuture, FutureExt, Shared};
use itertools::Itertools;
use log::{debug, error};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{CacheError, CacheResult, StoreError, StoreResult};
use crate::logic::notify::{SubscriptionId, Subscribers};
use crate::model::{Entity, EntityTypeId, TypeDescriptor};
use crate::store::traits::EntityStore;

/// Broadcast after every successful refresh of a type's collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionRefreshed {
    pub type_id: EntityTypeId,
    pub entities: Arc<Vec<Entity>>,
}

type Fetch = Shared<BoxFuture<'static, StoreResult<Arc<Vec<Entity>>>>>;

/// Cache entry for one entity type
#[derive(Debug)]
struct CacheEntry {
    entities: Arc<Vec<Entity>>,
    /// Generation of the fetch that produced `entities`
    generation: u64,
}

struct InFlight {
    generation: u64,
    fetch: Fetch,
}

struct CacheInner<S> {
    store: Arc<S>,
    types: RwLock<HashMap<EntityTypeId, TypeDescriptor>>,
    entries: RwLock<HashMap<EntityTypeId, CacheEntry>>,
    in_flight: Mutex<HashMap<EntityTypeId, InFlight>>,
    generation: AtomicU64,
    subscribers: Subscribers<CollectionRefreshed>,
}

/// Last-fetched collection per entity type.
///
/// Populated by pull only: callers decide when a type is stale and ask for a
/// refresh. Fetches run on their own tasks, so they settle even if every
/// caller awaiting them goes away.
pub struct TypedReadCache<S> {
    inner: Arc<CacheInner<S>>,
}

impl<S> Clone for TypedReadCache<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: EntityStore + 'static> TypedReadCache<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                store,
                types: RwLock::new(HashMap::new()),
                entries: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                subscribers: Subscribers::new(),
            }),
        }
    }

    /// Declare a fetchable type. Re-registering replaces the path template.
    pub fn register_type(&self, descriptor: TypeDescriptor) {
        let mut types = self.inner.types.write();
        types.insert(descriptor.id, descriptor);
        debug!(
            "registered entity types: {}",
            types.keys().sorted().join(", ")
        );
    }

    pub fn registered_types(&self) -> Vec<TypeDescriptor> {
        self.inner
            .types
            .read()
            .values()
            .cloned()
            .sorted_by_key(|descriptor| descriptor.id)
            .collect()
    }

    /// Cached collection of `type_id`, if it was ever fetched.
    pub fn get(&self, type_id: EntityTypeId) -> Option<Arc<Vec<Entity>>> {
        self.inner
            .entries
            .read()
            .get(&type_id)
            .map(|entry| entry.entities.clone())
    }

    /// Listen for refreshes of one type.
    pub fn subscribe<F>(&self, type_id: EntityTypeId, listener: F) -> SubscriptionId
    where
        F: Fn(&CollectionRefreshed) + Send + Sync + 'static,
    {
        self.inner.subscribers.subscribe(move |event| {
            if event.type_id == type_id {
                listener(event)
            }
        })
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.subscribers.unsubscribe(id)
    }

    /// Re-fetch the collection of `type_id`.
    ///
    /// Joins the fetch already in flight for the type, if any, instead of
    /// issuing another request. On failure the cached collection is kept.
    pub async fn refresh(&self, type_id: EntityTypeId) -> CacheResult<Arc<Vec<Entity>>> {
        let fetch = self.start(type_id, false)?;
        Ok(fetch.await?)
    }

    /// Re-fetch `type_id` with a new request even if one is in flight.
    ///
    /// The older request still resolves for its callers, but its result never
    /// replaces this one.
    pub async fn refetch(&self, type_id: EntityTypeId) -> CacheResult<Arc<Vec<Entity>>> {
        let fetch = self.start(type_id, true)?;
        Ok(fetch.await?)
    }

    fn start(&self, type_id: EntityTypeId, supersede: bool) -> CacheResult<Fetch> {
        let path = self
            .inner
            .types
            .read()
            .get(&type_id)
            .map(TypeDescriptor::fetch_path)
            .ok_or(CacheError::UnknownType(type_id))?;

        let mut in_flight = self.inner.in_flight.lock();
        if !supersede {
            if let Some(pending) = in_flight.get(&type_id) {
                debug!("joining in-flight fetch of type {}", type_id);
                return Ok(pending.fetch.clone());
            }
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let result = inner.store.list(&path).await;
            inner.settle(type_id, generation, result)
        });
        let fetch = async move {
            task.await.unwrap_or_else(|err| {
                Err(StoreError::Transport(format!("fetch task failed: {}", err)))
            })
        }
        .boxed()
        .shared();

        in_flight.insert(
            type_id,
            InFlight {
                generation,
                fetch: fetch.clone(),
            },
        );
        Ok(fetch)
    }
}

impl<S> CacheInner<S> {
    fn settle(
        &self,
        type_id: EntityTypeId,
        generation: u64,
        result: StoreResult<Vec<Entity>>,
    ) -> StoreResult<Arc<Vec<Entity>>> {
        {
            let mut in_flight = self.in_flight.lock();
            if in_flight
                .get(&type_id)
                .is_some_and(|pending| pending.generation == generation)
            {
                in_flight.remove(&type_id);
            }
        }

        let entities = match result {
            Ok(entities) => Arc::new(entities),
            Err(err) => {
                error!(
                    "refresh of entity type {} failed, keeping cached collection: {}",
                    type_id, err
                );
                return Err(err);
            }
        };

        let current = {
            let mut entries = self.entries.write();
            let superseded = entries
                .get(&type_id)
                .is_some_and(|entry| entry.generation > generation);
            if !superseded {
                entries.insert(
                    type_id,
                    CacheEntry {
                        entities: entities.clone(),
                        generation,
                    },
                );
            }
            !superseded
        };

        if current {
            debug!(
                "entity type {} refreshed with {} entities",
                type_id,
                entities.len()
            );
            self.subscribers.notify(&CollectionRefreshed {
                type_id,
                entities: entities.clone(),
            });
        } else {
            debug!(
                "discarding superseded fetch {} of entity type {}",
                generation, type_id
            );
        }
        Ok(entities)
    }
}
