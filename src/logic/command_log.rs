use log::{debug, error, info};
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::HistoryConfig;
use crate::error::{LogError, LogResult};
use crate::logic::notify::{SubscriptionId, Subscribers};
use crate::logic::snapshot::{recreation_body, snapshot_fields, Recreate};
use crate::model::{
    storage_collection, AppliedEvent, Body, Command, CommandKind, Direction, Entity, EntityId,
    EntityReference, HistoryPosition, Operation,
};
use crate::store::EntityStore;

/// Commands below `cursor` are applied; the rest are available to redo.
struct History<E> {
    commands: Vec<Command<E>>,
    cursor: usize,
}

impl<E> History<E> {
    fn position(&self) -> HistoryPosition {
        HistoryPosition {
            cursor: self.cursor,
            len: self.commands.len(),
        }
    }

    /// Branch-on-write append. Returns the index of the new command.
    fn commit(&mut self, command: Command<E>, max_entries: usize) -> usize {
        let discarded = self.commands.len() - self.cursor;
        if discarded > 0 {
            debug!("discarding {} redoable command(s)", discarded);
        }
        self.commands.truncate(self.cursor);
        self.commands.push(command);
        self.cursor += 1;

        if max_entries > 0 && self.commands.len() > max_entries {
            let excess = self.commands.len() - max_entries;
            self.commands.drain(..excess);
            self.cursor -= excess;
            debug!("evicted {} oldest command(s)", excess);
        }
        self.cursor - 1
    }

    fn refers_to(&self, reference: &EntityReference) -> bool {
        self.commands
            .iter()
            .flat_map(|command| command.references())
            .any(|existing| existing == reference)
    }

    /// Points every reference to `old`, on both sides of the cursor, at `new`.
    fn reconcile(&mut self, old: &EntityReference, new: &EntityReference) -> usize {
        self.commands
            .iter_mut()
            .map(|command| command.rewrite(old, new))
            .sum()
    }
}

struct LogInner<S, E> {
    store: Arc<S>,
    history: Arc<Mutex<History<E>>>,
    /// Mirror of the history position, readable without waiting on the queue
    position: RwLock<HistoryPosition>,
    subscribers: Subscribers<AppliedEvent<E>>,
    config: HistoryConfig,
}

/// Undo/redo history of remote entity mutations.
///
/// Every mutating call (`record_*`, `undo`, `redo`, `clear`) waits its turn on
/// a FIFO queue and then runs to completion on its own task, so at most one
/// store mutation is in flight per log and dropping a caller's future never
/// leaves a command half-recorded. A command is only appended, and its echo
/// only published, after the store has accepted it.
pub struct CommandLog<S, E> {
    inner: Arc<LogInner<S, E>>,
}

impl<S, E> Clone for CommandLog<S, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S, E> CommandLog<S, E>
where
    S: EntityStore + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(store: Arc<S>) -> Self {
        Self::with_config(store, HistoryConfig::default())
    }

    pub fn with_config(store: Arc<S>, config: HistoryConfig) -> Self {
        Self {
            inner: Arc::new(LogInner {
                store,
                history: Arc::new(Mutex::new(History {
                    commands: Vec::new(),
                    cursor: 0,
                })),
                position: RwLock::new(HistoryPosition::default()),
                subscribers: Subscribers::new(),
                config,
            }),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    pub fn position(&self) -> HistoryPosition {
        *self.inner.position.read()
    }

    pub fn can_undo(&self) -> bool {
        self.position().can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.position().can_redo()
    }

    pub fn len(&self) -> usize {
        self.position().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register for "command applied" notifications.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&AppliedEvent<E>) + Send + Sync + 'static,
    {
        self.inner.subscribers.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.subscribers.unsubscribe(id)
    }

    /// Copy of the recorded commands, taken after every queued call settled.
    pub async fn commands(&self) -> Vec<Command<E>> {
        self.inner.history.lock().await.commands.clone()
    }

    /// Forget the whole history. Remote state is left untouched.
    pub async fn clear(&self) -> LogResult<()> {
        self.serialized(|inner, mut history| async move {
            history.commands.clear();
            history.cursor = 0;
            inner.publish(&history);
            info!("command history cleared");
            Ok(())
        })
        .await
    }

    /// Create an entity and record the creation.
    ///
    /// Returns the canonical entity, including its server-assigned id.
    pub async fn record_create(
        &self,
        collection: impl Into<String>,
        body: Body,
        echo: E,
    ) -> LogResult<Entity> {
        let collection = collection.into();
        self.serialized(move |inner, mut history| async move {
            let mut forward = Operation::Create {
                collection: collection.clone(),
                body,
                entity: None,
            };
            let created = inner.execute(&mut history, &forward).await?;
            let created = created.ok_or_else(|| {
                LogError::Reconciliation(format!("POST {} produced no entity", collection))
            })?;
            let reference = created_reference(storage_collection(&collection), &created)?;
            if let Operation::Create { entity, .. } = &mut forward {
                *entity = Some(reference.clone());
            }

            let backward = Operation::Delete { target: reference };
            let command = Command::new(CommandKind::Create, forward, backward, echo);
            inner.commit(&mut history, command);
            Ok(created)
        })
        .await
    }

    /// Apply a partial update and record it with the overwritten values as its inverse.
    pub async fn record_update(
        &self,
        collection: impl Into<String>,
        id: EntityId,
        patch: Body,
        echo: E,
    ) -> LogResult<()> {
        let collection = collection.into();
        let target = EntityReference::new(storage_collection(&collection), id);
        self.serialized(move |inner, mut history| async move {
            // A failed snapshot is surfaced right away; transient failures
            // were already retried by the store transport.
            let current = inner.store.get(&target.collection, target.id).await?;
            let snapshot = snapshot_fields(&current.fields, &patch);

            let command = Command::new(
                CommandKind::Update,
                Operation::Update {
                    target: target.clone(),
                    patch,
                },
                Operation::Update {
                    target,
                    patch: snapshot,
                },
                echo,
            );
            inner.execute(&mut history, &command.forward).await?;
            inner.commit(&mut history, command);
            Ok(())
        })
        .await
    }

    /// Delete an entity, recording a re-creation from its snapshot as the inverse.
    pub async fn record_delete(
        &self,
        collection: impl Into<String>,
        id: EntityId,
        echo: E,
    ) -> LogResult<()> {
        self.record_delete_with(collection, id, Recreate::default(), echo)
            .await
    }

    /// Like [`record_delete`](Self::record_delete), with control over where and
    /// with which linkage fields the entity is re-created on undo.
    pub async fn record_delete_with(
        &self,
        collection: impl Into<String>,
        id: EntityId,
        recreate: Recreate,
        echo: E,
    ) -> LogResult<()> {
        let collection = collection.into();
        let target = EntityReference::new(storage_collection(&collection), id);
        self.serialized(move |inner, mut history| async move {
            // Surfaced immediately, as in record_update
            let snapshot = inner.store.get(&target.collection, target.id).await?;
            let body = recreation_body(&snapshot, &inner.config.server_fields, &recreate.linkage);

            let backward = Operation::Create {
                collection: recreate
                    .collection
                    .unwrap_or_else(|| target.collection.clone()),
                body,
                entity: Some(target.clone()),
            };
            let command = Command::new(
                CommandKind::Delete,
                Operation::Delete { target },
                backward,
                echo,
            );
            inner.execute(&mut history, &command.forward).await?;
            inner.commit(&mut history, command);
            Ok(())
        })
        .await
    }

    /// Revert the most recently applied command. No-op when nothing is applied.
    pub async fn undo(&self) -> LogResult<()> {
        self.serialized(|inner, mut history| async move {
            if history.cursor == 0 {
                debug!("undo requested with nothing to undo");
                return Ok(());
            }
            let index = history.cursor - 1;
            let backward = history.commands[index].backward.clone();
            inner.execute(&mut history, &backward).await?;
            history.cursor = index;
            inner.settle(&history, index, Direction::Undo);
            Ok(())
        })
        .await
    }

    /// Re-apply the next undone command. No-op when nothing is undone.
    pub async fn redo(&self) -> LogResult<()> {
        self.serialized(|inner, mut history| async move {
            if history.cursor == history.commands.len() {
                debug!("redo requested with nothing to redo");
                return Ok(());
            }
            let index = history.cursor;
            let forward = history.commands[index].forward.clone();
            inner.execute(&mut history, &forward).await?;
            history.cursor = index + 1;
            inner.settle(&history, index, Direction::Redo);
            Ok(())
        })
        .await
    }

    /// Queue behind every earlier call, then run `work` to completion on its own task.
    async fn serialized<F, Fut, T>(&self, work: F) -> LogResult<T>
    where
        F: FnOnce(Arc<LogInner<S, E>>, OwnedMutexGuard<History<E>>) -> Fut,
        Fut: Future<Output = LogResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let history = self.inner.history.clone().lock_owned().await;
        let task = tokio::spawn(work(self.inner.clone(), history));
        task.await
            .map_err(|err| LogError::Interrupted(err.to_string()))?
    }
}

impl<S, E> LogInner<S, E>
where
    S: EntityStore + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// The single place where an operation is performed against the store.
    ///
    /// A POST of an entity that already had a reference (redoing a creation,
    /// undoing a deletion) yields a new id, which replaces the old one
    /// throughout the history. A new id that the history already uses for
    /// another entity is a reconciliation failure.
    async fn execute(&self, history: &mut History<E>, op: &Operation) -> LogResult<Option<Entity>> {
        match op {
            Operation::Create {
                collection,
                body,
                entity,
            } => {
                let created = self.store.create(collection, body).await?;
                let Some(previous) = entity else {
                    return Ok(Some(created));
                };

                let current = created_reference(&previous.collection, &created)?;
                // The new id must not already stand for another entity in the history
                if current != *previous && history.refers_to(&current) {
                    error!(
                        "re-created {} as {}, which the history already refers to",
                        previous, current
                    );
                    return Err(LogError::Reconciliation(format!(
                        "{} is already referenced in history, cannot re-create {} under it",
                        current, previous
                    )));
                }
                let rewritten = history.reconcile(previous, &current);
                debug!(
                    "reconciled {} -> {} ({} reference(s))",
                    previous, current, rewritten
                );
                Ok(Some(created))
            }
            Operation::Update { target, patch } => {
                self.store
                    .update(&target.collection, target.id, patch)
                    .await?;
                Ok(None)
            }
            Operation::Delete { target } => {
                self.store.delete(&target.collection, target.id).await?;
                Ok(None)
            }
        }
    }

    fn commit(&self, history: &mut History<E>, command: Command<E>) {
        info!(
            "recorded {:?} command {} ({} {})",
            command.kind,
            command.id,
            command.forward.method(),
            command
                .forward
                .references()
                .next()
                .map(ToString::to_string)
                .unwrap_or_default()
        );
        let index = history.commit(command, self.config.max_entries);
        self.settle(history, index, Direction::Do);
    }

    fn settle(&self, history: &History<E>, index: usize, direction: Direction) {
        self.publish(history);
        let command = &history.commands[index];
        debug!(
            "{:?} of command {} settled, cursor {}/{}",
            direction,
            command.id,
            history.cursor,
            history.commands.len()
        );
        self.subscribers.notify(&AppliedEvent {
            echo: command.echo.clone(),
            direction,
        });
    }

    fn publish(&self, history: &History<E>) {
        *self.position.write() = history.position();
    }
}

fn created_reference(collection: &str, created: &Entity) -> LogResult<EntityReference> {
    created
        .id()
        .map(|id| EntityReference::new(collection, id))
        .ok_or_else(|| {
            LogError::Reconciliation(format!("entity created in {} carries no id", collection))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{StoreError, StoreResult};
    use crate::model::Method;
    use crate::store::InMemoryEntityStore;
    use serde_json::{json, Value};
    use std::time::Duration;

    type Log = CommandLog<InMemoryEntityStore, &'static str>;

    fn body(value: Value) -> Body {
        value.as_object().cloned().unwrap()
    }

    fn new_log() -> (Arc<InMemoryEntityStore>, Log) {
        let store = Arc::new(InMemoryEntityStore::with_first_id(101));
        let log = CommandLog::new(store.clone());
        (store, log)
    }

    fn record_events(log: &Log) -> Arc<parking_lot::Mutex<Vec<(&'static str, Direction)>>> {
        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = events.clone();
        log.subscribe(move |event| sink.lock().push((event.echo, event.direction)));
        events
    }

    fn field(store: &InMemoryEntityStore, id: EntityId, name: &str) -> Option<Value> {
        store
            .peek("Localizations", id)
            .and_then(|entity| entity.get(name).cloned())
    }

    #[tokio::test]
    async fn test_record_create_returns_canonical_entity() {
        let (store, log) = new_log();
        let events = record_events(&log);

        let created = log
            .record_create("Localizations", body(json!({"type": 7, "x": 0.1})), "create")
            .await
            .unwrap();

        assert_eq!(created.id(), Some(101));
        assert_eq!(created.get("type"), Some(&json!(7)));
        assert!(store.peek("Localizations", 101).is_some());
        assert_eq!(log.position(), HistoryPosition { cursor: 1, len: 1 });
        assert!(log.can_undo());
        assert!(!log.can_redo());
        assert_eq!(*events.lock(), vec![("create", Direction::Do)]);

        let commands = log.commands().await;
        assert_eq!(commands[0].kind, CommandKind::Create);
        assert_eq!(
            commands[0].backward,
            Operation::Delete {
                target: EntityReference::new("Localizations", 101)
            }
        );
    }

    #[tokio::test]
    async fn test_failed_records_leave_history_untouched() {
        let (store, log) = new_log();
        let seeded = store.insert("Localizations", body(json!({"x": 0.1})));
        let id = seeded.id().unwrap();
        log.record_update("Localizations", id, body(json!({"x": 0.2})), "seed")
            .await
            .unwrap();
        log.undo().await.unwrap();
        let before = log.position();
        let events = record_events(&log);

        store.fail_next(
            Some(Method::Post),
            StoreError::Transport("connection refused".to_string()),
        );
        let err = log
            .record_create("Localizations", body(json!({"x": 0.3})), "create")
            .await
            .unwrap_err();
        assert!(matches!(err, LogError::Store(StoreError::Transport(_))));
        assert_eq!(log.position(), before);

        // Snapshot failure
        store.fail_next(Some(Method::Get), StoreError::Transport("timeout".to_string()));
        assert!(log
            .record_update("Localizations", id, body(json!({"x": 0.4})), "update")
            .await
            .is_err());
        assert_eq!(log.position(), before);

        // Write rejected after a successful snapshot
        store.fail_next(
            Some(Method::Patch),
            StoreError::Conflict {
                status: 400,
                message: "x must be within [0, 1]".to_string(),
            },
        );
        let err = log
            .record_update("Localizations", id, body(json!({"x": 4.0})), "update")
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "rejected by entity store (400): x must be within [0, 1]"
        );
        assert_eq!(log.position(), before);

        store.fail_next(
            Some(Method::Delete),
            StoreError::Conflict {
                status: 403,
                message: "forbidden".to_string(),
            },
        );
        assert!(log.record_delete("Localizations", id, "delete").await.is_err());
        assert_eq!(log.position(), before);
        assert!(log.can_redo());

        assert!(events.lock().is_empty());
        assert_eq!(field(&store, id, "x"), Some(json!(0.1)));
    }

    #[tokio::test]
    async fn test_update_undo_redo_restores_values() {
        let (store, log) = new_log();
        let entity = store.insert(
            "Localizations",
            body(json!({"x": 0.1, "attributes": {"Label": "car", "Score": 3}})),
        );
        let id = entity.id().unwrap();

        log.record_update(
            "Localizations",
            id,
            body(json!({"x": 0.5, "attributes": {"Label": "truck"}})),
            "update",
        )
        .await
        .unwrap();
        assert_eq!(field(&store, id, "x"), Some(json!(0.5)));

        log.undo().await.unwrap();
        assert_eq!(field(&store, id, "x"), Some(json!(0.1)));
        assert_eq!(
            field(&store, id, "attributes"),
            Some(json!({"Label": "car", "Score": 3}))
        );

        log.redo().await.unwrap();
        assert_eq!(field(&store, id, "x"), Some(json!(0.5)));
        assert_eq!(
            field(&store, id, "attributes"),
            Some(json!({"Label": "truck", "Score": 3}))
        );
    }

    #[tokio::test]
    async fn test_redo_of_create_reconciles_later_references() {
        let (store, log) = new_log();
        let created = log
            .record_create("Localizations", body(json!({"type": 7, "x": 0.1})), "create")
            .await
            .unwrap();
        let a = created.id().unwrap();
        log.record_update("Localizations", a, body(json!({"x": 0.5})), "update")
            .await
            .unwrap();

        log.undo().await.unwrap();
        log.undo().await.unwrap();
        assert!(store.peek("Localizations", a).is_none());

        log.redo().await.unwrap();
        let b = a + 1;
        assert_eq!(field(&store, b, "x"), Some(json!(0.1)));

        let commands = log.commands().await;
        let stale = EntityReference::new("Localizations", a);
        assert!(commands
            .iter()
            .flat_map(|command| command.references())
            .all(|reference| reference != &stale));
        assert_eq!(
            commands[1].forward,
            Operation::Update {
                target: EntityReference::new("Localizations", b),
                patch: body(json!({"x": 0.5}))
            }
        );

        // The rewritten command runs against the live entity
        log.redo().await.unwrap();
        assert_eq!(field(&store, b, "x"), Some(json!(0.5)));
        assert!(!log.can_redo());
    }

    #[tokio::test]
    async fn test_recording_after_undo_truncates_redo_tail() {
        let (store, log) = new_log();
        let entity = store.insert("Localizations", body(json!({"x": 0.0})));
        let id = entity.id().unwrap();
        for x in [0.1, 0.2, 0.3] {
            log.record_update("Localizations", id, body(json!({"x": x})), "update")
                .await
                .unwrap();
        }
        assert_eq!(log.position(), HistoryPosition { cursor: 3, len: 3 });

        log.undo().await.unwrap();
        log.undo().await.unwrap();
        assert_eq!(log.position(), HistoryPosition { cursor: 1, len: 3 });

        log.record_update("Localizations", id, body(json!({"y": 0.9})), "branch")
            .await
            .unwrap();
        assert!(!log.can_redo());
        assert_eq!(log.len(), 2);

        // The discarded redo entries are gone for good
        log.redo().await.unwrap();
        assert_eq!(field(&store, id, "x"), Some(json!(0.1)));
        assert_eq!(log.position(), HistoryPosition { cursor: 2, len: 2 });
    }

    #[tokio::test]
    async fn test_back_to_back_undo_redo_is_serialized() {
        let store = Arc::new(
            InMemoryEntityStore::with_first_id(101).with_latency(Duration::from_millis(20)),
        );
        let log: Log = CommandLog::new(store.clone());
        log.record_create("Localizations", body(json!({"type": 7, "x": 0.1})), "create")
            .await
            .unwrap();
        let events = record_events(&log);
        store.clear_calls();

        let (undone, redone) = tokio::join!(log.undo(), log.redo());
        undone.unwrap();
        redone.unwrap();

        assert_eq!(store.peak_in_flight(), 1);
        assert_eq!(log.position(), HistoryPosition { cursor: 1, len: 1 });
        assert_eq!(store.count("Localizations"), 1);
        assert_eq!(field(&store, 102, "x"), Some(json!(0.1)));
        assert_eq!(
            store.calls().iter().map(|call| call.method).collect::<Vec<_>>(),
            vec![Method::Delete, Method::Post]
        );
        assert_eq!(
            *events.lock(),
            vec![("create", Direction::Undo), ("create", Direction::Redo)]
        );
    }

    #[tokio::test]
    async fn test_bounds_are_silent_noops() {
        let (store, log) = new_log();
        let events = record_events(&log);

        log.undo().await.unwrap();
        log.redo().await.unwrap();

        assert!(store.calls().is_empty());
        assert!(events.lock().is_empty());
        assert_eq!(log.position(), HistoryPosition::default());
    }

    #[tokio::test]
    async fn test_localization_scenario() {
        let (store, log) = new_log();
        let created = log
            .record_create(
                "Localizations",
                body(json!({"type": 7, "media": 42, "x": 0.1})),
                "create",
            )
            .await
            .unwrap();
        assert_eq!(created.id(), Some(101));

        log.record_update("Localizations", 101, body(json!({"x": 0.5})), "update")
            .await
            .unwrap();
        log.undo().await.unwrap();
        assert_eq!(field(&store, 101, "x"), Some(json!(0.1)));

        log.record_delete("Localizations", 101, "delete")
            .await
            .unwrap();
        assert!(store.peek("Localizations", 101).is_none());

        log.undo().await.unwrap();
        let recreated = store.query("Localizations", &[]);
        assert_eq!(recreated.len(), 1);
        let b = recreated[0].id().unwrap();
        assert_ne!(b, 101);
        assert_eq!(recreated[0].get("type"), Some(&json!(7)));
        assert_eq!(recreated[0].get("media"), Some(&json!(42)));
        assert_eq!(recreated[0].get("x"), Some(&json!(0.1)));

        let commands = log.commands().await;
        assert_eq!(
            commands[0].backward,
            Operation::Delete {
                target: EntityReference::new("Localizations", b)
            }
        );
        assert_eq!(
            commands[1].forward,
            Operation::Delete {
                target: EntityReference::new("Localizations", b)
            }
        );

        // Undoing the creation now deletes the re-created entity
        log.undo().await.unwrap();
        assert_eq!(store.count("Localizations"), 0);
        assert!(!log.can_undo());
    }

    #[tokio::test]
    async fn test_delete_recreates_with_linkage() {
        let (store, log) = new_log();
        let entity = store.insert(
            "Localizations",
            body(json!({"type": 7, "x": 0.1, "modified_datetime": "2024-01-01"})),
        );
        let id = entity.id().unwrap();

        log.record_delete_with(
            "Localizations",
            id,
            Recreate::in_collection("Localizations/1")
                .with_link("media_id", 42)
                .with_link("frame", 12),
            "delete",
        )
        .await
        .unwrap();
        log.undo().await.unwrap();

        let calls = store.calls();
        assert_eq!(calls.last().unwrap().method, Method::Post);
        assert_eq!(calls.last().unwrap().path, "Localizations/1");

        let recreated = &store.query("Localizations", &[])[0];
        assert_eq!(recreated.get("media_id"), Some(&json!(42)));
        assert_eq!(recreated.get("frame"), Some(&json!(12)));
        assert_eq!(recreated.get("modified_datetime"), None);
    }

    #[tokio::test]
    async fn test_history_cap_evicts_oldest() {
        let store = Arc::new(InMemoryEntityStore::new());
        let log: Log = CommandLog::with_config(
            store.clone(),
            HistoryConfig {
                max_entries: 2,
                ..HistoryConfig::default()
            },
        );
        let id = store.insert("Localizations", body(json!({"x": 0}))).id().unwrap();
        for x in 1..=3 {
            log.record_update("Localizations", id, body(json!({"x": x})), "update")
                .await
                .unwrap();
        }
        assert_eq!(log.position(), HistoryPosition { cursor: 2, len: 2 });

        log.undo().await.unwrap();
        log.undo().await.unwrap();
        log.undo().await.unwrap();
        assert_eq!(field(&store, id, "x"), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_clear_forgets_history() {
        let (_store, log) = new_log();
        log.record_create("Localizations", body(json!({"x": 0.1})), "create")
            .await
            .unwrap();
        log.clear().await.unwrap();
        assert!(log.is_empty());
        assert!(!log.can_undo());
        assert!(log.commands().await.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_caller_does_not_cancel_command() {
        let store = Arc::new(
            InMemoryEntityStore::new().with_latency(Duration::from_millis(30)),
        );
        let log: Log = CommandLog::new(store.clone());
        let id = store.insert("Localizations", body(json!({"x": 0.1}))).id().unwrap();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(5),
            log.record_update("Localizations", id, body(json!({"x": 0.7})), "update"),
        )
        .await;
        assert!(abandoned.is_err());

        // Queues behind the abandoned-but-running command
        let commands = log.commands().await;
        assert_eq!(commands.len(), 1);
        assert_eq!(field(&store, id, "x"), Some(json!(0.7)));
        assert!(log.can_undo());
    }

    /// Store that loses the id of every created entity.
    struct IdlessStore(InMemoryEntityStore);

    #[async_trait::async_trait]
    impl EntityStore for IdlessStore {
        async fn get(&self, collection: &str, id: EntityId) -> StoreResult<Entity> {
            self.0.get(collection, id).await
        }
        async fn create(&self, collection: &str, body: &Body) -> StoreResult<Entity> {
            let mut created = self.0.create(collection, body).await?;
            created.fields.remove("id");
            Ok(created)
        }
        async fn update(&self, collection: &str, id: EntityId, patch: &Body) -> StoreResult<()> {
            self.0.update(collection, id, patch).await
        }
        async fn delete(&self, collection: &str, id: EntityId) -> StoreResult<()> {
            self.0.delete(collection, id).await
        }
        async fn list(&self, path: &str) -> StoreResult<Vec<Entity>> {
            self.0.list(path).await
        }
    }

    #[tokio::test]
    async fn test_reconciliation_failure_is_local_to_the_call() {
        let store = Arc::new(IdlessStore(InMemoryEntityStore::new()));
        let log: CommandLog<IdlessStore, &'static str> = CommandLog::new(store.clone());
        let id = store.0.insert("Localizations", body(json!({"x": 0.1}))).id().unwrap();

        let err = log
            .record_create("Localizations", body(json!({"x": 0.2})), "create")
            .await
            .unwrap_err();
        assert!(matches!(err, LogError::Reconciliation(_)));
        assert!(log.is_empty());

        // The rest of the log keeps working
        log.record_update("Localizations", id, body(json!({"x": 0.3})), "update")
            .await
            .unwrap();
        log.undo().await.unwrap();
        assert_eq!(
            store.0.peek("Localizations", id).unwrap().get("x"),
            Some(&json!(0.1))
        );
    }

    #[tokio::test]
    async fn test_undo_restores_scalar_replaced_by_object() {
        let (store, log) = new_log();
        let id = store
            .insert("Localizations", body(json!({"attributes": 5})))
            .id()
            .unwrap();

        log.record_update(
            "Localizations",
            id,
            body(json!({"attributes": {"Label": "car"}})),
            "update",
        )
        .await
        .unwrap();
        assert_eq!(
            field(&store, id, "attributes"),
            Some(json!({"Label": "car"}))
        );

        log.undo().await.unwrap();
        assert_eq!(field(&store, id, "attributes"), Some(json!(5)));
    }

    #[tokio::test]
    async fn test_repeated_replay_keeps_references_current() {
        let (store, log) = new_log();
        let created = log
            .record_create("Localizations", body(json!({"type": 7, "x": 0.1})), "create")
            .await
            .unwrap();
        log.record_delete("Localizations", created.id().unwrap(), "delete")
            .await
            .unwrap();

        let mut issued = vec![created.id().unwrap()];
        for _ in 0..3 {
            log.undo().await.unwrap();
            let live = store.query("Localizations", &[]);
            assert_eq!(live.len(), 1);
            issued.push(live[0].id().unwrap());
            log.redo().await.unwrap();
            assert_eq!(store.count("Localizations"), 0);
        }
        assert_eq!(issued, vec![101, 102, 103, 104]);

        log.undo().await.unwrap();
        let newest = store.query("Localizations", &[])[0].id().unwrap();
        assert_eq!(newest, 105);
        log.undo().await.unwrap();
        assert_eq!(log.position(), HistoryPosition { cursor: 0, len: 2 });
        assert_eq!(store.count("Localizations"), 0);

        let current = EntityReference::new("Localizations", newest);
        let commands = log.commands().await;
        assert!(commands
            .iter()
            .flat_map(|command| command.references())
            .all(|reference| *reference == current));
    }

    #[tokio::test]
    async fn test_failed_delete_snapshot_leaves_history_untouched() {
        let (store, log) = new_log();
        let id = store.insert("Localizations", body(json!({"x": 0.1}))).id().unwrap();
        log.record_update("Localizations", id, body(json!({"x": 0.2})), "update")
            .await
            .unwrap();
        let before = log.position();
        store.clear_calls();

        store.fail_next(
            Some(Method::Get),
            StoreError::Transport("connection reset".to_string()),
        );
        let err = log
            .record_delete("Localizations", id, "delete")
            .await
            .unwrap_err();
        assert!(matches!(err, LogError::Store(StoreError::Transport(_))));
        assert_eq!(log.position(), before);
        assert!(store.peek("Localizations", id).is_some());

        let methods: Vec<Method> = store.calls().iter().map(|call| call.method).collect();
        assert_eq!(methods, vec![Method::Get]);
    }

    #[tokio::test]
    async fn test_references_use_storage_collection() {
        let (store, log) = new_log();
        let created = log
            .record_create("Localizations/3", body(json!({"type": 7, "x": 0.1})), "create")
            .await
            .unwrap();
        let id = created.id().unwrap();
        log.record_update("/Localizations", id, body(json!({"x": 0.5})), "update")
            .await
            .unwrap();
        log.record_delete("Localizations/3", id, "delete")
            .await
            .unwrap();

        log.undo().await.unwrap();
        let recreated = store.query("Localizations", &[]);
        assert_eq!(recreated.len(), 1);
        let current = EntityReference::new("Localizations", recreated[0].id().unwrap());

        let commands = log.commands().await;
        assert!(commands
            .iter()
            .flat_map(|command| command.references())
            .all(|reference| *reference == current));

        // The update now undoes against the re-created entity
        log.undo().await.unwrap();
        assert_eq!(
            store.peek("Localizations", current.id).unwrap().get("x"),
            Some(&json!(0.1))
        );
    }

    /// Store that hands out a fixed sequence of ids, reusing them at will.
    struct ScriptedIdStore {
        ids: parking_lot::Mutex<std::collections::VecDeque<EntityId>>,
    }

    #[async_trait::async_trait]
    impl EntityStore for ScriptedIdStore {
        async fn get(&self, _collection: &str, id: EntityId) -> StoreResult<Entity> {
            Ok(Entity::new(body(json!({"id": id, "x": 0.1}))))
        }
        async fn create(&self, _collection: &str, created: &Body) -> StoreResult<Entity> {
            let id = self
                .ids
                .lock()
                .pop_front()
                .ok_or_else(|| StoreError::Transport("out of ids".to_string()))?;
            let mut fields = created.clone();
            fields.insert("id".to_string(), json!(id));
            Ok(Entity::new(fields))
        }
        async fn update(&self, _collection: &str, _id: EntityId, _patch: &Body) -> StoreResult<()> {
            Ok(())
        }
        async fn delete(&self, _collection: &str, _id: EntityId) -> StoreResult<()> {
            Ok(())
        }
        async fn list(&self, _path: &str) -> StoreResult<Vec<Entity>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_reused_id_is_a_reconciliation_failure() {
        let store = Arc::new(ScriptedIdStore {
            ids: parking_lot::Mutex::new([101, 102, 102].into_iter().collect()),
        });
        let log: CommandLog<ScriptedIdStore, &'static str> = CommandLog::new(store);
        log.record_create("Localizations", body(json!({"x": 0.1})), "first")
            .await
            .unwrap();
        log.record_create("Localizations", body(json!({"x": 0.2})), "second")
            .await
            .unwrap();
        log.undo().await.unwrap();
        log.undo().await.unwrap();
        let before = log.position();

        // Redoing the first creation comes back as 102, which the second still owns
        let err = log.redo().await.unwrap_err();
        assert!(matches!(err, LogError::Reconciliation(_)));
        assert_eq!(log.position(), before);

        let commands = log.commands().await;
        assert_eq!(
            commands[0].backward,
            Operation::Delete {
                target: EntityReference::new("Localizations", 101)
            }
        );
        assert_eq!(
            commands[1].backward,
            Operation::Delete {
                target: EntityReference::new("Localizations", 102)
            }
        );
    }
}
