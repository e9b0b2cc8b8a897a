// ============================================================================
// Context — thread-confined working set over the store
// ============================================================================
//
// A context buffers inserts, field updates and deletions until commit. The
// registry guarantees each context is only ever used from its owning
// thread; state still sits behind a mutex so the type is Send + Sync for
// the registry map and the merge hop.
//
// ============================================================================

pub mod watch;

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::core::{ContextId, EntityKind, Record, RecordId, Result, StoreError, Value};
use crate::events::{CommitEvent, EventBus, ObjectsChangedEvent};
use crate::store::{StoreCoordinator, UnitOfWork};

use watch::{FieldWatchHandler, WatchTable};

struct ContextState {
    /// Working copies of records this context has created or faulted in.
    registered: HashMap<RecordId, Record>,
    pending_inserts: HashSet<RecordId>,
    pending_updates: HashSet<RecordId>,
    /// Kind captured at delete time; the store cannot answer afterwards.
    pending_deletes: HashMap<RecordId, EntityKind>,
    watches: WatchTable,
}

impl ContextState {
    fn new() -> Self {
        Self {
            registered: HashMap::new(),
            pending_inserts: HashSet::new(),
            pending_updates: HashSet::new(),
            pending_deletes: HashMap::new(),
            watches: WatchTable::new(),
        }
    }

    fn has_changes(&self) -> bool {
        !self.pending_inserts.is_empty()
            || !self.pending_updates.is_empty()
            || !self.pending_deletes.is_empty()
    }
}

/// A mutable working-set view over the store, confined to one owner.
pub struct Context {
    id: ContextId,
    store: Arc<StoreCoordinator>,
    state: Mutex<ContextState>,
    change_bus: EventBus<ObjectsChangedEvent>,
}

impl Context {
    pub(crate) fn new(store: Arc<StoreCoordinator>) -> Arc<Self> {
        let context = Arc::new(Self {
            id: ContextId::next(),
            store,
            state: Mutex::new(ContextState::new()),
            change_bus: EventBus::new(),
        });
        debug!(context = %context.id, "context created");
        context
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn store(&self) -> &Arc<StoreCoordinator> {
        &self.store
    }

    /// The bus carrying this context's post-commit and post-merge change
    /// events. Change observers subscribe here.
    pub fn change_bus(&self) -> &EventBus<ObjectsChangedEvent> {
        &self.change_bus
    }

    fn lock(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Creates a new record of the given kind, buffered until commit.
    ///
    /// The returned record is a snapshot of the working copy; further
    /// mutations go through [`Context::update`].
    pub fn insert(&self, kind: impl Into<EntityKind>) -> Result<Record> {
        let kind = kind.into();
        self.store.schema().require(&kind)?;

        let record = Record::new(kind);
        let mut state = self.lock();
        state.pending_inserts.insert(record.id());
        state.registered.insert(record.id(), record.clone());
        Ok(record)
    }

    /// Resolves an identity to its current working copy, faulting it in
    /// from the store on first access. Locally deleted identities resolve
    /// to `None`.
    pub fn get(&self, id: RecordId) -> Option<Record> {
        let mut state = self.lock();
        if state.pending_deletes.contains_key(&id) {
            return None;
        }
        if let Some(record) = state.registered.get(&id) {
            return Some(record.clone());
        }
        let record = self.store.get(id)?;
        state.registered.insert(id, record.clone());
        Some(record)
    }

    /// Buffers a field update on a record's working copy.
    ///
    /// Setting a field to the value it already holds is a no-op: no pending
    /// change is recorded and no field watch fires.
    pub fn update(&self, id: RecordId, field: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let mut state = self.lock();

        if state.pending_deletes.contains_key(&id) {
            return Err(StoreError::RecordNotFound(id));
        }
        if !state.registered.contains_key(&id) {
            let record = self
                .store
                .get(id)
                .ok_or(StoreError::RecordNotFound(id))?;
            state.registered.insert(id, record);
        }

        let kind = state.registered[&id].kind().clone();
        if let Some(def) = self.store.schema().entity(&kind) {
            def.validate_value(field, &value)?;
        }

        let record = state
            .registered
            .get_mut(&id)
            .ok_or(StoreError::RecordNotFound(id))?;
        let old = record.set(field, value.clone());
        if old.as_ref() == Some(&value) {
            return Ok(());
        }

        if !state.pending_inserts.contains(&id) {
            state.pending_updates.insert(id);
        }
        let handler = state.watches.handler_for(id, field);
        drop(state);

        if let Some(handler) = handler {
            handler(old.as_ref(), Some(&value));
        }
        Ok(())
    }

    /// Buffers a deletion. Deleting a record that was inserted in this
    /// context and never committed simply discards it.
    pub fn delete(&self, id: RecordId) -> Result<()> {
        let mut state = self.lock();

        if state.pending_inserts.remove(&id) {
            state.registered.remove(&id);
            state.watches.evict(id);
            return Ok(());
        }

        let kind = match state.registered.get(&id) {
            Some(record) => record.kind().clone(),
            None => self
                .store
                .kind_of(id)
                .ok_or(StoreError::RecordNotFound(id))?,
        };
        state.registered.remove(&id);
        state.pending_updates.remove(&id);
        state.pending_deletes.insert(id, kind);
        state.watches.evict(id);
        Ok(())
    }

    /// All records of a kind as seen through this context: store contents
    /// overlaid with this context's uncommitted changes.
    pub fn all(&self, kind: impl Into<EntityKind>) -> Result<Vec<Record>> {
        let kind = kind.into();
        let stored = self.store.fetch_all(&kind, None)?;
        let state = self.lock();

        let mut records: Vec<Record> = stored
            .into_iter()
            .filter(|r| !state.pending_deletes.contains_key(&r.id()))
            .map(|r| {
                if state.pending_updates.contains(&r.id()) {
                    state.registered[&r.id()].clone()
                } else {
                    r
                }
            })
            .collect();

        for id in &state.pending_inserts {
            if let Some(record) = state.registered.get(id) {
                if record.kind() == &kind {
                    records.push(record.clone());
                }
            }
        }
        Ok(records)
    }

    pub fn all_matching(
        &self,
        kind: impl Into<EntityKind>,
        predicate: impl Fn(&Record) -> bool,
    ) -> Result<Vec<Record>> {
        let mut records = self.all(kind)?;
        records.retain(|r| predicate(r));
        Ok(records)
    }

    pub fn first_matching(
        &self,
        kind: impl Into<EntityKind>,
        predicate: impl Fn(&Record) -> bool,
    ) -> Result<Option<Record>> {
        Ok(self.all_matching(kind, predicate)?.into_iter().next())
    }

    /// All records of a kind ordered by one field. Missing and NULL values
    /// sort last; values of incomparable types keep their relative order.
    pub fn all_sorted(
        &self,
        kind: impl Into<EntityKind>,
        field: &str,
    ) -> Result<Vec<Record>> {
        let mut records = self.all(kind)?;
        records.sort_by(|a, b| {
            let left = a.get(field).unwrap_or(&Value::Null);
            let right = b.get(field).unwrap_or(&Value::Null);
            left.compare(right).unwrap_or(Ordering::Equal)
        });
        Ok(records)
    }

    pub fn has_changes(&self) -> bool {
        self.lock().has_changes()
    }

    /// Commits buffered changes to the store. A no-op when nothing is
    /// pending. On rejection the buffer is retained for inspection or
    /// retry.
    pub fn commit(&self) -> Result<()> {
        let work = {
            let state = self.lock();
            if !state.has_changes() {
                return Ok(());
            }
            let mut work = UnitOfWork::for_context(self.id);
            for id in &state.pending_inserts {
                work.inserts.push(state.registered[id].clone());
            }
            for id in &state.pending_updates {
                work.updates.push(state.registered[id].clone());
            }
            work.deletes.extend(state.pending_deletes.keys().copied());
            work
        };

        // No context lock held: the store publishes the commit event
        // synchronously on this thread.
        let event = self.store.apply(work)?;

        {
            let mut state = self.lock();
            state.pending_inserts.clear();
            state.pending_updates.clear();
            state.pending_deletes.clear();
        }

        debug!(context = %self.id, "context committed");
        self.change_bus
            .publish(&ObjectsChangedEvent::from_commit(&event));
        Ok(())
    }

    /// Folds another context's committed changes into this context's
    /// in-memory state. This is a merge, not a second commit: it refreshes
    /// or evicts working copies to match the already-durable store state
    /// and publishes a change event, but never re-enters the commit path.
    ///
    /// Idempotent under repeated delivery of the same event.
    pub(crate) fn merge(&self, event: &CommitEvent) {
        {
            let mut state = self.lock();
            for id in &event.updated {
                if state.registered.contains_key(id) {
                    // An identity the store no longer resolves is silently
                    // skipped rather than failing the batch.
                    if let Some(fresh) = self.store.get(*id) {
                        state.registered.insert(*id, fresh);
                    }
                }
            }
            for id in &event.deleted {
                state.registered.remove(id);
                state.pending_updates.remove(id);
                state.pending_deletes.remove(id);
                state.watches.evict(*id);
            }
            // Inserted identities need no action: they resolve through the
            // store on first access.
        }

        debug!(context = %self.id, from = %event.context, "merged foreign commit");
        self.change_bus
            .publish(&ObjectsChangedEvent::from_commit(event));
    }

    /// Discards every working copy, buffered change and field watch,
    /// returning the context to its freshly created state.
    pub fn reset(&self) {
        let mut state = self.lock();
        *state = ContextState::new();
        debug!(context = %self.id, "context reset");
    }

    /// Publishes a change event for mutations the store never sees.
    pub fn post_objects_changed(&self, event: ObjectsChangedEvent) {
        if !event.is_empty() {
            self.change_bus.publish(&event);
        }
    }

    /// Watches one field of a record, replacing any previous handler for
    /// that field. The handler receives the old and new values whenever a
    /// buffered update changes the field.
    pub fn watch_field(
        &self,
        id: RecordId,
        field: impl Into<String>,
        handler: impl Fn(Option<&Value>, Option<&Value>) + Send + Sync + 'static,
    ) -> Result<()> {
        let mut state = self.lock();
        if state.pending_deletes.contains_key(&id) {
            return Err(StoreError::RecordNotFound(id));
        }
        if !state.registered.contains_key(&id) && !self.store.contains(id) {
            return Err(StoreError::RecordNotFound(id));
        }
        let handler: FieldWatchHandler = Arc::new(handler);
        state.watches.insert(id, field, handler);
        Ok(())
    }

    pub fn unwatch_field(&self, id: RecordId, field: &str) -> bool {
        self.lock().watches.remove(id, field)
    }

    #[cfg(test)]
    fn registered_count(&self) -> usize {
        self.lock().registered.len()
    }
}
