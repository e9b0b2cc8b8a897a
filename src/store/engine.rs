// ============================================================================
// Store Coordinator
// ============================================================================
//
// The authoritative record repository shared by every context. Accepts
// units of work, commits them atomically against the schema, publishes a
// CommitEvent per successful commit, and hands snapshots to the persister.
//
// ============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::core::{ContextId, EntityKind, Record, RecordId, Result, StoreError, StoreId};
use crate::events::{CommitEvent, EventBus};
use crate::store::persistence::{Persister, SnapshotStore, StoreSnapshot, Tables};
use crate::store::schema::{DurabilityMode, Schema, StoreConfig};

/// A context's buffered mutations, submitted for durable commit.
#[derive(Debug, Default)]
pub struct UnitOfWork {
    pub context: Option<ContextId>,
    pub inserts: Vec<Record>,
    pub updates: Vec<Record>,
    pub deletes: Vec<RecordId>,
}

impl UnitOfWork {
    pub fn for_context(context: ContextId) -> Self {
        Self {
            context: Some(context),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

struct EngineState {
    tables: Tables,
    // Identity index over all tables, also the source of kinds for deleted
    // ids captured into commit events.
    ids: HashMap<RecordId, EntityKind>,
}

impl EngineState {
    fn from_tables(tables: Tables) -> Self {
        let ids = tables
            .iter()
            .flat_map(|(kind, records)| records.keys().map(move |id| (*id, kind.clone())))
            .collect();
        Self { tables, ids }
    }
}

/// Durable record repository, safely shared read-mostly across contexts.
pub struct StoreCoordinator {
    id: StoreId,
    schema: Schema,
    state: RwLock<EngineState>,
    commit_bus: EventBus<CommitEvent>,
    persister: Persister,
}

impl StoreCoordinator {
    /// Opens a store, loading an existing snapshot when one is present at
    /// the configured path.
    pub fn open(config: StoreConfig) -> Result<Arc<Self>> {
        let tables = match (&config.path, config.durability) {
            (Some(path), mode) if mode != DurabilityMode::None => {
                match SnapshotStore::new(path).load()? {
                    Some(snapshot) => snapshot.tables,
                    None => Tables::new(),
                }
            }
            _ => Tables::new(),
        };

        let persister = Persister::new(config.path, config.durability);
        let store = Arc::new(Self {
            id: StoreId::new(),
            schema: config.schema,
            state: RwLock::new(EngineState::from_tables(tables)),
            commit_bus: EventBus::new(),
            persister,
        });
        debug!(store = %store.id, "store opened");
        Ok(store)
    }

    pub fn id(&self) -> StoreId {
        self.id
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// The bus carrying one [`CommitEvent`] per successful commit against
    /// this store.
    pub fn commit_bus(&self) -> &EventBus<CommitEvent> {
        &self.commit_bus
    }

    /// Commits a unit of work atomically.
    ///
    /// The whole unit is validated before any mutation is applied; a
    /// rejected unit leaves the store untouched. On success the commit
    /// event is published to the commit bus and returned.
    pub fn apply(&self, work: UnitOfWork) -> Result<CommitEvent> {
        let mut state = self.state.write()?;

        // Validate everything up front so a rejection cannot leave a
        // half-applied unit behind.
        for record in &work.inserts {
            let def = self.schema.require(record.kind())?;
            def.validate(record, true)?;
            if state.ids.contains_key(&record.id()) {
                return Err(StoreError::ValidationFailed(format!(
                    "Record '{}' already exists",
                    record.id()
                )));
            }
        }
        for record in &work.updates {
            let def = self.schema.require(record.kind())?;
            def.validate(record, true)?;
            if !state.ids.contains_key(&record.id()) {
                return Err(StoreError::RecordNotFound(record.id()));
            }
        }

        let mut inserted = HashSet::new();
        let mut updated = HashSet::new();
        let mut deleted = HashSet::new();
        let mut kinds = HashMap::new();

        // Mutate a copy of the tables so a rejected snapshot write leaves
        // the authoritative state untouched and the unit can be retried.
        let mut tables = state.tables.clone();
        let mut ids = state.ids.clone();

        for record in work.inserts {
            let id = record.id();
            let kind = record.kind().clone();
            ids.insert(id, kind.clone());
            tables.entry(kind.clone()).or_default().insert(id, record);
            inserted.insert(id);
            kinds.insert(id, kind);
        }
        for record in work.updates {
            let id = record.id();
            let kind = record.kind().clone();
            tables.entry(kind).or_default().insert(id, record);
            updated.insert(id);
        }
        for id in work.deletes {
            // Deleting an identity the store no longer holds is a no-op.
            if let Some(kind) = ids.remove(&id) {
                if let Some(records) = tables.get_mut(&kind) {
                    records.remove(&id);
                }
                deleted.insert(id);
                kinds.insert(id, kind);
            }
        }

        // Sync durability surfaces a write failure as a commit rejection;
        // the swap below only happens once the snapshot is on disk. The
        // write lock stays held so no reader or commit interleaves.
        self.persister.persist(StoreSnapshot::new(tables.clone()))?;

        state.tables = tables;
        state.ids = ids;
        drop(state);

        let event = CommitEvent {
            store: self.id,
            context: work.context.unwrap_or_else(ContextId::next),
            inserted,
            updated,
            deleted,
            kinds,
        };

        debug!(
            store = %self.id,
            context = %event.context,
            inserted = event.inserted.len(),
            updated = event.updated.len(),
            deleted = event.deleted.len(),
            "unit of work committed"
        );

        if !event.is_empty() {
            self.commit_bus.publish(&event);
        }
        Ok(event)
    }

    /// Fetches all records of a kind, optionally filtered by a predicate.
    pub fn fetch_all(
        &self,
        kind: &EntityKind,
        predicate: Option<&dyn Fn(&Record) -> bool>,
    ) -> Result<Vec<Record>> {
        self.schema.require(kind)?;
        let state = self.state.read()?;
        let records = match state.tables.get(kind) {
            Some(records) => records
                .values()
                .filter(|r| predicate.map(|p| p(r)).unwrap_or(true))
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        Ok(records)
    }

    pub fn get(&self, id: RecordId) -> Option<Record> {
        let state = self.state.read().ok()?;
        let kind = state.ids.get(&id)?;
        state.tables.get(kind)?.get(&id).cloned()
    }

    pub fn kind_of(&self, id: RecordId) -> Option<EntityKind> {
        let state = self.state.read().ok()?;
        state.ids.get(&id).cloned()
    }

    pub fn contains(&self, id: RecordId) -> bool {
        self.state
            .read()
            .map(|state| state.ids.contains_key(&id))
            .unwrap_or(false)
    }

    pub fn record_count(&self) -> usize {
        self.state.read().map(|state| state.ids.len()).unwrap_or(0)
    }

    /// Wipes every table and persists the empty state.
    pub fn reset(&self) -> Result<()> {
        let mut state = self.state.write()?;
        state.tables.clear();
        state.ids.clear();
        drop(state);
        self.persister.persist(StoreSnapshot::new(Tables::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DataType;
    use crate::store::schema::{EntityDef, FieldDef};

    fn open_store() -> Arc<StoreCoordinator> {
        let schema = Schema::new(vec![
            EntityDef::new("Note").field(FieldDef::new("title", DataType::Text).required()),
            EntityDef::new("Task"),
        ]);
        StoreCoordinator::open(StoreConfig::new(schema).durability(DurabilityMode::None)).unwrap()
    }

    fn note(title: &str) -> Record {
        let mut record = Record::new(EntityKind::new("Note"));
        record.set("title", title);
        record
    }

    #[test]
    fn test_apply_insert_and_fetch() {
        let store = open_store();
        let record = note("first");
        let id = record.id();

        let mut work = UnitOfWork::for_context(ContextId::next());
        work.inserts.push(record);
        let event = store.apply(work).unwrap();

        assert!(event.inserted.contains(&id));
        assert_eq!(event.kinds.get(&id), Some(&EntityKind::new("Note")));
        assert_eq!(store.get(id).unwrap().get("title"), Some(&"first".into()));
        assert_eq!(
            store.fetch_all(&EntityKind::new("Note"), None).unwrap().len(),
            1
        );
    }

    #[test]
    fn test_apply_rejects_unknown_kind() {
        let store = open_store();
        let mut work = UnitOfWork::for_context(ContextId::next());
        work.inserts.push(Record::new(EntityKind::new("Ghost")));
        assert!(matches!(
            store.apply(work),
            Err(StoreError::KindNotFound(_))
        ));
        assert_eq!(store.record_count(), 0);
    }

    #[test]
    fn test_apply_rejects_invalid_insert_atomically() {
        let store = open_store();
        let mut work = UnitOfWork::for_context(ContextId::next());
        work.inserts.push(note("valid"));
        work.inserts.push(Record::new(EntityKind::new("Note"))); // missing title
        assert!(store.apply(work).is_err());
        // Nothing from the rejected unit landed.
        assert_eq!(store.record_count(), 0);
    }

    #[test]
    fn test_update_of_missing_record_is_rejected() {
        let store = open_store();
        let mut work = UnitOfWork::for_context(ContextId::next());
        work.updates.push(note("orphan"));
        assert!(matches!(
            store.apply(work),
            Err(StoreError::RecordNotFound(_))
        ));
    }

    #[test]
    fn test_delete_of_missing_record_is_noop() {
        let store = open_store();
        let mut work = UnitOfWork::for_context(ContextId::next());
        work.deletes.push(RecordId::new());
        let event = store.apply(work).unwrap();
        assert!(event.deleted.is_empty());
    }

    #[test]
    fn test_commit_bus_receives_events() {
        let store = open_store();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        store.commit_bus().subscribe(move |event: &CommitEvent| {
            seen_clone.lock().unwrap().push(event.clone());
        });

        let record = note("observed");
        let id = record.id();
        let mut work = UnitOfWork::for_context(ContextId::next());
        work.inserts.push(record);
        store.apply(work).unwrap();

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].inserted.contains(&id));
    }

    #[test]
    fn test_predicate_fetch() {
        let store = open_store();
        let mut work = UnitOfWork::for_context(ContextId::next());
        work.inserts.push(note("keep"));
        work.inserts.push(note("skip"));
        store.apply(work).unwrap();

        let kept = store
            .fetch_all(
                &EntityKind::new("Note"),
                Some(&|r: &Record| r.get("title") == Some(&"keep".into())),
            )
            .unwrap();
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn test_sync_write_failure_rejects_commit_atomically() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the snapshot's parent directory should be
        // makes every write fail.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();

        let schema = Schema::new(vec![EntityDef::new("Task")]);
        let store = StoreCoordinator::open(
            StoreConfig::new(schema)
                .path(blocker.join("data.snapshot"))
                .durability(DurabilityMode::Sync),
        )
        .unwrap();

        let record = Record::new(EntityKind::new("Task"));
        let id = record.id();
        let mut work = UnitOfWork::for_context(ContextId::next());
        work.inserts.push(record);

        assert!(matches!(
            store.apply(work),
            Err(StoreError::PersistenceFailed(_))
        ));
        // The rejected unit never landed.
        assert!(store.get(id).is_none());
        assert_eq!(store.record_count(), 0);
    }

    #[test]
    fn test_reset_clears_tables() {
        let store = open_store();
        let mut work = UnitOfWork::for_context(ContextId::next());
        work.inserts.push(note("gone"));
        store.apply(work).unwrap();

        store.reset().unwrap();
        assert_eq!(store.record_count(), 0);
    }
}
