// ============================================================================
// Data Stack — top-level assembly
// ============================================================================
//
// Wires the store, the context registry and the merge coordinator together
// behind one handle. The thread that builds the stack becomes the main
// thread; everything else reaches the stack through Arc clones.
//
// ============================================================================

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use tracing::{error, info};

use crate::context::Context;
use crate::coordinator::MergeCoordinator;
use crate::core::{ContextId, RecordId, Result, StoreError};
use crate::events::{ObjectsChangedEvent, SubscriptionId};
use crate::observer::ChangeObserver;
use crate::registry::ContextRegistry;
use crate::store::{DurabilityMode, Schema, StoreConfig, StoreCoordinator};

/// Hooks for application-level reactions to stack events.
///
/// All methods have empty default bodies; implement only what you need.
pub trait StackDelegate: Send + Sync {
    /// A call to [`DataStack::save_current_context`] failed. The context's
    /// buffered changes are retained; the delegate decides whether to fix
    /// and retry, discard, or surface the error.
    fn on_save_failure(&self, _context: ContextId, _error: &StoreError) {}

    /// The main context's contents changed, either by its own commit or by
    /// a merged foreign commit.
    fn on_main_context_changed(&self) {}
}

/// Builds a [`DataStack`] from a schema and optional persistence settings.
pub struct DataStackBuilder {
    schema: Option<Schema>,
    path: Option<PathBuf>,
    durability: DurabilityMode,
}

impl DataStackBuilder {
    pub fn new() -> Self {
        Self {
            schema: None,
            path: None,
            durability: DurabilityMode::default(),
        }
    }

    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Snapshot file for durable storage. Without a path the stack runs
    /// purely in memory.
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn durability(mut self, durability: DurabilityMode) -> Self {
        self.durability = durability;
        self
    }

    /// Opens the store and assembles the stack on the calling thread,
    /// which becomes the main thread.
    ///
    /// # Panics
    ///
    /// Panics if no schema was provided. A stack without a schema cannot
    /// validate or store anything; this is a programming error, not a
    /// runtime condition.
    pub fn build(self) -> Result<Arc<DataStack>> {
        let schema = self.schema.expect("DataStackBuilder requires a schema");

        let mut config = StoreConfig::new(schema).durability(self.durability);
        if let Some(path) = self.path {
            config = config.path(path);
        }

        let store = StoreCoordinator::open(config)?;
        let registry = Arc::new(ContextRegistry::new(Arc::clone(&store)));
        let coordinator = MergeCoordinator::attach(Arc::clone(&registry));

        let delegate: Arc<RwLock<Option<Arc<dyn StackDelegate>>>> =
            Arc::new(RwLock::new(None));
        let delegate_hook = Arc::clone(&delegate);
        let main_changed_sub = registry
            .main_context()
            .change_bus()
            .subscribe(move |_: &ObjectsChangedEvent| {
                let current = delegate_hook
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                if let Some(delegate) = current {
                    delegate.on_main_context_changed();
                }
            });

        info!(store = %store.id(), "data stack opened");
        Ok(Arc::new(DataStack {
            store,
            registry,
            coordinator,
            delegate,
            main_changed_sub,
        }))
    }
}

impl Default for DataStackBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The assembled store, registry and merge coordinator.
pub struct DataStack {
    store: Arc<StoreCoordinator>,
    registry: Arc<ContextRegistry>,
    coordinator: Arc<MergeCoordinator>,
    delegate: Arc<RwLock<Option<Arc<dyn StackDelegate>>>>,
    main_changed_sub: SubscriptionId,
}

impl DataStack {
    pub fn builder() -> DataStackBuilder {
        DataStackBuilder::new()
    }

    pub fn store(&self) -> &Arc<StoreCoordinator> {
        &self.store
    }

    /// The singleton context owned by the main thread.
    pub fn main_context(&self) -> &Arc<Context> {
        self.registry.main_context()
    }

    /// The calling thread's context: the main context on the main thread,
    /// a private per-thread context anywhere else.
    pub fn current_context(&self) -> Arc<Context> {
        self.registry.current_context()
    }

    pub fn is_main_thread(&self) -> bool {
        self.registry.is_main_thread()
    }

    pub fn set_delegate(&self, delegate: Arc<dyn StackDelegate>) {
        let mut slot = self.delegate.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(delegate);
    }

    pub fn clear_delegate(&self) {
        let mut slot = self.delegate.write().unwrap_or_else(|e| e.into_inner());
        *slot = None;
    }

    /// Commits the calling thread's context.
    ///
    /// A failed save never aborts: the error is routed to the delegate (or
    /// logged when none is set) and returned, with the context's buffered
    /// changes left intact for inspection or retry.
    pub fn save_current_context(&self) -> Result<()> {
        let context = self.current_context();
        match context.commit() {
            Ok(()) => Ok(()),
            Err(err) => {
                let delegate = self
                    .delegate
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                match delegate {
                    Some(delegate) => delegate.on_save_failure(context.id(), &err),
                    None => error!(context = %context.id(), %err, "context save failed"),
                }
                Err(err)
            }
        }
    }

    /// Folds queued foreign commits into the main context. Must be called
    /// periodically from the main thread; returns the number of merges
    /// applied.
    pub fn process_pending_merges(&self) -> Result<usize> {
        self.coordinator.process_pending()
    }

    /// A change observer bound to the main context's change bus.
    pub fn observer(&self) -> ChangeObserver {
        ChangeObserver::new(Arc::clone(self.registry.main_context()))
    }

    /// Reports updates the store never saw (in-memory mutations of working
    /// copies) on the calling thread's context, so observers can react.
    pub fn post_change_notification(&self, ids: impl IntoIterator<Item = RecordId>) {
        self.current_context()
            .post_objects_changed(ObjectsChangedEvent::updated_only(ids));
    }

    /// Drops every record from the store and clears the main context's
    /// working set. Worker contexts are not reachable from here; their
    /// owners should discard them after a reset.
    pub fn reset(&self) -> Result<()> {
        self.store.reset()?;
        self.registry.main_context().reset();
        info!(store = %self.store.id(), "data stack reset");
        Ok(())
    }
}

impl Drop for DataStack {
    fn drop(&mut self) {
        self.registry
            .main_context()
            .change_bus()
            .unsubscribe(self.main_changed_sub);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DataType;
    use crate::store::{EntityDef, FieldDef};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn schema() -> Schema {
        Schema::new(vec![EntityDef::new("Note")
            .field(FieldDef::new("title", DataType::Text).required())])
    }

    fn stack() -> Arc<DataStack> {
        DataStack::builder()
            .schema(schema())
            .durability(DurabilityMode::None)
            .build()
            .unwrap()
    }

    struct RecordingDelegate {
        failures: Mutex<Vec<ContextId>>,
        main_changes: AtomicUsize,
    }

    impl RecordingDelegate {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                failures: Mutex::new(Vec::new()),
                main_changes: AtomicUsize::new(0),
            })
        }
    }

    impl StackDelegate for RecordingDelegate {
        fn on_save_failure(&self, context: ContextId, _error: &StoreError) {
            self.failures.lock().unwrap().push(context);
        }

        fn on_main_context_changed(&self) {
            self.main_changes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_save_failure_reaches_delegate_and_retains_changes() {
        let stack = stack();
        let delegate = RecordingDelegate::new();
        stack.set_delegate(delegate.clone() as Arc<dyn StackDelegate>);

        let context = stack.current_context();
        let record = context.insert("Note").unwrap();
        // Required title missing.
        assert!(stack.save_current_context().is_err());
        assert_eq!(delegate.failures.lock().unwrap().len(), 1);
        assert!(context.has_changes());

        context.update(record.id(), "title", "fixed").unwrap();
        stack.save_current_context().unwrap();
        assert!(!context.has_changes());
    }

    #[test]
    fn test_main_context_change_notifies_delegate() {
        let stack = stack();
        let delegate = RecordingDelegate::new();
        stack.set_delegate(delegate.clone() as Arc<dyn StackDelegate>);

        let context = stack.main_context();
        let record = context.insert("Note").unwrap();
        context.update(record.id(), "title", "hello").unwrap();
        stack.save_current_context().unwrap();

        assert_eq!(delegate.main_changes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_worker_save_merges_into_main_on_pump() {
        let stack = stack();
        let delegate = RecordingDelegate::new();
        stack.set_delegate(delegate.clone() as Arc<dyn StackDelegate>);

        let stack_clone = Arc::clone(&stack);
        let id = std::thread::spawn(move || {
            let context = stack_clone.current_context();
            let record = context.insert("Note").unwrap();
            context.update(record.id(), "title", "remote").unwrap();
            stack_clone.save_current_context().unwrap();
            record.id()
        })
        .join()
        .unwrap();

        assert_eq!(stack.process_pending_merges().unwrap(), 1);
        assert!(stack.main_context().get(id).is_some());
        assert_eq!(delegate.main_changes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_post_change_notification_reaches_observer() {
        let stack = stack();
        let context = stack.main_context();
        let record = context.insert("Note").unwrap();
        context.update(record.id(), "title", "watched").unwrap();
        stack.save_current_context().unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        let mut observer = stack.observer();
        observer.observe_object(record.id(), move |updated, _| {
            hits_clone.fetch_add(updated.len(), Ordering::SeqCst);
        });

        stack.post_change_notification([record.id()]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reset_clears_store_and_main_context() {
        let stack = stack();
        let context = stack.main_context();
        let record = context.insert("Note").unwrap();
        context.update(record.id(), "title", "gone").unwrap();
        stack.save_current_context().unwrap();
        assert_eq!(stack.store().record_count(), 1);

        stack.reset().unwrap();
        assert_eq!(stack.store().record_count(), 0);
        assert!(stack.main_context().get(record.id()).is_none());
        assert!(!stack.main_context().has_changes());
    }

    #[test]
    #[should_panic(expected = "requires a schema")]
    fn test_build_without_schema_panics() {
        let _ = DataStack::builder().build();
    }
}
