// ============================================================================
// Context Registry
// ============================================================================
//
// Owns the singleton main context and lazily creates one private context
// per worker thread. The thread that constructs the registry is the main
// owner; per-worker contexts live in a map keyed by thread identity, with
// the lock held only for lookup and insertion.
//
// ============================================================================

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use tracing::debug;

use crate::context::Context;
use crate::store::StoreCoordinator;

pub struct ContextRegistry {
    store: Arc<StoreCoordinator>,
    main_thread: ThreadId,
    main_context: Arc<Context>,
    workers: Mutex<HashMap<ThreadId, Arc<Context>>>,
}

impl ContextRegistry {
    /// Binds the calling thread as the main owner.
    pub(crate) fn new(store: Arc<StoreCoordinator>) -> Self {
        let main_context = Context::new(Arc::clone(&store));
        Self {
            store,
            main_thread: thread::current().id(),
            main_context,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<StoreCoordinator> {
        &self.store
    }

    pub fn is_main_thread(&self) -> bool {
        thread::current().id() == self.main_thread
    }

    /// The singleton context owned by the main thread.
    pub fn main_context(&self) -> &Arc<Context> {
        &self.main_context
    }

    /// Resolves the calling thread's context.
    ///
    /// The main thread always gets the main context. Any other thread gets
    /// its private context, created on first access and cached for the
    /// thread's lifetime.
    pub fn current_context(&self) -> Arc<Context> {
        if self.is_main_thread() {
            return Arc::clone(&self.main_context);
        }

        let thread_id = thread::current().id();
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        let context = workers.entry(thread_id).or_insert_with(|| {
            debug!(?thread_id, "creating private context for worker thread");
            Context::new(Arc::clone(&self.store))
        });
        Arc::clone(context)
    }

    /// Number of worker contexts created so far.
    pub fn worker_context_count(&self) -> usize {
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
