// ============================================================================
// Merge Coordinator
// ============================================================================
//
// Keeps the main context eventually consistent with commits made by any
// other context sharing its store. Commit events arrive synchronously on
// the committing thread; foreign commits made off the main thread are
// queued (FIFO) and folded into the main context when the main thread
// drains the queue.
//
// ============================================================================

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::core::{Result, StoreError};
use crate::events::{CommitEvent, SubscriptionId};
use crate::registry::ContextRegistry;

pub struct MergeCoordinator {
    registry: Arc<ContextRegistry>,
    queue_tx: Sender<CommitEvent>,
    queue_rx: Mutex<Receiver<CommitEvent>>,
    subscription: SubscriptionId,
}

impl MergeCoordinator {
    /// Subscribes to the registry's store commit bus. Holds only a weak
    /// reference from the bus back to itself so dropping the coordinator
    /// tears the subscription down.
    pub(crate) fn attach(registry: Arc<ContextRegistry>) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel();
        Arc::new_cyclic(|weak: &std::sync::Weak<Self>| {
            let weak = weak.clone();
            let subscription = registry
                .store()
                .commit_bus()
                .subscribe(move |event: &CommitEvent| {
                    if let Some(coordinator) = weak.upgrade() {
                        coordinator.handle_commit(event);
                    }
                });
            Self {
                registry,
                queue_tx,
                queue_rx: Mutex::new(queue_rx),
                subscription,
            }
        })
    }

    /// Runs the merge algorithm for one commit event.
    ///
    /// Commits from the main context itself and from unrelated stores are
    /// ignored. Foreign commits are merged immediately when already on the
    /// main thread, otherwise queued for [`MergeCoordinator::process_pending`]
    /// without blocking the committing thread.
    pub(crate) fn handle_commit(&self, event: &CommitEvent) {
        // A context never merges into itself.
        if event.context == self.registry.main_context().id() {
            return;
        }
        // Not our store: someone else's business.
        if event.store != self.registry.store().id() {
            warn!(store = %event.store, "ignoring commit event from unrelated store");
            return;
        }

        if self.registry.is_main_thread() {
            self.apply_merge(event);
        } else {
            debug!(context = %event.context, "queueing merge for main thread");
            if self.queue_tx.send(event.clone()).is_err() {
                warn!("merge queue closed; commit event dropped");
            }
        }
    }

    fn apply_merge(&self, event: &CommitEvent) {
        self.registry.main_context().merge(event);
    }

    /// Drains queued foreign commits into the main context, preserving
    /// commit order. Must be called from the main thread; returns the
    /// number of merges applied.
    pub fn process_pending(&self) -> Result<usize> {
        if !self.registry.is_main_thread() {
            return Err(StoreError::NotMainThread);
        }

        let mut applied = 0;
        loop {
            let event = {
                let queue = self.queue_rx.lock()?;
                match queue.try_recv() {
                    Ok(event) => event,
                    Err(_) => break,
                }
            };
            // Re-enter the algorithm from the top, now on the main thread.
            self.handle_commit(&event);
            applied += 1;
        }
        Ok(applied)
    }
}

impl Drop for MergeCoordinator {
    fn drop(&mut self) {
        self.registry
            .store()
            .commit_bus()
            .unsubscribe(self.subscription);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DurabilityMode, EntityDef, Schema, StoreConfig, StoreCoordinator};
    use std::thread;

    fn setup() -> (Arc<ContextRegistry>, Arc<MergeCoordinator>) {
        let schema = Schema::new(vec![EntityDef::new("Note")]);
        let store =
            StoreCoordinator::open(StoreConfig::new(schema).durability(DurabilityMode::None))
                .unwrap();
        let registry = Arc::new(ContextRegistry::new(store));
        let coordinator = MergeCoordinator::attach(Arc::clone(&registry));
        (registry, coordinator)
    }

    #[test]
    fn test_main_context_commit_is_not_queued() {
        let (registry, coordinator) = setup();
        let main = registry.current_context();
        let record = main.insert("Note").unwrap();
        main.update(record.id(), "title", "mine").unwrap();
        main.commit().unwrap();

        assert_eq!(coordinator.process_pending().unwrap(), 0);
    }

    #[test]
    fn test_worker_commit_is_merged_on_pump() {
        let (registry, coordinator) = setup();

        let registry_clone = Arc::clone(&registry);
        let id = thread::spawn(move || {
            let context = registry_clone.current_context();
            let record = context.insert("Note").unwrap();
            context.commit().unwrap();
            record.id()
        })
        .join()
        .unwrap();

        assert_eq!(coordinator.process_pending().unwrap(), 1);
        assert!(registry.main_context().get(id).is_some());
    }

    #[test]
    fn test_process_pending_requires_main_thread() {
        let (_registry, coordinator) = setup();
        let coordinator_clone = Arc::clone(&coordinator);
        let result = thread::spawn(move || coordinator_clone.process_pending())
            .join()
            .unwrap();
        assert!(matches!(result, Err(StoreError::NotMainThread)));
    }

    #[test]
    fn test_unrelated_store_event_is_ignored() {
        let (registry, coordinator) = setup();

        let foreign = CommitEvent {
            store: crate::core::StoreId::new(),
            context: crate::core::ContextId::next(),
            inserted: Default::default(),
            updated: Default::default(),
            deleted: Default::default(),
            kinds: Default::default(),
        };
        coordinator.handle_commit(&foreign);
        assert_eq!(coordinator.process_pending().unwrap(), 0);
        let _ = registry;
    }
}
