// ============================================================================
// Change Observer
// ============================================================================
//
// Converts bulk "objects changed" events into deltas meaningful to one
// registered observation scope, invoking the callback only when the delta
// is non-empty. One scope + callback pair per observer instance; a new
// registration silently replaces the old one. Dropping the observer
// unsubscribes from the change bus before its state is released.
//
// ============================================================================

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};

use crate::context::Context;
use crate::core::{EntityKind, RecordId};
use crate::events::{ObjectsChangedEvent, SubscriptionId};

/// An externally-owned, mutable set of record identities observable with
/// [`ChangeObserver::observe_set`]. Read at event time without holding the
/// lock across the callback; concurrent mutation yields eventual, not
/// linearizable, deltas.
pub type SharedRecordSet = Arc<RwLock<HashSet<RecordId>>>;

enum Scope {
    /// Fixed membership captured at registration. Callback: (updated, deleted).
    Objects {
        members: HashSet<RecordId>,
        on_change: Arc<dyn Fn(&HashSet<RecordId>, &HashSet<RecordId>) + Send + Sync>,
    },
    /// Live membership re-read per event, diffed against the previous
    /// snapshot. Callback: (inserted, removed, updated).
    Set {
        set: SharedRecordSet,
        previous: HashSet<RecordId>,
        on_change:
            Arc<dyn Fn(&HashSet<RecordId>, &HashSet<RecordId>, &HashSet<RecordId>) + Send + Sync>,
    },
    /// Entity kind resolved once at registration. Callback: (inserted, deleted).
    Kind {
        kind: EntityKind,
        on_change: Arc<dyn Fn(&HashSet<RecordId>, &HashSet<RecordId>) + Send + Sync>,
    },
}

/// Observes scope-relative changes on one context's change bus.
pub struct ChangeObserver {
    context: Arc<Context>,
    scope: Arc<Mutex<Option<Scope>>>,
    subscription: Option<SubscriptionId>,
}

impl ChangeObserver {
    pub fn new(context: Arc<Context>) -> Self {
        Self {
            context,
            scope: Arc::new(Mutex::new(None)),
            subscription: None,
        }
    }

    /// Observes a fixed set of records. The callback receives the updated
    /// and deleted members; insertions are irrelevant to a fixed scope.
    pub fn observe_objects(
        &mut self,
        ids: impl IntoIterator<Item = RecordId>,
        on_change: impl Fn(&HashSet<RecordId>, &HashSet<RecordId>) + Send + Sync + 'static,
    ) {
        self.register(Scope::Objects {
            members: ids.into_iter().collect(),
            on_change: Arc::new(on_change),
        });
    }

    /// Observes a single record.
    pub fn observe_object(
        &mut self,
        id: RecordId,
        on_change: impl Fn(&HashSet<RecordId>, &HashSet<RecordId>) + Send + Sync + 'static,
    ) {
        self.observe_objects([id], on_change);
    }

    /// Observes an externally-owned mutable set. The callback receives the
    /// members inserted into and removed from the set since the previous
    /// event, plus the current members that were updated.
    pub fn observe_set(
        &mut self,
        set: SharedRecordSet,
        on_change: impl Fn(&HashSet<RecordId>, &HashSet<RecordId>, &HashSet<RecordId>)
            + Send
            + Sync
            + 'static,
    ) {
        let previous = set.read().unwrap_or_else(|e| e.into_inner()).clone();
        self.register(Scope::Set {
            set,
            previous,
            on_change: Arc::new(on_change),
        });
    }

    /// Observes every record of one entity kind. The callback receives the
    /// inserted and deleted records of that kind; updates are not reported
    /// for this scope.
    pub fn observe_kind(
        &mut self,
        kind: impl Into<EntityKind>,
        on_change: impl Fn(&HashSet<RecordId>, &HashSet<RecordId>) + Send + Sync + 'static,
    ) {
        self.register(Scope::Kind {
            kind: kind.into(),
            on_change: Arc::new(on_change),
        });
    }

    /// Unregisters the active scope, if any. No callback fires afterwards.
    pub fn stop_observing(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            self.context.change_bus().unsubscribe(subscription);
        }
        let mut scope = self.scope.lock().unwrap_or_else(|e| e.into_inner());
        *scope = None;
    }

    pub fn is_observing(&self) -> bool {
        self.subscription.is_some()
    }

    fn register(&mut self, new_scope: Scope) {
        // A new registration discards the old scope and its snapshot
        // entirely; no membership drift carries over.
        self.stop_observing();

        {
            let mut scope = self.scope.lock().unwrap_or_else(|e| e.into_inner());
            *scope = Some(new_scope);
        }

        let shared = Arc::clone(&self.scope);
        self.subscription = Some(
            self.context
                .change_bus()
                .subscribe(move |event: &ObjectsChangedEvent| {
                    Self::handle_event(&shared, event);
                }),
        );
    }

    fn handle_event(shared: &Arc<Mutex<Option<Scope>>>, event: &ObjectsChangedEvent) {
        let mut guard = shared.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_mut() {
            None => {}
            Some(Scope::Objects { members, on_change }) => {
                let updated: HashSet<RecordId> =
                    members.intersection(&event.updated).copied().collect();
                let deleted: HashSet<RecordId> =
                    members.intersection(&event.deleted).copied().collect();
                if updated.is_empty() && deleted.is_empty() {
                    return;
                }
                let on_change = Arc::clone(on_change);
                drop(guard);
                on_change(&updated, &deleted);
            }
            Some(Scope::Set {
                set,
                previous,
                on_change,
            }) => {
                let current = set.read().unwrap_or_else(|e| e.into_inner()).clone();
                let inserted: HashSet<RecordId> =
                    current.difference(previous).copied().collect();
                let removed: HashSet<RecordId> =
                    previous.difference(&current).copied().collect();
                let updated: HashSet<RecordId> =
                    current.intersection(&event.updated).copied().collect();

                // Drift is always measured against the immediately
                // preceding observed state, whether or not we fire.
                *previous = current;

                if inserted.is_empty() && removed.is_empty() && updated.is_empty() {
                    return;
                }
                let on_change = Arc::clone(on_change);
                drop(guard);
                on_change(&inserted, &removed, &updated);
            }
            Some(Scope::Kind { kind, on_change }) => {
                let inserted: HashSet<RecordId> = event
                    .inserted
                    .iter()
                    .filter(|id| event.kinds.get(id) == Some(kind))
                    .copied()
                    .collect();
                let deleted: HashSet<RecordId> = event
                    .deleted
                    .iter()
                    .filter(|id| event.kinds.get(id) == Some(kind))
                    .copied()
                    .collect();
                if inserted.is_empty() && deleted.is_empty() {
                    return;
                }
                let on_change = Arc::clone(on_change);
                drop(guard);
                on_change(&inserted, &deleted);
            }
        }
    }
}

impl Drop for ChangeObserver {
    fn drop(&mut self) {
        // Unsubscribe before state goes away so no callback ever fires
        // against a half-destroyed instance.
        self.stop_observing();
    }
}
