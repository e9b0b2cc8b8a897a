// ============================================================================
// Commit & Change Events
// ============================================================================
//
// Publish/subscribe plumbing scoped to a single store instance. Each
// StoreCoordinator owns a commit bus, each Context owns a change bus; there
// is no process-wide channel carrying unrelated events.
//
// ============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::core::{ContextId, EntityKind, RecordId, StoreId};

/// Emitted by the store after a unit of work commits successfully.
///
/// The three identity sets are disjoint. `kinds` carries the entity kind of
/// every inserted and deleted identity, captured at commit time — the store
/// can no longer answer for deleted identities afterwards.
#[derive(Debug, Clone)]
pub struct CommitEvent {
    pub store: StoreId,
    pub context: ContextId,
    pub inserted: HashSet<RecordId>,
    pub updated: HashSet<RecordId>,
    pub deleted: HashSet<RecordId>,
    pub kinds: HashMap<RecordId, EntityKind>,
}

impl CommitEvent {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

/// Emitted on a context's change bus after its own successful commit and
/// after each merge applied to it. This is what change observers consume.
#[derive(Debug, Clone, Default)]
pub struct ObjectsChangedEvent {
    pub inserted: HashSet<RecordId>,
    pub updated: HashSet<RecordId>,
    pub deleted: HashSet<RecordId>,
    pub kinds: HashMap<RecordId, EntityKind>,
}

impl ObjectsChangedEvent {
    pub fn from_commit(event: &CommitEvent) -> Self {
        Self {
            inserted: event.inserted.clone(),
            updated: event.updated.clone(),
            deleted: event.deleted.clone(),
            kinds: event.kinds.clone(),
        }
    }

    /// An event carrying only manually reported updates, for mutations the
    /// store never sees.
    pub fn updated_only(ids: impl IntoIterator<Item = RecordId>) -> Self {
        Self {
            updated: ids.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

pub type SubscriptionId = u64;

/// In-process broadcast bus.
///
/// Subscribers are invoked synchronously on the publishing thread. Callbacks
/// are cloned out before invocation, so a callback may subscribe or
/// unsubscribe without deadlocking the bus.
pub struct EventBus<E> {
    subscribers: Mutex<Vec<(SubscriptionId, Arc<dyn Fn(&E) + Send + Sync>)>>,
    next_id: AtomicU64,
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|(sub_id, _)| *sub_id != id);
    }

    pub fn publish(&self, event: &E) {
        let callbacks: Vec<Arc<dyn Fn(&E) + Send + Sync>> = {
            let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            subscribers.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        for callback in callbacks {
            callback(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_publish_reaches_all_subscribers() {
        let bus: EventBus<u32> = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_a = Arc::clone(&hits);
        bus.subscribe(move |n| {
            hits_a.fetch_add(*n as usize, Ordering::SeqCst);
        });
        let hits_b = Arc::clone(&hits);
        bus.subscribe(move |n| {
            hits_b.fetch_add(*n as usize, Ordering::SeqCst);
        });

        bus.publish(&3);
        assert_eq!(hits.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus: EventBus<u32> = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_clone = Arc::clone(&hits);
        let id = bus.subscribe(move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&1);
        bus.unsubscribe(id);
        bus.publish(&1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_commit_event_emptiness() {
        let event = CommitEvent {
            store: StoreId::new(),
            context: ContextId::next(),
            inserted: HashSet::new(),
            updated: HashSet::new(),
            deleted: HashSet::new(),
            kinds: HashMap::new(),
        };
        assert!(event.is_empty());
        assert!(ObjectsChangedEvent::from_commit(&event).is_empty());
    }

    #[test]
    fn test_updated_only_event() {
        let id = RecordId::new();
        let event = ObjectsChangedEvent::updated_only([id]);
        assert!(event.updated.contains(&id));
        assert!(event.inserted.is_empty() && event.deleted.is_empty());
    }
}
