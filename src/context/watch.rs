//! Per-field change handlers on a context's working copies.
//!
//! A handler fires when a buffered update actually changes the watched
//! field, receiving the old and new values. Re-registering a watched field
//! replaces the previous handler; all handlers for a record are dropped
//! when the record is evicted from the context (deleted locally or removed
//! by a merge).

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::{RecordId, Value};

pub type FieldWatchHandler = Arc<dyn Fn(Option<&Value>, Option<&Value>) + Send + Sync>;

#[derive(Default)]
pub(crate) struct WatchTable {
    handlers: HashMap<(RecordId, String), FieldWatchHandler>,
}

impl WatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler, replacing any previous handler for the same
    /// record and field.
    pub fn insert(&mut self, id: RecordId, field: impl Into<String>, handler: FieldWatchHandler) {
        self.handlers.insert((id, field.into()), handler);
    }

    pub fn remove(&mut self, id: RecordId, field: &str) -> bool {
        self.handlers.remove(&(id, field.to_string())).is_some()
    }

    /// Drops every handler attached to a record.
    pub fn evict(&mut self, id: RecordId) {
        self.handlers.retain(|(record, _), _| *record != id);
    }

    pub fn handler_for(&self, id: RecordId, field: &str) -> Option<FieldWatchHandler> {
        self.handlers.get(&(id, field.to_string())).map(Arc::clone)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(counter: &Arc<AtomicUsize>) -> FieldWatchHandler {
        let counter = Arc::clone(counter);
        Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_reregistration_replaces_handler() {
        let mut table = WatchTable::new();
        let id = RecordId::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        table.insert(id, "title", counting_handler(&first));
        table.insert(id, "title", counting_handler(&second));
        assert_eq!(table.len(), 1);

        table.handler_for(id, "title").unwrap()(None, None);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_evict_drops_all_record_handlers() {
        let mut table = WatchTable::new();
        let id = RecordId::new();
        let other = RecordId::new();
        let counter = Arc::new(AtomicUsize::new(0));

        table.insert(id, "title", counting_handler(&counter));
        table.insert(id, "body", counting_handler(&counter));
        table.insert(other, "title", counting_handler(&counter));

        table.evict(id);
        assert!(table.handler_for(id, "title").is_none());
        assert!(table.handler_for(id, "body").is_none());
        assert!(table.handler_for(other, "title").is_some());
    }

    #[test]
    fn test_remove_single_field() {
        let mut table = WatchTable::new();
        let id = RecordId::new();
        let counter = Arc::new(AtomicUsize::new(0));

        table.insert(id, "title", counting_handler(&counter));
        assert!(table.remove(id, "title"));
        assert!(!table.remove(id, "title"));
    }
}
