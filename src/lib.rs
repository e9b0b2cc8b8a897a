// ============================================================================
// datastack — multi-context data synchronization over a shared store
// ============================================================================

//! A thread-affine data stack: one durable store, one main context owned by
//! the thread that builds the stack, and a private working context for every
//! other thread that asks for one. Commits made anywhere are folded back
//! into the main context in commit order, and change observers turn bulk
//! change events into scope-relative deltas.
//!
//! # Example
//!
//! ```
//! use datastack::{DataStack, DataType, DurabilityMode, EntityDef, FieldDef, Schema};
//!
//! # fn main() -> datastack::Result<()> {
//! let schema = Schema::new(vec![EntityDef::new("Note")
//!     .field(FieldDef::new("title", DataType::Text).required())]);
//!
//! let stack = DataStack::builder()
//!     .schema(schema)
//!     .durability(DurabilityMode::None)
//!     .build()?;
//!
//! let context = stack.current_context();
//! let note = context.insert("Note")?;
//! context.update(note.id(), "title", "hello")?;
//! stack.save_current_context()?;
//!
//! // Worker threads get their own context; their commits reach the main
//! // context when the main thread pumps pending merges.
//! stack.process_pending_merges()?;
//! assert_eq!(context.all("Note")?.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod coordinator;
pub mod core;
pub mod events;
pub mod observer;
pub mod registry;
pub mod stack;
pub mod store;

pub use context::watch::FieldWatchHandler;
pub use context::Context;
pub use coordinator::MergeCoordinator;
pub use self::core::{
    ContextId, DataType, EntityKind, Record, RecordId, Result, StoreError, StoreId, Value,
};
pub use events::{CommitEvent, EventBus, ObjectsChangedEvent, SubscriptionId};
pub use observer::{ChangeObserver, SharedRecordSet};
pub use registry::ContextRegistry;
pub use stack::{DataStack, DataStackBuilder, StackDelegate};
pub use store::{
    DurabilityMode, EntityDef, FieldDef, Schema, StoreConfig, StoreCoordinator, UnitOfWork,
};
