pub mod engine;
pub mod persistence;
pub mod schema;

pub use engine::{StoreCoordinator, UnitOfWork};
pub use persistence::{SnapshotStore, StoreSnapshot};
pub use schema::{DurabilityMode, EntityDef, FieldDef, Schema, StoreConfig};
