pub mod error;
pub mod record;
pub mod types;
pub mod value;

pub use error::{Result, StoreError};
pub use record::Record;
pub use types::{ContextId, EntityKind, RecordId, StoreId};
pub use value::{DataType, Value};
