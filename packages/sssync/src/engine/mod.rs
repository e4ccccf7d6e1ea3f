pub mod apply;
pub mod sync;
pub mod tables;
pub mod types;

// Public re-exports for the common entry points
pub use sync::{SyncBuilder, SyncEngine};
pub use tables::{DefaultTableStore, TableStore};
pub use types::{EventEnvelope, MaterializerAction, RawEvent, SyncResponse};
