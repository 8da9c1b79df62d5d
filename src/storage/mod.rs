//! Event persistence
//!
//! - [`repository`] - `EventRepository` trait and the SQLite implementation
//! - [`memory`] - in-process implementation with identical semantics
//! - [`dedup`] - pure batch deduplication by `event_id`

pub mod dedup;
mod error;
pub mod memory;
pub mod repository;

pub use dedup::{filter_new, DedupOutcome, Deduplicator};
pub use error::{StoreError, StoreResult};
pub use memory::MemoryEventRepository;
pub use repository::{
    create_memory_repository, create_sqlite_repository, EarliestPostTime, EventRepository,
    InsertOutcome, SharedEventRepository, SqliteEventRepository,
};
