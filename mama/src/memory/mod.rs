//! Memory: the external memory API contract plus the append-only daily logger.
//!
//! The embedding index and vector search live outside the core; [`MemoryApi`]
//! is the contract the executor and hooks consume. [`MockMemoryApi`] is the
//! in-process double used by tests and local development.

mod api;
mod logger;
mod mock;

pub use api::{
    CheckpointSnapshot, DecisionRecord, MemoryApi, MemoryItem, Outcome, SaveResult, SuggestResponse,
};
pub use logger::MemoryLogger;
pub use mock::MockMemoryApi;
