//! Pre/post-tool handlers: decision detection before context compaction,
//! contract extraction after file edits.

mod contracts;
mod posttool;
mod precompact;

pub use contracts::{extract_contracts, Contract, ContractKind};
pub use posttool::{
    is_edit_tool, is_low_priority_path, PostToolConfig, PostToolHandler,
};
pub use precompact::{PreCompactConfig, PreCompactHandler, PreCompactReport};
