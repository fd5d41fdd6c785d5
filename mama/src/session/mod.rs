//! Session and lane concurrency: per-conversation session reuse with token
//! accounting, and per-key FIFO lanes that serialize work within a
//! conversation while allowing parallelism across conversations.

mod lane;
mod pool;

pub use lane::{LaneManager, TaskHandle};
pub use pool::{ChannelKey, SessionHandle, SessionPool, SessionPoolConfig, TokenUsageReport};
