//! Turn orchestration: session acquisition, prompt assembly, the tool-use
//! loop, token accounting, streaming relay, and hook invocation.

mod run_loop;

pub use run_loop::{AgentLoop, AgentLoopConfig, TurnOutcome};
