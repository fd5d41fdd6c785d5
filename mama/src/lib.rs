//! # MAMA core
//!
//! Long-running orchestrator for an autonomous agent: chat gateways in, a
//! cron scheduler and heartbeat around, headless LLM subprocesses underneath.
//!
//! ## Design principles
//!
//! - **One lane per conversation**: all work for a channel key is serialized
//!   through [`LaneManager`]; distinct conversations run fully in parallel.
//! - **Backends behind one trait**: [`AgentBackend`] is the whole capability
//!   set (`set_system_prompt`, `set_session_id`, `prompt`, `reset_session`);
//!   [`Backend`] is the closed sum of the two subprocess families.
//! - **Structured tool failures**: the executor returns
//!   `{success: false, …}` records for everything the model can cause;
//!   only an unknown tool name is a typed error.
//! - **Constructor injection**: no process-wide singletons; every collaborator
//!   is bound once at startup and passed down.
//!
//! ## Main modules
//!
//! - [`agent`]: [`AgentLoop`] turn orchestration, tool-use loop, token
//!   accounting, streaming.
//! - [`backend`]: [`ClaudeCliWrapper`], [`CodexAppServerProcess`],
//!   [`MockBackend`], content blocks and usage types.
//! - [`session`]: [`SessionPool`], [`LaneManager`], [`ChannelKey`].
//! - [`gateway`]: [`GatewayToolExecutor`], [`RoleManager`], agent context and
//!   the context prompt builder, collaborator traits.
//! - [`prompt`]: [`PromptEnhancer`], frontmatter matching,
//!   [`ContentDeduplicator`].
//! - [`hooks`]: [`PreCompactHandler`], [`PostToolHandler`], contract
//!   extraction.
//! - [`memory`]: [`MemoryApi`] contract, [`MockMemoryApi`], [`MemoryLogger`].
//! - [`stream`]: [`StreamingCallbackManager`] and the messenger contract.
//! - [`heartbeat`], [`keepalive`]: periodic self-poll and token refresh.
//! - [`sanitize`]: idempotent secret/id masking for logs and error notices.

pub mod agent;
pub mod backend;
pub mod error;
pub mod gateway;
pub mod heartbeat;
pub mod hooks;
pub mod keepalive;
pub mod memory;
pub mod prompt;
pub mod sanitize;
pub mod session;
pub mod stream;

pub use agent::{AgentLoop, AgentLoopConfig, TurnOutcome};
pub use backend::{
    build_claude_args, AgentBackend, Backend, BackendFactory, BackendPool, BackendResponse,
    ClaudeCliOptions, ClaudeCliWrapper, CodexAppServerProcess, CodexOptions, ContentBlock,
    MockBackend, PromptInput, StopReason, ToolUse, Usage,
};
pub use error::AgentError;
pub use gateway::{
    build_context_prompt, build_minimal_context, context_for_source, create_agent_context,
    get_valid_tools, is_valid_tool, AgentContext, AgentPermissions, BrowserDriver, GatewaySender,
    GatewayToolExecutor, McpTool, OsManager, Platform, PrProvider, RoleConfig, RoleManager,
    SessionMeta, ToolOutcome, VALID_TOOLS,
};
pub use heartbeat::{
    in_quiet_hours, HeartbeatOptions, HeartbeatOutcome, HeartbeatRunner, HeartbeatScheduler,
    HEARTBEAT_PROMPT,
};
pub use hooks::{
    extract_contracts, is_edit_tool, is_low_priority_path, Contract, ContractKind, PostToolConfig,
    PostToolHandler, PreCompactConfig, PreCompactHandler, PreCompactReport,
};
pub use keepalive::{KeepAliveErrorFn, RefreshFn, TokenKeepAlive};
pub use memory::{
    CheckpointSnapshot, DecisionRecord, MemoryApi, MemoryItem, MemoryLogger, MockMemoryApi,
    Outcome, SaveResult, SuggestResponse,
};
pub use prompt::{
    matches_context, parse_frontmatter, AddOutcome, AppliesTo, ContentDeduplicator, ContentEntry,
    Enhancement, PromptEnhancer, RuleContext,
};
pub use sanitize::sanitize_string;
pub use session::{
    ChannelKey, LaneManager, SessionHandle, SessionPool, SessionPoolConfig, TaskHandle,
    TokenUsageReport,
};
pub use stream::{GatewayMessenger, StreamingCallbackManager};
