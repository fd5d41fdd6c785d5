//! Gateway layer: role gating, per-invocation context, and the unified tool
//! executor with its collaborator contracts.

mod context;
mod executor;
mod fs_tools;
mod role;
mod traits;

pub use context::{
    build_context_prompt, build_minimal_context, context_for_source, create_agent_context,
    AgentContext, Platform, SessionMeta,
};
pub use executor::{
    get_valid_tools, is_valid_tool, GatewayToolExecutor, ToolOutcome, VALID_TOOLS,
};
pub use role::{AgentPermissions, RoleConfig, RoleManager};
pub use traits::{BrowserDriver, GatewaySender, McpTool, OsManager, PrProvider};
