//! Contracts for external collaborators the executor dispatches into: chat
//! gateways, the browser runtime, the PR provider, OS management, and
//! runtime-registered MCP tools.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::AgentError;

/// Outbound message delivery for one platform (discord/slack/telegram).
#[async_trait]
pub trait GatewaySender: Send + Sync {
    async fn send(&self, channel_id: &str, text: &str) -> Result<(), AgentError>;
}

/// Headless browser runtime. Outputs are textual (paths, extracted text,
/// JSON-encoded evaluation results).
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<String, AgentError>;
    async fn screenshot(&self) -> Result<String, AgentError>;
    async fn click(&self, selector: &str) -> Result<(), AgentError>;
    async fn type_text(&self, selector: &str, text: &str) -> Result<(), AgentError>;
    async fn get_text(&self, selector: &str) -> Result<String, AgentError>;
    async fn scroll(&self, dx: i64, dy: i64) -> Result<(), AgentError>;
    async fn wait_for(&self, selector: &str, timeout_ms: u64) -> Result<(), AgentError>;
    async fn evaluate(&self, script: &str) -> Result<Value, AgentError>;
    async fn pdf(&self) -> Result<String, AgentError>;
    async fn close(&self) -> Result<(), AgentError>;
}

/// Pull-request review access.
#[async_trait]
pub trait PrProvider: Send + Sync {
    /// Unresolved review threads for a PR, as provider-shaped JSON.
    async fn review_threads(&self, repo: &str, number: u64) -> Result<Value, AgentError>;
}

/// Bot lifecycle and orchestrator configuration management.
#[async_trait]
pub trait OsManager: Send + Sync {
    async fn add_bot(&self, platform: &str, name: &str, token: &str) -> Result<String, AgentError>;
    async fn set_permissions(&self, bot: &str, role: &str) -> Result<(), AgentError>;
    async fn get_config(&self) -> Result<Value, AgentError>;
    async fn list_bots(&self) -> Result<Value, AgentError>;
    async fn restart_bot(&self, bot: &str) -> Result<(), AgentError>;
    async fn stop_bot(&self, bot: &str) -> Result<(), AgentError>;
}

/// A tool registered at runtime (MCP). The executor owns naming and role
/// gating; the tool only sees its arguments.
#[async_trait]
pub trait McpTool: Send + Sync {
    async fn call(&self, args: Value) -> Result<Value, AgentError>;
}
