//! Unified tool dispatch: one closed catalog, role gating up front, structured
//! failure outcomes everywhere except the unknown-tool programming error.
//!
//! Validation and permission failures come back as `{success: false, …}` so
//! the turn loop can feed them to the model as error tool results; only an
//! unknown tool name throws, because that is a caller bug, not model input.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::AgentError;
use crate::gateway::context::{AgentContext, Platform};
use crate::gateway::fs_tools;
use crate::gateway::role::{AgentPermissions, RoleManager};
use crate::gateway::traits::{BrowserDriver, GatewaySender, McpTool, OsManager, PrProvider};
use crate::memory::{DecisionRecord, MemoryApi, Outcome};

/// The authoritative tool catalog. Dynamic MCP tools are registered on top at
/// runtime and do not appear here.
pub const VALID_TOOLS: [&str; 29] = [
    // Memory
    "mama_search",
    "mama_save",
    "mama_update",
    "mama_load_checkpoint",
    // Filesystem
    "Read",
    "Write",
    "Grep",
    "Glob",
    // Execution
    "Bash",
    // Messaging
    "discord_send",
    "slack_send",
    "telegram_send",
    // Browser
    "browser_navigate",
    "browser_screenshot",
    "browser_click",
    "browser_type",
    "browser_get_text",
    "browser_scroll",
    "browser_wait_for",
    "browser_evaluate",
    "browser_pdf",
    "browser_close",
    // PR
    "pr_review_threads",
    // OS management
    "os_add_bot",
    "os_set_permissions",
    "os_get_config",
    "os_list_bots",
    "os_restart_bot",
    "os_stop_bot",
];

/// Membership in the enumerated catalog (MCP registrations excluded).
pub fn is_valid_tool(name: &str) -> bool {
    VALID_TOOLS.contains(&name)
}

/// The enumerated catalog.
pub fn get_valid_tools() -> &'static [&'static str] {
    &VALID_TOOLS
}

/// Structured result of one tool invocation. Failures carry `message`
/// (validation) or `error` (permission/backing service); successes may carry
/// `data`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ToolOutcome {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            message: None,
            error: None,
            data: Some(data),
        }
    }

    pub fn ok_message(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            error: None,
            data: None,
        }
    }

    /// Validation failure: the model gave unusable arguments.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            error: None,
            data: None,
        }
    }

    /// Permission or backing-service failure.
    pub fn denied(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: None,
            error: Some(error.into()),
            data: None,
        }
    }

    /// Serialized form fed back to the model as a tool result.
    pub fn to_model_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{\"success\":false}".to_string())
    }
}

impl From<AgentError> for ToolOutcome {
    fn from(e: AgentError) -> Self {
        ToolOutcome::denied(e.to_string())
    }
}

/// Capability-scoped tool dispatcher. External collaborators (gateways,
/// browser, PR provider, OS manager) are optional; invoking a tool whose
/// collaborator is absent yields a structured failure, never a panic.
pub struct GatewayToolExecutor {
    roles: Arc<RoleManager>,
    memory: Arc<dyn MemoryApi>,
    workspace_root: PathBuf,
    /// Per-agent restriction checked after role gating; role and agent must
    /// both allow a tool.
    agent_permissions: Option<AgentPermissions>,
    senders: HashMap<Platform, Arc<dyn GatewaySender>>,
    browser: Option<Arc<dyn BrowserDriver>>,
    pr: Option<Arc<dyn PrProvider>>,
    os: Option<Arc<dyn OsManager>>,
    mcp_tools: DashMap<String, Arc<dyn McpTool>>,
}

impl GatewayToolExecutor {
    pub fn new(
        roles: Arc<RoleManager>,
        memory: Arc<dyn MemoryApi>,
        workspace_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            roles,
            memory,
            workspace_root: workspace_root.into(),
            agent_permissions: None,
            senders: HashMap::new(),
            browser: None,
            pr: None,
            os: None,
            mcp_tools: DashMap::new(),
        }
    }

    pub fn with_agent_permissions(mut self, permissions: AgentPermissions) -> Self {
        self.agent_permissions = Some(permissions);
        self
    }

    pub fn with_sender(mut self, platform: Platform, sender: Arc<dyn GatewaySender>) -> Self {
        self.senders.insert(platform, sender);
        self
    }

    pub fn with_browser(mut self, browser: Arc<dyn BrowserDriver>) -> Self {
        self.browser = Some(browser);
        self
    }

    pub fn with_pr_provider(mut self, pr: Arc<dyn PrProvider>) -> Self {
        self.pr = Some(pr);
        self
    }

    pub fn with_os_manager(mut self, os: Arc<dyn OsManager>) -> Self {
        self.os = Some(os);
        self
    }

    /// Registers a dynamic MCP tool. Name collisions with the static catalog
    /// are rejected; the static set always wins dispatch.
    pub fn register_mcp_tool(&self, name: &str, tool: Arc<dyn McpTool>) -> Result<(), AgentError> {
        if is_valid_tool(name) {
            return Err(AgentError::Validation(format!(
                "mcp tool name collides with built-in: {name}"
            )));
        }
        self.mcp_tools.insert(name.to_string(), tool);
        Ok(())
    }

    pub fn unregister_mcp_tool(&self, name: &str) -> bool {
        self.mcp_tools.remove(name).is_some()
    }

    /// Dispatches one tool invocation under the caller's role.
    ///
    /// # Errors
    ///
    /// Only `UNKNOWN_TOOL` is returned as `Err`; every other failure is a
    /// structured `ToolOutcome`.
    pub async fn execute(
        &self,
        name: &str,
        args: Value,
        ctx: &AgentContext,
    ) -> Result<ToolOutcome, AgentError> {
        let is_mcp = self.mcp_tools.contains_key(name);
        if !is_valid_tool(name) && !is_mcp {
            return Err(AgentError::UnknownTool(name.to_string()));
        }
        if !self.roles.is_tool_allowed(&ctx.role, name) {
            return Ok(ToolOutcome::denied(format!(
                "Tool not permitted for role {}",
                ctx.role_name
            )));
        }
        if let Some(permissions) = &self.agent_permissions {
            if !permissions.allows(name) {
                return Ok(ToolOutcome::denied(format!(
                    "Tool not permitted for this agent: {name}"
                )));
            }
        }
        debug!(tool = name, source = %ctx.source, "tool dispatch");

        if is_mcp && !is_valid_tool(name) {
            let tool = self.mcp_tools.get(name).map(|entry| entry.value().clone());
            let Some(tool) = tool else {
                return Err(AgentError::UnknownTool(name.to_string()));
            };
            return Ok(match tool.call(args).await {
                Ok(data) => ToolOutcome::ok(data),
                Err(e) => e.into(),
            });
        }

        let outcome = match name {
            "mama_save" => self.mama_save(args).await,
            "mama_search" => self.mama_search(args).await,
            "mama_update" => self.mama_update(args).await,
            "mama_load_checkpoint" => self.mama_load_checkpoint().await,
            "Read" | "Write" | "Grep" | "Glob" => self.filesystem(name, args, ctx).await,
            "Bash" => self.bash(args).await,
            "discord_send" | "slack_send" | "telegram_send" => self.send_message(name, args).await,
            n if n.starts_with("browser_") => self.browser_op(n, args).await,
            "pr_review_threads" => self.pr_review_threads(args).await,
            n if n.starts_with("os_") => self.os_op(n, args, ctx).await,
            other => return Err(AgentError::UnknownTool(other.to_string())),
        };
        Ok(outcome)
    }

    // --- memory tools ---

    async fn mama_save(&self, args: Value) -> ToolOutcome {
        let kind = args.get("type").and_then(Value::as_str);
        match kind {
            Some("decision") | Some("pattern_learning") => {
                let (Some(topic), Some(decision), reasoning) = (
                    str_arg(&args, "topic"),
                    str_arg(&args, "decision"),
                    str_arg(&args, "reasoning"),
                ) else {
                    return ToolOutcome::invalid("decision requires topic, decision, reasoning");
                };
                if kind == Some("decision") && reasoning.is_none() {
                    return ToolOutcome::invalid("decision requires topic, decision, reasoning");
                }
                let record = DecisionRecord {
                    topic: topic.to_string(),
                    decision: decision.to_string(),
                    reasoning: reasoning.unwrap_or_default().to_string(),
                    confidence: args
                        .get("confidence")
                        .and_then(Value::as_f64)
                        .unwrap_or(0.8)
                        .clamp(0.0, 1.0),
                    kind: if kind == Some("decision") {
                        "user_decision".to_string()
                    } else {
                        "pattern_learning".to_string()
                    },
                };
                match self.memory.save(record).await {
                    Ok(result) => ToolOutcome::ok(json!({ "id": result.id })),
                    Err(e) => e.into(),
                }
            }
            Some("checkpoint") => {
                let Some(summary) = str_arg(&args, "summary") else {
                    return ToolOutcome::invalid("checkpoint requires summary");
                };
                let open_files = str_list(&args, "open_files");
                let next_steps = str_list(&args, "next_steps");
                let recent = str_list(&args, "recent_conversation");
                match self
                    .memory
                    .save_checkpoint(summary, &open_files, &next_steps, &recent)
                    .await
                {
                    Ok(_) => ToolOutcome::ok_message("checkpoint saved"),
                    Err(e) => e.into(),
                }
            }
            _ => ToolOutcome::invalid("Invalid save type"),
        }
    }

    async fn mama_search(&self, args: Value) -> ToolOutcome {
        let limit = args
            .get("limit")
            .and_then(Value::as_u64)
            .map(|n| n as usize);
        let kind_filter = str_arg(&args, "type").map(str::to_string);

        let items = match str_arg(&args, "query") {
            Some(query) => match self.memory.suggest(query, limit.unwrap_or(10)).await {
                Ok(response) => response.results,
                Err(e) => return e.into(),
            },
            None => match self.memory.list_decisions(limit.unwrap_or(10)).await {
                Ok(items) => items,
                Err(e) => return e.into(),
            },
        };
        let filtered: Vec<_> = match &kind_filter {
            Some(kind) => items.into_iter().filter(|i| &i.kind == kind).collect(),
            None => items,
        };
        let count = filtered.len();
        ToolOutcome::ok(json!({ "results": filtered, "count": count }))
    }

    async fn mama_update(&self, args: Value) -> ToolOutcome {
        let Some(id) = str_arg(&args, "id") else {
            return ToolOutcome::invalid("mama_update requires id and outcome");
        };
        let Some(outcome) = str_arg(&args, "outcome").and_then(Outcome::parse) else {
            return ToolOutcome::invalid("outcome must be one of success, failed, pending");
        };
        let reason = str_arg(&args, "reason").map(str::to_string);
        match self.memory.update_outcome(id, outcome, reason).await {
            Ok(()) => ToolOutcome::ok_message(format!("outcome recorded: {}", outcome.as_str())),
            Err(e) => e.into(),
        }
    }

    async fn mama_load_checkpoint(&self) -> ToolOutcome {
        match self.memory.load_checkpoint().await {
            Ok(snapshot) => ToolOutcome::ok(json!({
                "success": snapshot.success,
                "summary": snapshot.summary,
                "next_steps": snapshot.next_steps,
                "open_files": snapshot.open_files,
            })),
            Err(e) => e.into(),
        }
    }

    // --- filesystem tools ---

    fn resolve_path(&self, raw: &str) -> PathBuf {
        let path = Path::new(raw);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }

    fn check_path(&self, ctx: &AgentContext, path: &Path) -> Option<ToolOutcome> {
        let display = path.to_string_lossy();
        if !self.roles.is_path_allowed(&ctx.role, &display) {
            return Some(ToolOutcome::denied(format!(
                "Path not permitted for role {}: {display}",
                ctx.role_name
            )));
        }
        None
    }

    async fn filesystem(&self, name: &str, args: Value, ctx: &AgentContext) -> ToolOutcome {
        match name {
            "Read" => {
                let Some(raw) = str_arg(&args, "file_path").or_else(|| str_arg(&args, "path"))
                else {
                    return ToolOutcome::invalid("Read requires file_path");
                };
                let path = self.resolve_path(raw);
                if let Some(denied) = self.check_path(ctx, &path) {
                    return denied;
                }
                let offset = args.get("offset").and_then(Value::as_u64).unwrap_or(0) as usize;
                let limit = args
                    .get("limit")
                    .and_then(Value::as_u64)
                    .map(|n| n as usize);
                match fs_tools::read_file(&path, offset, limit) {
                    Ok(text) => ToolOutcome::ok(json!({ "content": text })),
                    Err(e) => ToolOutcome::invalid(e.to_string()),
                }
            }
            "Write" => {
                let (Some(raw), Some(content)) = (
                    str_arg(&args, "file_path").or_else(|| str_arg(&args, "path")),
                    str_arg(&args, "content"),
                ) else {
                    return ToolOutcome::invalid("Write requires file_path and content");
                };
                let path = self.resolve_path(raw);
                if let Some(denied) = self.check_path(ctx, &path) {
                    return denied;
                }
                match fs_tools::write_file(&path, content) {
                    Ok(summary) => ToolOutcome::ok_message(summary),
                    Err(e) => ToolOutcome::invalid(e.to_string()),
                }
            }
            "Grep" => {
                let Some(pattern) = str_arg(&args, "pattern") else {
                    return ToolOutcome::invalid("Grep requires pattern");
                };
                let root = match str_arg(&args, "path") {
                    Some(raw) => self.resolve_path(raw),
                    None => self.workspace_root.clone(),
                };
                if let Some(denied) = self.check_path(ctx, &root) {
                    return denied;
                }
                let limit = args
                    .get("limit")
                    .and_then(Value::as_u64)
                    .map(|n| n as usize);
                match fs_tools::grep_files(&root, pattern, limit) {
                    Ok(lines) => ToolOutcome::ok(json!({ "matches": lines })),
                    Err(e) => ToolOutcome::invalid(e.to_string()),
                }
            }
            "Glob" => {
                let Some(pattern) = str_arg(&args, "pattern") else {
                    return ToolOutcome::invalid("Glob requires pattern");
                };
                let root = match str_arg(&args, "path") {
                    Some(raw) => self.resolve_path(raw),
                    None => self.workspace_root.clone(),
                };
                if let Some(denied) = self.check_path(ctx, &root) {
                    return denied;
                }
                let limit = args
                    .get("limit")
                    .and_then(Value::as_u64)
                    .map(|n| n as usize);
                match fs_tools::glob_files(&root, pattern, limit) {
                    Ok(files) => ToolOutcome::ok(json!({ "files": files })),
                    Err(e) => ToolOutcome::invalid(e.to_string()),
                }
            }
            _ => unreachable!("filesystem dispatch covers Read/Write/Grep/Glob"),
        }
    }

    async fn bash(&self, args: Value) -> ToolOutcome {
        let Some(command) = str_arg(&args, "command") else {
            return ToolOutcome::invalid("Bash requires command");
        };
        let timeout = args
            .get("timeout")
            .and_then(Value::as_u64)
            .map(Duration::from_secs);
        match fs_tools::run_bash(command, timeout).await {
            Ok(output) => ToolOutcome::ok(json!({ "output": output })),
            Err(e) => ToolOutcome::denied(e.to_string()),
        }
    }

    // --- messaging tools ---

    async fn send_message(&self, name: &str, args: Value) -> ToolOutcome {
        let platform = match name {
            "discord_send" => Platform::Discord,
            "slack_send" => Platform::Slack,
            _ => Platform::Telegram,
        };
        let (Some(channel), Some(text)) = (
            str_arg(&args, "channel_id").or_else(|| str_arg(&args, "channel")),
            str_arg(&args, "message").or_else(|| str_arg(&args, "text")),
        ) else {
            return ToolOutcome::invalid(format!("{name} requires channel_id and message"));
        };
        let Some(sender) = self.senders.get(&platform) else {
            return ToolOutcome::denied(format!("No {} gateway configured", platform.as_str()));
        };
        match sender.send(channel, text).await {
            Ok(()) => ToolOutcome::ok_message("sent"),
            Err(e) => e.into(),
        }
    }

    // --- browser tools ---

    async fn browser_op(&self, name: &str, args: Value) -> ToolOutcome {
        let Some(browser) = &self.browser else {
            return ToolOutcome::denied("Browser not available");
        };
        let result: Result<Value, AgentError> = match name {
            "browser_navigate" => match str_arg(&args, "url") {
                Some(url) => browser.navigate(url).await.map(|title| json!({ "title": title })),
                None => return ToolOutcome::invalid("browser_navigate requires url"),
            },
            "browser_screenshot" => browser.screenshot().await.map(|path| json!({ "path": path })),
            "browser_click" => match str_arg(&args, "selector") {
                Some(selector) => browser.click(selector).await.map(|_| json!({ "clicked": selector })),
                None => return ToolOutcome::invalid("browser_click requires selector"),
            },
            "browser_type" => {
                let (Some(selector), Some(text)) =
                    (str_arg(&args, "selector"), str_arg(&args, "text"))
                else {
                    return ToolOutcome::invalid("browser_type requires selector and text");
                };
                browser.type_text(selector, text).await.map(|_| json!({ "typed": true }))
            }
            "browser_get_text" => match str_arg(&args, "selector") {
                Some(selector) => browser.get_text(selector).await.map(|text| json!({ "text": text })),
                None => return ToolOutcome::invalid("browser_get_text requires selector"),
            },
            "browser_scroll" => {
                let dx = args.get("dx").and_then(Value::as_i64).unwrap_or(0);
                let dy = args.get("dy").and_then(Value::as_i64).unwrap_or(0);
                browser.scroll(dx, dy).await.map(|_| json!({ "scrolled": [dx, dy] }))
            }
            "browser_wait_for" => {
                let Some(selector) = str_arg(&args, "selector") else {
                    return ToolOutcome::invalid("browser_wait_for requires selector");
                };
                let timeout_ms = args
                    .get("timeout_ms")
                    .and_then(Value::as_u64)
                    .unwrap_or(10_000);
                browser.wait_for(selector, timeout_ms).await.map(|_| json!({ "found": selector }))
            }
            "browser_evaluate" => match str_arg(&args, "script") {
                Some(script) => browser.evaluate(script).await,
                None => return ToolOutcome::invalid("browser_evaluate requires script"),
            },
            "browser_pdf" => browser.pdf().await.map(|path| json!({ "path": path })),
            "browser_close" => browser.close().await.map(|_| json!({ "closed": true })),
            other => return ToolOutcome::invalid(format!("unsupported browser op {other}")),
        };
        match result {
            Ok(data) => ToolOutcome::ok(data),
            Err(e) => e.into(),
        }
    }

    // --- PR tools ---

    async fn pr_review_threads(&self, args: Value) -> ToolOutcome {
        let Some(pr) = &self.pr else {
            return ToolOutcome::denied("No PR provider configured");
        };
        let (Some(repo), Some(number)) = (
            str_arg(&args, "repo"),
            args.get("pr_number").and_then(Value::as_u64),
        ) else {
            return ToolOutcome::invalid("pr_review_threads requires repo and pr_number");
        };
        match pr.review_threads(repo, number).await {
            Ok(data) => ToolOutcome::ok(data),
            Err(e) => e.into(),
        }
    }

    // --- OS management tools ---

    async fn os_op(&self, name: &str, args: Value, ctx: &AgentContext) -> ToolOutcome {
        let Some(os) = &self.os else {
            return ToolOutcome::denied("No OS manager configured");
        };
        let is_viewer = ctx.source == "viewer";
        let mutating = matches!(
            name,
            "os_add_bot" | "os_set_permissions" | "os_restart_bot" | "os_stop_bot"
        );
        if mutating && !is_viewer {
            return ToolOutcome::denied(
                "Permission denied: OS management requires the viewer console",
            );
        }

        match name {
            "os_add_bot" => {
                let (Some(platform), Some(bot_name), Some(token)) = (
                    str_arg(&args, "platform"),
                    str_arg(&args, "name"),
                    str_arg(&args, "token"),
                ) else {
                    return ToolOutcome::invalid("os_add_bot requires platform, name, token");
                };
                match os.add_bot(platform, bot_name, token).await {
                    Ok(id) => ToolOutcome::ok(json!({ "bot_id": id })),
                    Err(e) => e.into(),
                }
            }
            "os_set_permissions" => {
                let (Some(bot), Some(role)) = (str_arg(&args, "bot"), str_arg(&args, "role"))
                else {
                    return ToolOutcome::invalid("os_set_permissions requires bot and role");
                };
                match os.set_permissions(bot, role).await {
                    Ok(()) => ToolOutcome::ok_message("permissions updated"),
                    Err(e) => e.into(),
                }
            }
            "os_get_config" => match os.get_config().await {
                Ok(mut config) => {
                    if !is_viewer {
                        mask_sensitive(&mut config);
                    }
                    ToolOutcome::ok(config)
                }
                Err(e) => e.into(),
            },
            "os_list_bots" => match os.list_bots().await {
                Ok(mut bots) => {
                    if !is_viewer {
                        mask_sensitive(&mut bots);
                    }
                    ToolOutcome::ok(bots)
                }
                Err(e) => e.into(),
            },
            "os_restart_bot" => match str_arg(&args, "bot") {
                Some(bot) => match os.restart_bot(bot).await {
                    Ok(()) => ToolOutcome::ok_message(format!("restarted {bot}")),
                    Err(e) => e.into(),
                },
                None => ToolOutcome::invalid("os_restart_bot requires bot"),
            },
            "os_stop_bot" => match str_arg(&args, "bot") {
                Some(bot) => match os.stop_bot(bot).await {
                    Ok(()) => ToolOutcome::ok_message(format!("stopped {bot}")),
                    Err(e) => e.into(),
                },
                None => ToolOutcome::invalid("os_stop_bot requires bot"),
            },
            other => ToolOutcome::invalid(format!("unsupported os op {other}")),
        }
    }
}

/// Recursively masks token-like fields in collaborator JSON.
fn mask_sensitive(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                let lower = key.to_ascii_lowercase();
                if lower.contains("token") || lower.contains("secret") || lower.contains("api_key")
                {
                    if entry.is_string() {
                        *entry = Value::String("****".to_string());
                    }
                } else {
                    mask_sensitive(entry);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(mask_sensitive),
        _ => {}
    }
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn str_list(args: &Value, key: &str) -> Vec<String> {
    args.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
