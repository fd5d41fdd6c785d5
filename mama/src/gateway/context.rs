//! Per-invocation identity: the agent context record and the context prompt
//! preamble built from it.

use chrono::{DateTime, Utc};

use crate::gateway::role::{RoleConfig, RoleManager};

/// Normalized platform tag. Unknown sources fold to `Cli`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Viewer,
    Discord,
    Telegram,
    Slack,
    Chatwork,
    Cli,
}

impl Platform {
    pub fn from_source(source: &str) -> Self {
        match source.to_ascii_lowercase().as_str() {
            "viewer" => Platform::Viewer,
            "discord" => Platform::Discord,
            "telegram" => Platform::Telegram,
            "slack" => Platform::Slack,
            "chatwork" => Platform::Chatwork,
            _ => Platform::Cli,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Viewer => "viewer",
            Platform::Discord => "discord",
            Platform::Telegram => "telegram",
            Platform::Slack => "slack",
            Platform::Chatwork => "chatwork",
            Platform::Cli => "cli",
        }
    }

    fn guidelines(&self) -> &'static str {
        match self {
            Platform::Discord => {
                "Messages are capped at 2000 characters; split longer replies. \
                 Use Discord markdown (``` for code, ** for bold). Mention users \
                 only when necessary."
            }
            Platform::Telegram => {
                "Use HTML formatting: <b>bold</b>, <i>italic</i>, <code>code</code>. \
                 Messages are capped at 4096 characters. No markdown headings."
            }
            Platform::Slack => {
                "Use Slack mrkdwn: *bold*, _italic_, ``` for code blocks. Keep \
                 replies thread-friendly and under 4000 characters."
            }
            Platform::Chatwork => {
                "Use Chatwork tags: [info][/info] for blocks, [code][/code] for code. \
                 Keep messages compact."
            }
            Platform::Viewer => {
                "Full-width web console; markdown renders completely. Long output is \
                 acceptable."
            }
            Platform::Cli => {
                "Plain terminal output; avoid heavy markdown and keep lines under \
                 100 columns where possible."
            }
        }
    }
}

/// Session identity attached to a context.
#[derive(Debug, Clone, Default)]
pub struct SessionMeta {
    pub session_id: String,
    pub channel: Option<String>,
    pub user: Option<String>,
    pub user_name: Option<String>,
}

/// Per-invocation identity handed to the executor and the prompt builder.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub source: String,
    pub platform: Platform,
    pub role_name: String,
    pub role: RoleConfig,
    pub session: SessionMeta,
    pub capabilities: Vec<String>,
    pub limitations: Vec<String>,
    pub started_at: DateTime<Utc>,
}

/// Normalizes the source and stamps `started_at`.
pub fn create_agent_context(
    source: &str,
    role_name: &str,
    role: RoleConfig,
    session: SessionMeta,
    capabilities: Vec<String>,
    limitations: Vec<String>,
) -> AgentContext {
    AgentContext {
        source: source.to_string(),
        platform: Platform::from_source(source),
        role_name: role_name.to_string(),
        role,
        session,
        capabilities,
        limitations,
        started_at: Utc::now(),
    }
}

/// Convenience constructor that resolves the role and derives capability
/// summaries through the [`RoleManager`].
pub fn context_for_source(
    manager: &RoleManager,
    source: &str,
    session: SessionMeta,
) -> AgentContext {
    let (role_name, role) = manager.resolve(source);
    let capabilities = manager.capabilities(&role);
    let limitations = manager.limitations(&role);
    create_agent_context(source, &role_name, role, session, capabilities, limitations)
}

fn truncated_session(session_id: &str) -> String {
    if session_id.len() <= 8 {
        format!("{session_id}...")
    } else {
        format!("{}...", &session_id[..8])
    }
}

/// Assembles the identity/capability/limitation preamble, section order fixed.
pub fn build_context_prompt(ctx: &AgentContext) -> String {
    let mut out = String::from("## Current Agent Context\n\n");

    out.push_str("### Identity\n");
    out.push_str(&format!("- Platform: {}\n", ctx.platform.as_str()));
    out.push_str(&format!(
        "- Role: {} ({})\n",
        ctx.role_name,
        ctx.capabilities
            .first()
            .map(String::as_str)
            .unwrap_or("no capabilities")
    ));
    out.push_str(&format!("- Session: {}\n", truncated_session(&ctx.session.session_id)));
    if let Some(user) = ctx.session.user_name.as_deref().or(ctx.session.user.as_deref()) {
        out.push_str(&format!("- User: {user}\n"));
    }
    if let Some(channel) = &ctx.session.channel {
        out.push_str(&format!("- Channel: {channel}\n"));
    }

    out.push_str("\n### Capabilities\n");
    for cap in &ctx.capabilities {
        out.push_str(&format!("- {cap}\n"));
    }

    out.push_str("\n### Limitations\n");
    for limit in &ctx.limitations {
        out.push_str(&format!("- {limit}\n"));
    }

    out.push_str("\n### Platform Guidelines\n");
    out.push_str(ctx.platform.guidelines());
    out.push('\n');

    out.push_str("\n### Permission Reminders\n");
    if ctx.role.system_control {
        out.push_str("- You may manage bots and system configuration on request.\n");
    } else {
        out.push_str("- You must NOT attempt OS management operations; they will be denied.\n");
    }
    if ctx.role.sensitive_access {
        out.push_str("- Sensitive fields are visible to you; never echo tokens back to chat.\n");
    } else {
        out.push_str("- Sensitive fields are masked for this role.\n");
    }
    out
}

/// One-line context for log lines and compact displays:
/// `<platform>/<role> · cap0, cap1, cap2[, +N more]`.
pub fn build_minimal_context(ctx: &AgentContext) -> String {
    let shown: Vec<&str> = ctx.capabilities.iter().take(3).map(String::as_str).collect();
    let mut caps = shown.join(", ");
    if ctx.capabilities.len() > 3 {
        caps.push_str(&format!(", +{} more", ctx.capabilities.len() - 3));
    }
    format!("{}/{} · {}", ctx.platform.as_str(), ctx.role_name, caps)
}
