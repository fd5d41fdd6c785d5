//! Config file schema: the core-relevant subset of `~/.mama/config.yaml`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MamaConfig {
    pub agent: AgentSettings,
    pub multi_agent: MultiAgentSettings,
    pub roles: RolesConfig,
    pub cron: Vec<CronEntry>,
}

/// Default agent parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub model: String,
    pub max_turns: usize,
    /// Per-request timeout in seconds.
    pub timeout: u64,
    /// Session token total at which the loop starts pre-compaction checks.
    pub token_threshold: u64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-5".to_string(),
            max_turns: 24,
            timeout: 300,
            token_threshold: 150_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiAgentSettings {
    pub agents: BTreeMap<String, AgentEntry>,
}

/// Which subprocess family backs an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Claude,
    Codex,
}

/// One named agent in a multi-agent setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentEntry {
    pub backend: BackendKind,
    pub model: Option<String>,
    /// Coarse capability level 1..=3; tier 3 disables Code-Act.
    pub tier: u8,
    pub use_code_act: bool,
    pub persona_file: Option<PathBuf>,
    pub tool_permissions: ToolPermissions,
}

impl Default for AgentEntry {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            model: None,
            tier: 1,
            use_code_act: false,
            persona_file: None,
            tool_permissions: ToolPermissions::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPermissions {
    pub allowed: Vec<String>,
    pub blocked: Vec<String>,
}

/// Role table plus the source→role mapping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RolesConfig {
    pub definitions: BTreeMap<String, RoleDefinition>,
    pub source_mapping: BTreeMap<String, String>,
}

/// Allow/deny matrix for one role. Blocked patterns override allowed ones;
/// empty `allowed_paths` means no path restriction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleDefinition {
    pub allowed_tools: Vec<String>,
    pub blocked_tools: Vec<String>,
    pub allowed_paths: Vec<String>,
    pub system_control: bool,
    pub sensitive_access: bool,
}

/// One durable cron entry seeded from config at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronEntry {
    pub id: String,
    pub name: String,
    pub cron: String,
    pub prompt: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cron_entry_enabled_defaults_true() {
        let entry: CronEntry =
            serde_yaml::from_str("id: a\nname: a\ncron: '* * * * *'\nprompt: p\n").unwrap();
        assert!(entry.enabled);
    }

    #[test]
    fn backend_kind_is_lowercase_on_disk() {
        let entry: AgentEntry = serde_yaml::from_str("backend: codex\n").unwrap();
        assert_eq!(entry.backend, BackendKind::Codex);
        assert_eq!(serde_yaml::to_string(&BackendKind::Claude).unwrap().trim(), "claude");
    }
}
