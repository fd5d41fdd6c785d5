//! Role-based capability gating: tool globs, path globs, and the source→role
//! mapping.
//!
//! Blocked patterns always override allowed ones. An empty `allowed_paths`
//! list means no path restriction at all.

use std::collections::HashMap;

use glob::Pattern;

/// Allow/deny matrix for one role.
#[derive(Debug, Clone, Default)]
pub struct RoleConfig {
    /// Tool name globs; `*` grants everything.
    pub allowed_tools: Vec<String>,
    /// Tool name globs that override allows.
    pub blocked_tools: Vec<String>,
    /// Path globs with `~` expansion; empty means unrestricted.
    pub allowed_paths: Vec<String>,
    pub system_control: bool,
    pub sensitive_access: bool,
}

/// Per-agent tool restriction from `multi_agent.agents.<name>.tool_permissions`.
/// Applied after role gating: role and agent must both allow a tool. A role
/// denial cannot be re-opened by an agent entry.
#[derive(Debug, Clone, Default)]
pub struct AgentPermissions {
    /// Tool name globs; empty means no per-agent restriction.
    pub allowed: Vec<String>,
    /// Tool name globs that override allows.
    pub blocked: Vec<String>,
}

impl AgentPermissions {
    pub fn allows(&self, tool: &str) -> bool {
        if self.blocked.iter().any(|p| glob_matches(p, tool)) {
            return false;
        }
        if self.allowed.is_empty() || self.allowed.iter().any(|p| p == "*") {
            return true;
        }
        self.allowed.iter().any(|p| glob_matches(p, tool))
    }
}

/// Role table plus source→role resolution. Constructor-injected; bind one at
/// process start.
pub struct RoleManager {
    roles: HashMap<String, RoleConfig>,
    source_mapping: HashMap<String, String>,
    default_role: String,
}

fn glob_matches(pattern: &str, value: &str) -> bool {
    Pattern::new(pattern).map(|p| p.matches(value)).unwrap_or(false)
}

fn expand_tilde(pattern: &str) -> String {
    if let Some(rest) = pattern.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return format!("{}/{}", home.to_string_lossy().trim_end_matches('/'), rest);
        }
    }
    pattern.to_string()
}

impl RoleManager {
    pub fn new(
        roles: HashMap<String, RoleConfig>,
        source_mapping: HashMap<String, String>,
        default_role: impl Into<String>,
    ) -> Self {
        Self {
            roles,
            source_mapping,
            default_role: default_role.into(),
        }
    }

    /// A permissive manager with one `default` role allowing everything.
    /// Useful for tests and single-user setups.
    pub fn permissive() -> Self {
        let mut roles = HashMap::new();
        roles.insert(
            "default".to_string(),
            RoleConfig {
                allowed_tools: vec!["*".to_string()],
                ..Default::default()
            },
        );
        Self::new(roles, HashMap::new(), "default")
    }

    /// Resolves an inbound source to its role name and config. Unknown sources
    /// get the default role; an unknown default resolves to an empty config
    /// (nothing allowed).
    pub fn resolve(&self, source: &str) -> (String, RoleConfig) {
        let name = self
            .source_mapping
            .get(source)
            .cloned()
            .unwrap_or_else(|| self.default_role.clone());
        let config = self.roles.get(&name).cloned().unwrap_or_default();
        (name, config)
    }

    pub fn get_role(&self, name: &str) -> Option<&RoleConfig> {
        self.roles.get(name)
    }

    /// Blocked overrides allowed; `*` in allowed grants the rest.
    pub fn is_tool_allowed(&self, role: &RoleConfig, tool: &str) -> bool {
        if role.blocked_tools.iter().any(|p| glob_matches(p, tool)) {
            return false;
        }
        if role.allowed_tools.iter().any(|p| p == "*") {
            return true;
        }
        role.allowed_tools.iter().any(|p| glob_matches(p, tool))
    }

    /// Empty `allowed_paths` means unrestricted.
    pub fn is_path_allowed(&self, role: &RoleConfig, path: &str) -> bool {
        if role.allowed_paths.is_empty() {
            return true;
        }
        role.allowed_paths
            .iter()
            .any(|p| glob_matches(&expand_tilde(p), path))
    }

    pub fn can_system_control(&self, role: &RoleConfig) -> bool {
        role.system_control
    }

    pub fn can_access_sensitive(&self, role: &RoleConfig) -> bool {
        role.sensitive_access
    }

    /// Human-readable capability summary used in the context preamble.
    pub fn capabilities(&self, role: &RoleConfig) -> Vec<String> {
        let mut out = Vec::new();
        if role.allowed_tools.iter().any(|p| p == "*") {
            out.push("Full tool access".to_string());
        } else {
            for pattern in &role.allowed_tools {
                out.push(format!("Tools matching {pattern}"));
            }
        }
        if role.allowed_paths.is_empty() {
            out.push("Unrestricted filesystem paths".to_string());
        } else {
            out.push(format!("Paths limited to {}", role.allowed_paths.join(", ")));
        }
        if role.system_control {
            out.push("OS management (bot lifecycle, permissions)".to_string());
        }
        if role.sensitive_access {
            out.push("Sensitive data access (unmasked tokens)".to_string());
        }
        out
    }

    /// Human-readable limitation summary, the mirror of `capabilities`.
    pub fn limitations(&self, role: &RoleConfig) -> Vec<String> {
        let mut out = Vec::new();
        for pattern in &role.blocked_tools {
            out.push(format!("Cannot use tools matching {pattern}"));
        }
        if !role.allowed_paths.is_empty() {
            out.push("File access restricted to allowed paths".to_string());
        }
        if !role.system_control {
            out.push("No OS management operations".to_string());
        }
        if !role.sensitive_access {
            out.push("Sensitive fields are masked".to_string());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_bot() -> RoleConfig {
        RoleConfig {
            allowed_tools: vec!["mama_*".into(), "Read".into(), "discord_send".into()],
            blocked_tools: vec!["Bash".into(), "os_*".into()],
            allowed_paths: vec!["/workspace/**".into()],
            system_control: false,
            sensitive_access: false,
        }
    }

    #[test]
    fn blocked_overrides_allowed() {
        let manager = RoleManager::permissive();
        let mut role = chat_bot();
        role.allowed_tools = vec!["*".into()];
        // Everything allowed, but blocked still wins.
        assert!(!manager.is_tool_allowed(&role, "Bash"));
        assert!(!manager.is_tool_allowed(&role, "os_restart_bot"));
        assert!(manager.is_tool_allowed(&role, "Read"));
    }

    #[test]
    fn glob_patterns_gate_tools() {
        let manager = RoleManager::permissive();
        let role = chat_bot();
        assert!(manager.is_tool_allowed(&role, "mama_save"));
        assert!(manager.is_tool_allowed(&role, "mama_search"));
        assert!(manager.is_tool_allowed(&role, "Read"));
        assert!(!manager.is_tool_allowed(&role, "Write"));
        assert!(!manager.is_tool_allowed(&role, "Bash"));
    }

    #[test]
    fn empty_allowed_paths_is_unrestricted() {
        let manager = RoleManager::permissive();
        let mut role = chat_bot();
        role.allowed_paths.clear();
        assert!(manager.is_path_allowed(&role, "/etc/passwd"));

        role.allowed_paths = vec!["/workspace/**".into()];
        assert!(manager.is_path_allowed(&role, "/workspace/src/main.rs"));
        assert!(!manager.is_path_allowed(&role, "/etc/passwd"));
    }

    #[test]
    fn tilde_expansion_in_path_globs() {
        let manager = RoleManager::permissive();
        let role = RoleConfig {
            allowed_paths: vec!["~/projects/**".into()],
            ..Default::default()
        };
        if let Some(home) = dirs::home_dir() {
            let inside = format!("{}/projects/app/main.rs", home.to_string_lossy());
            assert!(manager.is_path_allowed(&role, &inside));
        }
        assert!(!manager.is_path_allowed(&role, "/somewhere/else"));
    }

    #[test]
    fn source_mapping_with_default_fallback() {
        let mut roles = HashMap::new();
        roles.insert("chat_bot".to_string(), chat_bot());
        roles.insert(
            "viewer_admin".to_string(),
            RoleConfig {
                allowed_tools: vec!["*".into()],
                system_control: true,
                sensitive_access: true,
                ..Default::default()
            },
        );
        let mut mapping = HashMap::new();
        mapping.insert("discord".to_string(), "chat_bot".to_string());
        mapping.insert("viewer".to_string(), "viewer_admin".to_string());
        let manager = RoleManager::new(roles, mapping, "chat_bot");

        assert_eq!(manager.resolve("discord").0, "chat_bot");
        assert_eq!(manager.resolve("viewer").0, "viewer_admin");
        // Unknown source falls back to the default role.
        assert_eq!(manager.resolve("smoke-signal").0, "chat_bot");
    }

    #[test]
    fn agent_permissions_restrict_and_block() {
        let none = AgentPermissions::default();
        assert!(none.allows("Bash"));

        let scoped = AgentPermissions {
            allowed: vec!["mama_*".into(), "Read".into()],
            blocked: vec!["mama_update".into()],
        };
        assert!(scoped.allows("mama_save"));
        assert!(scoped.allows("Read"));
        assert!(!scoped.allows("Write"));
        // Blocked wins even though the allow glob matches.
        assert!(!scoped.allows("mama_update"));

        let star = AgentPermissions {
            allowed: vec!["*".into()],
            blocked: vec!["os_*".into()],
        };
        assert!(star.allows("Bash"));
        assert!(!star.allows("os_stop_bot"));
    }

    #[test]
    fn capability_and_limitation_summaries_reflect_flags() {
        let manager = RoleManager::permissive();
        let role = chat_bot();
        let caps = manager.capabilities(&role);
        assert!(caps.iter().any(|c| c.contains("mama_*")));
        let limits = manager.limitations(&role);
        assert!(limits.iter().any(|l| l.contains("No OS management")));
        assert!(limits.iter().any(|l| l.contains("masked")));
    }
}
