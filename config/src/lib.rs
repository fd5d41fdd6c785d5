//! Load configuration from `~/.mama/config.yaml` and the process environment,
//! with priority: **env > config.yaml > built-in defaults**.
//!
//! All persisted state lives under one home directory (see [`MamaHome`]):
//! `config.yaml`, `logs/mama.log`, `memory/YYYY-MM-DD.md`, `workspace/`, and
//! the schedule database next to the memory database.

mod paths;
mod schema;
#[cfg(feature = "tracing-init")]
mod tracing_init;

use std::path::Path;

use thiserror::Error;

pub use paths::MamaHome;
pub use schema::{
    AgentEntry, AgentSettings, BackendKind, CronEntry, MamaConfig, MultiAgentSettings,
    RoleDefinition, RolesConfig, ToolPermissions,
};
#[cfg(feature = "tracing-init")]
pub use tracing_init::{init_tracing, TracingGuard};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("home directory unavailable")]
    NoHome,
    #[error("read config: {0}")]
    Read(std::io::Error),
    #[error("parse config yaml: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("write config: {0}")]
    Write(std::io::Error),
}

/// Environment variables the core recognizes. Captured once at startup so the
/// rest of the process never reads `std::env` directly.
#[derive(Debug, Clone, Default)]
pub struct EnvSettings {
    pub db_path: Option<std::path::PathBuf>,
    pub http_port: Option<u16>,
    pub disable_http_server: bool,
    pub disable_websocket: bool,
    pub disable_mobile_chat: bool,
    pub auth_token: Option<String>,
    pub codex_command: Option<String>,
    pub codex_home: Option<std::path::PathBuf>,
    pub force_tier_3: bool,
    pub log_level: Option<String>,
    pub model: Option<String>,
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "yes"))
        .unwrap_or(false)
}

impl EnvSettings {
    pub fn capture() -> Self {
        Self {
            db_path: std::env::var_os("MAMA_DB_PATH").map(Into::into),
            http_port: std::env::var("MAMA_HTTP_PORT").ok().and_then(|v| v.parse().ok()),
            disable_http_server: env_flag("MAMA_DISABLE_HTTP_SERVER"),
            disable_websocket: env_flag("MAMA_DISABLE_WEBSOCKET"),
            disable_mobile_chat: env_flag("MAMA_DISABLE_MOBILE_CHAT"),
            auth_token: std::env::var("MAMA_AUTH_TOKEN").ok().filter(|s| !s.is_empty()),
            codex_command: std::env::var("MAMA_CODEX_COMMAND")
                .or_else(|_| std::env::var("CODEX_COMMAND"))
                .ok()
                .filter(|s| !s.is_empty()),
            codex_home: std::env::var_os("CODEX_HOME").map(Into::into),
            force_tier_3: env_flag("MAMA_FORCE_TIER_3"),
            log_level: std::env::var("MAMA_LOG_LEVEL").ok().filter(|s| !s.is_empty()),
            model: std::env::var("MAMA_MODEL").ok().filter(|s| !s.is_empty()),
        }
    }
}

/// Loads `config.yaml` from `path` and applies `env` overrides. A missing file
/// yields the built-in defaults (first run).
pub fn load_config(path: &Path, env: &EnvSettings) -> Result<MamaConfig, ConfigError> {
    let mut config = match std::fs::read_to_string(path) {
        Ok(text) => serde_yaml::from_str(&text)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => MamaConfig::default(),
        Err(e) => return Err(ConfigError::Read(e)),
    };
    apply_env(&mut config, env);
    Ok(config)
}

fn apply_env(config: &mut MamaConfig, env: &EnvSettings) {
    if let Some(model) = &env.model {
        config.agent.model = model.clone();
    }
    if env.force_tier_3 {
        for agent in config.multi_agent.agents.values_mut() {
            agent.tier = 3;
        }
    }
}

/// Writes the default config to `path` unless one already exists. Returns
/// whether a file was written. Used by `mama init`.
pub fn write_default_config(path: &Path) -> Result<bool, ConfigError> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(ConfigError::Write)?;
    }
    let yaml = serde_yaml::to_string(&MamaConfig::default())?;
    std::fs::write(path, yaml).map_err(ConfigError::Write)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("config.yaml"), &EnvSettings::default()).unwrap();
        assert_eq!(config.agent.max_turns, 24);
        assert_eq!(config.agent.token_threshold, 150_000);
        assert!(config.cron.is_empty());
    }

    #[test]
    fn token_threshold_is_operator_configurable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "agent:\n  token_threshold: 80000\n").unwrap();
        let config = load_config(&path, &EnvSettings::default()).unwrap();
        assert_eq!(config.agent.token_threshold, 80_000);
        // Other agent fields keep their defaults.
        assert_eq!(config.agent.max_turns, 24);
    }

    #[test]
    fn yaml_fields_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            r#"
agent:
  model: test-model
  max_turns: 3
roles:
  definitions:
    chat_bot:
      allowed_tools: ["mama_*", "Read"]
      blocked_tools: ["Bash"]
  source_mapping:
    discord: chat_bot
cron:
  - id: hb
    name: heartbeat
    cron: "*/5 * * * *"
    prompt: ping
    enabled: true
"#,
        )
        .unwrap();
        let config = load_config(&path, &EnvSettings::default()).unwrap();
        assert_eq!(config.agent.model, "test-model");
        assert_eq!(config.agent.max_turns, 3);
        let role = &config.roles.definitions["chat_bot"];
        assert_eq!(role.blocked_tools, vec!["Bash"]);
        assert_eq!(config.roles.source_mapping["discord"], "chat_bot");
        assert_eq!(config.cron.len(), 1);
        assert_eq!(config.cron[0].id, "hb");
    }

    #[test]
    fn env_model_wins_over_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "agent:\n  model: from-yaml\n").unwrap();
        let env = EnvSettings {
            model: Some("from-env".to_string()),
            ..Default::default()
        };
        let config = load_config(&path, &env).unwrap();
        assert_eq!(config.agent.model, "from-env");
    }

    #[test]
    fn force_tier_3_applies_to_all_agents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "multi_agent:\n  agents:\n    main:\n      backend: claude\n      tier: 1\n",
        )
        .unwrap();
        let env = EnvSettings {
            force_tier_3: true,
            ..Default::default()
        };
        let config = load_config(&path, &env).unwrap();
        assert_eq!(config.multi_agent.agents["main"].tier, 3);
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "agent: [not a map").unwrap();
        assert!(matches!(
            load_config(&path, &EnvSettings::default()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn write_default_is_non_destructive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        assert!(write_default_config(&path).unwrap());
        std::fs::write(&path, "agent:\n  model: customized\n").unwrap();
        assert!(!write_default_config(&path).unwrap());
        let config = load_config(&path, &EnvSettings::default()).unwrap();
        assert_eq!(config.agent.model, "customized");
    }
}
