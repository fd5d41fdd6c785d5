//! Composition root: every collaborator is bound here, once, from config.
//! Library code never reaches for globals.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use config::{AgentEntry, BackendKind, EnvSettings, MamaConfig, MamaHome, RoleDefinition};
use mama::{
    AgentBackend, AgentLoop, AgentLoopConfig, AgentPermissions, Backend, BackendFactory,
    BackendPool, ChannelKey, ClaudeCliOptions, ClaudeCliWrapper, CodexAppServerProcess,
    CodexOptions, GatewayToolExecutor, HeartbeatOptions, HeartbeatRunner, HeartbeatScheduler,
    LaneManager, MemoryApi, MemoryLogger, MockMemoryApi, PostToolConfig, PostToolHandler,
    PreCompactConfig, PreCompactHandler, PromptEnhancer, PromptInput, RefreshFn, RoleConfig,
    RoleManager, SessionMeta, SessionPool, SessionPoolConfig, TokenKeepAlive,
};
use mama_schedule::{
    CronScheduler, ExecuteFn, JobRun, NewSchedule, ScheduleStore, SchedulerOptions,
};
use tracing::{info, warn};

use crate::CliError;

/// Everything a command needs after wiring.
pub struct Components {
    pub agent: AgentLoop,
    pub roles: Arc<RoleManager>,
    pub memory: Arc<dyn MemoryApi>,
}

/// The `main` agent entry, or the first one when no `main` is defined.
fn main_agent_entry(config: &MamaConfig) -> Option<&AgentEntry> {
    config
        .multi_agent
        .agents
        .get("main")
        .or_else(|| config.multi_agent.agents.values().next())
}

fn to_role_config(def: &RoleDefinition) -> RoleConfig {
    RoleConfig {
        allowed_tools: def.allowed_tools.clone(),
        blocked_tools: def.blocked_tools.clone(),
        allowed_paths: def.allowed_paths.clone(),
        system_control: def.system_control,
        sensitive_access: def.sensitive_access,
    }
}

/// Role table from config; with no definitions every source gets the
/// permissive default.
pub fn build_role_manager(config: &MamaConfig) -> RoleManager {
    if config.roles.definitions.is_empty() {
        return RoleManager::permissive();
    }
    let roles: HashMap<String, RoleConfig> = config
        .roles
        .definitions
        .iter()
        .map(|(name, def)| (name.clone(), to_role_config(def)))
        .collect();
    let mapping: HashMap<String, String> = config
        .roles
        .source_mapping
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let default_role = if roles.contains_key("default") {
        "default".to_string()
    } else {
        config
            .roles
            .definitions
            .keys()
            .next()
            .cloned()
            .unwrap_or_else(|| "default".to_string())
    };
    RoleManager::new(roles, mapping, default_role)
}

/// Picks the `main` agent entry (or the first one) and returns a factory that
/// builds one backend per channel key, so every conversation owns its own
/// subprocess.
pub fn build_backend_factory(config: &MamaConfig, env: &EnvSettings) -> BackendFactory {
    let entry = main_agent_entry(config);
    let model = entry
        .and_then(|e| e.model.clone())
        .unwrap_or_else(|| config.agent.model.clone());
    let kind = entry.map(|e| e.backend).unwrap_or_default();
    let (allowed, blocked) = entry
        .map(|e| {
            (
                e.tool_permissions.allowed.clone(),
                e.tool_permissions.blocked.clone(),
            )
        })
        .unwrap_or_default();
    let timeout = Duration::from_secs(config.agent.timeout);
    let codex_command = env
        .codex_command
        .clone()
        .unwrap_or_else(|| "codex".to_string());
    let codex_home = env.codex_home.clone();

    Arc::new(move || {
        let backend = match kind {
            BackendKind::Claude => Backend::Claude(ClaudeCliWrapper::new(ClaudeCliOptions {
                model: Some(model.clone()),
                allowed_tools: allowed.clone(),
                disallowed_tools: blocked.clone(),
                request_timeout: timeout,
                ..Default::default()
            })),
            BackendKind::Codex => Backend::Codex(CodexAppServerProcess::new(CodexOptions {
                command: codex_command.clone(),
                model: Some(model.clone()),
                codex_home: codex_home.clone(),
                ..Default::default()
            })),
        };
        Arc::new(backend) as Arc<dyn AgentBackend>
    })
}

fn load_persona(config: &MamaConfig) -> Option<String> {
    let entry = main_agent_entry(config)?;
    let path = entry.persona_file.as_ref()?;
    match std::fs::read_to_string(path) {
        Ok(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Ok(_) => None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "persona file unreadable");
            None
        }
    }
}

/// Wires the full agent stack. The memory API runs in-process until an
/// external memory service is attached by the host.
pub fn build_components(
    config: &MamaConfig,
    env: &EnvSettings,
    home: &MamaHome,
) -> Result<Components, CliError> {
    let roles = Arc::new(build_role_manager(config));
    let memory: Arc<dyn MemoryApi> = Arc::new(MockMemoryApi::new());
    let backends = Arc::new(BackendPool::new(build_backend_factory(config, env)));
    // Per-agent tool_permissions gate dispatch for both backend kinds; for
    // Claude they additionally become the subprocess tool flags.
    let mut executor = GatewayToolExecutor::new(
        roles.clone(),
        memory.clone(),
        home.workspace_dir(),
    );
    if let Some(entry) = main_agent_entry(config) {
        executor = executor.with_agent_permissions(AgentPermissions {
            allowed: entry.tool_permissions.allowed.clone(),
            blocked: entry.tool_permissions.blocked.clone(),
        });
    }
    let executor = Arc::new(executor);
    let agent = AgentLoop::new(
        backends,
        executor,
        Arc::new(SessionPool::new(SessionPoolConfig {
            token_threshold: config.agent.token_threshold,
            ..Default::default()
        })),
        Arc::new(LaneManager::new()),
        Arc::new(PromptEnhancer::new()),
        Arc::new(PreCompactHandler::new(
            memory.clone(),
            PreCompactConfig::default(),
        )),
        Arc::new(PostToolHandler::new(
            memory.clone(),
            PostToolConfig::default(),
        )),
        Some(Arc::new(MemoryLogger::new(home.memory_dir()))),
        AgentLoopConfig {
            max_turns: config.agent.max_turns,
            workspace: home.workspace_dir(),
            system_prompt: load_persona(config),
            tier: main_agent_entry(config).map(|entry| entry.tier.to_string()),
        },
    );
    Ok(Components {
        agent,
        roles,
        memory,
    })
}

/// Seeds config-declared cron entries into the store, then recovers.
async fn seed_and_recover(
    config: &MamaConfig,
    store: &Arc<ScheduleStore>,
    scheduler: &CronScheduler,
) -> Result<(), CliError> {
    for entry in &config.cron {
        if store.get_job(&entry.id).await.is_err() {
            store
                .create_job(NewSchedule {
                    id: Some(entry.id.clone()),
                    name: entry.name.clone(),
                    cron: entry.cron.clone(),
                    prompt: entry.prompt.clone(),
                    enabled: entry.enabled,
                })
                .await?;
        }
    }
    let recovered = scheduler.recover().await?;
    info!(recovered, "scheduler recovered");
    Ok(())
}

/// `mama start --foreground`: run until interrupted.
pub async fn run_orchestrator(home: &MamaHome) -> Result<(), CliError> {
    let env = EnvSettings::capture();
    let config = config::load_config(&home.config_path(), &env)?;
    home.ensure_dirs()?;
    let _tracing = config::init_tracing(&home.logs_dir(), env.log_level.as_deref());
    crate::daemon::write_own_pid(home)?;
    info!(home = %home.root().display(), "mama starting");

    let parts = build_components(&config, &env, home)?;

    // Scheduler: timer fires run the same agent loop a chat message does.
    let store = Arc::new(ScheduleStore::new(home.schedule_db_path())?);
    let scheduler_agent = parts.agent.clone();
    let scheduler_roles = parts.roles.clone();
    let execute: ExecuteFn = Arc::new(move |run: JobRun| {
        let agent = scheduler_agent.clone();
        let roles = scheduler_roles.clone();
        Box::pin(async move {
            let ctx = mama::context_for_source(
                &roles,
                "cli",
                SessionMeta {
                    session_id: format!("cron-{}", run.id),
                    channel: Some(run.name.clone()),
                    user: None,
                    user_name: None,
                },
            );
            let key = ChannelKey::new("scheduler", None, Some(&run.id), None);
            agent
                .run(ctx, key, PromptInput::Text(run.prompt), None)
                .await
                .map(|outcome| outcome.response)
                .map_err(|e| e.to_string())
        })
    });
    let scheduler = CronScheduler::new(
        execute,
        Some(Arc::new(|event| info!(?event, "cron"))),
        Some(store.clone()),
        SchedulerOptions::default(),
    );
    seed_and_recover(&config, &store, &scheduler).await?;

    // Heartbeat: same loop, its own lane.
    let heartbeat_agent = parts.agent.clone();
    let heartbeat_roles = parts.roles.clone();
    let runner: HeartbeatRunner = Arc::new(move |prompt: String| {
        let agent = heartbeat_agent.clone();
        let roles = heartbeat_roles.clone();
        Box::pin(async move {
            let ctx = mama::context_for_source(
                &roles,
                "cli",
                SessionMeta {
                    session_id: "heartbeat".to_string(),
                    channel: None,
                    user: None,
                    user_name: None,
                },
            );
            let key = ChannelKey::new("heartbeat", None, None, None);
            agent
                .run(ctx, key, PromptInput::Text(prompt), None)
                .await
                .map(|outcome| outcome.response)
        })
    });
    let heartbeat = Arc::new(HeartbeatScheduler::new(
        runner,
        HeartbeatOptions::default(),
        None,
    ));
    heartbeat.start().await;

    // Keep the OAuth token warm by exercising the CLI.
    let refresh: RefreshFn = Arc::new(|| {
        Box::pin(async {
            let status = tokio::process::Command::new("claude")
                .arg("--version")
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .status()
                .await
                .map_err(|e| e.to_string())?;
            if status.success() {
                Ok(())
            } else {
                Err(format!("claude --version exited with {status}"))
            }
        })
    });
    let keepalive = Arc::new(TokenKeepAlive::new(
        Duration::from_secs(6 * 3600),
        refresh,
        None,
        None,
    ));
    keepalive.start().await;

    info!("mama ready");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    scheduler.shutdown().await;
    heartbeat.stop().await;
    keepalive.stop().await;
    crate::daemon::clear_own_pid(home);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_manager_from_config_definitions() {
        let yaml = r#"
roles:
  definitions:
    chat_bot:
      allowed_tools: ["mama_*"]
      blocked_tools: ["Bash"]
  source_mapping:
    discord: chat_bot
"#;
        let config: MamaConfig = serde_yaml::from_str(yaml).unwrap();
        let manager = build_role_manager(&config);
        let (name, role) = manager.resolve("discord");
        assert_eq!(name, "chat_bot");
        assert!(!manager.is_tool_allowed(&role, "Bash"));
        assert!(manager.is_tool_allowed(&role, "mama_save"));
    }

    #[test]
    fn empty_definitions_fall_back_to_permissive() {
        let config = MamaConfig::default();
        let manager = build_role_manager(&config);
        let (_, role) = manager.resolve("anything");
        assert!(manager.is_tool_allowed(&role, "Bash"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn components_build_from_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let home = MamaHome::at(dir.path().join(".mama"));
        home.ensure_dirs().unwrap();
        let config = MamaConfig::default();
        let parts = build_components(&config, &EnvSettings::default(), &home).unwrap();
        let (name, _) = parts.roles.resolve("cli");
        assert_eq!(name, "default");
    }
}
