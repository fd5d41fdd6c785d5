//! CLI for MAMA: `init`/`setup` write the home layout, `start`/`stop`/
//! `status`/`restart` control the daemon, `run` executes one prompt in the
//! foreground.

pub mod daemon;
pub mod runtime;

use config::{EnvSettings, MamaHome};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("config: {0}")]
    Config(#[from] config::ConfigError),
    #[error("{0}")]
    Daemon(String),
    #[error("agent: {0}")]
    Agent(#[from] mama::AgentError),
    #[error("scheduler: {0}")]
    Scheduler(#[from] mama_schedule::SchedulerError),
    #[error("store: {0}")]
    Store(#[from] mama_schedule::StoreError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// `mama init`: create `~/.mama` and a default config. Non-destructive.
pub fn cmd_init(home: &MamaHome) -> Result<(), CliError> {
    home.ensure_dirs()?;
    let written = config::write_default_config(&home.config_path())?;
    if written {
        println!("wrote {}", home.config_path().display());
    } else {
        println!("config already exists at {}", home.config_path().display());
    }
    println!("home: {}", home.root().display());
    Ok(())
}

/// `mama setup`: init plus a summary of what the orchestrator will use.
pub fn cmd_setup(home: &MamaHome) -> Result<(), CliError> {
    cmd_init(home)?;
    let env = EnvSettings::capture();
    let config = config::load_config(&home.config_path(), &env)?;
    println!("model: {}", config.agent.model);
    println!("max turns: {}", config.agent.max_turns);
    println!("roles: {}", config.roles.definitions.len());
    println!("cron entries: {}", config.cron.len());
    println!("logs: {}", home.logs_dir().display());
    println!("memory: {}", home.memory_dir().display());
    println!("schedule db: {}", home.schedule_db_path().display());
    if config.roles.definitions.is_empty() {
        println!("note: no roles defined; all sources get the permissive default role");
    }
    Ok(())
}

/// `mama run <prompt>`: one foreground turn against the configured backend.
pub async fn cmd_run(home: &MamaHome, prompt: &str, verbose: bool) -> Result<(), CliError> {
    let env = EnvSettings::capture();
    let config = config::load_config(&home.config_path(), &env)?;
    let parts = runtime::build_components(&config, &env, home)?;

    let ctx = mama::context_for_source(
        &parts.roles,
        "cli",
        mama::SessionMeta {
            session_id: uuid_like_session(),
            channel: None,
            user: None,
            user_name: None,
        },
    );
    let key = mama::ChannelKey::new("cli", None, None, None);
    let outcome = parts
        .agent
        .run(ctx, key, mama::PromptInput::Text(prompt.to_string()), None)
        .await?;

    println!("{}", outcome.response);
    if verbose {
        eprintln!(
            "turns: {} · tokens: {} in / {} out · stop: {:?}",
            outcome.turns,
            outcome.total_usage.input_tokens,
            outcome.total_usage.output_tokens,
            outcome.stop_reason
        );
    }
    Ok(())
}

fn uuid_like_session() -> String {
    format!("cli-{}", std::process::id())
}
