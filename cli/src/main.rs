//! `mama` binary: init, setup, daemon control, one-shot runs.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use config::MamaHome;

#[derive(Parser)]
#[command(name = "mama", version, about = "Orchestrator for the MAMA agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create ~/.mama and a default config.
    Init,
    /// Init plus a summary of the effective configuration.
    Setup,
    /// Start the orchestrator (daemonized unless --foreground).
    Start {
        #[arg(long)]
        foreground: bool,
    },
    /// Stop the running orchestrator.
    Stop,
    /// Stop (if running) and start again.
    Restart,
    /// Show whether the orchestrator is running.
    Status,
    /// Run one prompt in the foreground and print the response.
    Run {
        /// The prompt text.
        prompt: Vec<String>,
        #[arg(long)]
        verbose: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let home = match MamaHome::resolve() {
        Ok(home) => home,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Command::Init => cli::cmd_init(&home),
        Command::Setup => cli::cmd_setup(&home),
        Command::Start { foreground: true } => cli::runtime::run_orchestrator(&home).await,
        Command::Start { foreground: false } => cli::daemon::start_detached(&home),
        Command::Stop => cli::daemon::stop(&home),
        Command::Restart => cli::daemon::restart(&home),
        Command::Status => cli::daemon::status(&home),
        Command::Run { prompt, verbose } => {
            let text = prompt.join(" ");
            if text.trim().is_empty() {
                eprintln!("error: empty prompt");
                return ExitCode::FAILURE;
            }
            cli::cmd_run(&home, &text, verbose).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
