//! Daemon control via a pid file under `~/.mama`.
//!
//! `start` re-execs the current binary with `--foreground` detached from the
//! terminal; `stop` signals the recorded pid. Unix-only process signalling.

use std::process::{Command, Stdio};

use config::MamaHome;
use tracing::info;

use crate::CliError;

fn read_pid(home: &MamaHome) -> Option<u32> {
    std::fs::read_to_string(home.pid_file())
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

fn process_alive(pid: u32) -> bool {
    Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Spawns the orchestrator in the background and records its pid.
pub fn start_detached(home: &MamaHome) -> Result<(), CliError> {
    if let Some(pid) = read_pid(home) {
        if process_alive(pid) {
            return Err(CliError::Daemon(format!("already running (pid {pid})")));
        }
    }
    home.ensure_dirs()?;
    let exe = std::env::current_exe()?;
    let child = Command::new(exe)
        .args(["start", "--foreground"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| CliError::Daemon(format!("failed to spawn daemon: {e}")))?;
    std::fs::write(home.pid_file(), child.id().to_string())?;
    println!("started (pid {})", child.id());
    Ok(())
}

/// Stops the recorded daemon. Failure when nothing is running.
pub fn stop(home: &MamaHome) -> Result<(), CliError> {
    let Some(pid) = read_pid(home) else {
        return Err(CliError::Daemon("not running (no pid file)".into()));
    };
    if !process_alive(pid) {
        let _ = std::fs::remove_file(home.pid_file());
        return Err(CliError::Daemon(format!("not running (stale pid {pid})")));
    }
    let status = Command::new("kill")
        .arg(pid.to_string())
        .status()
        .map_err(|e| CliError::Daemon(format!("kill failed: {e}")))?;
    if !status.success() {
        return Err(CliError::Daemon(format!("kill {pid} failed")));
    }
    let _ = std::fs::remove_file(home.pid_file());
    info!(pid, "daemon stopped");
    println!("stopped (pid {pid})");
    Ok(())
}

/// Prints the daemon state. Always succeeds.
pub fn status(home: &MamaHome) -> Result<(), CliError> {
    match read_pid(home) {
        Some(pid) if process_alive(pid) => println!("running (pid {pid})"),
        Some(pid) => println!("not running (stale pid {pid})"),
        None => println!("not running"),
    }
    Ok(())
}

/// Stop (tolerating "not running") then start.
pub fn restart(home: &MamaHome) -> Result<(), CliError> {
    match stop(home) {
        Ok(()) => {}
        Err(CliError::Daemon(reason)) => println!("{reason}"),
        Err(other) => return Err(other),
    }
    start_detached(home)
}

/// Records the current process as the daemon. Called by `start --foreground`.
pub fn write_own_pid(home: &MamaHome) -> Result<(), CliError> {
    home.ensure_dirs()?;
    std::fs::write(home.pid_file(), std::process::id().to_string())?;
    Ok(())
}

/// Removes the pid file when it belongs to this process.
pub fn clear_own_pid(home: &MamaHome) {
    if read_pid(home) == Some(std::process::id()) {
        let _ = std::fs::remove_file(home.pid_file());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_without_pid_file_reports_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let home = MamaHome::at(dir.path().join(".mama"));
        assert!(status(&home).is_ok());
        assert!(matches!(stop(&home), Err(CliError::Daemon(_))));
    }

    #[test]
    fn own_pid_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let home = MamaHome::at(dir.path().join(".mama"));
        write_own_pid(&home).unwrap();
        assert_eq!(read_pid(&home), Some(std::process::id()));
        // Our own pid is alive.
        assert!(process_alive(std::process::id()));
        clear_own_pid(&home);
        assert_eq!(read_pid(&home), None);
    }

    #[test]
    fn stale_pid_is_cleaned_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        let home = MamaHome::at(dir.path().join(".mama"));
        home.ensure_dirs().unwrap();
        // A pid far above pid_max on typical hosts.
        std::fs::write(home.pid_file(), "99999999").unwrap();
        assert!(matches!(stop(&home), Err(CliError::Daemon(_))));
        assert_eq!(read_pid(&home), None);
    }
}
