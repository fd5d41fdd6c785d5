//! Append-only daily memory log: one markdown file per day under
//! `~/.mama/memory/`. Write failures are logged and swallowed; the turn loop
//! never sees them.

use std::io::Write;
use std::path::PathBuf;

use chrono::Local;
use tracing::warn;

pub struct MemoryLogger {
    dir: PathBuf,
}

impl MemoryLogger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Appends one conversation exchange to today's file.
    pub fn log_conversation(&self, channel: &str, user: &str, message: &str, response: &str) {
        let stamp = Local::now().format("%H:%M:%S");
        self.append(&format!(
            "## {stamp} — {channel} / {user}\n\n**user**: {message}\n\n**mama**: {response}\n\n"
        ));
    }

    /// Appends a one-line event (scheduler fire, heartbeat notice, …).
    pub fn log_event(&self, kind: &str, detail: &str) {
        let stamp = Local::now().format("%H:%M:%S");
        self.append(&format!("- {stamp} `{kind}` {detail}\n"));
    }

    fn append(&self, text: &str) {
        let path = self.dir.join(format!("{}.md", Local::now().format("%Y-%m-%d")));
        let result = std::fs::create_dir_all(&self.dir).and_then(|_| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .and_then(|mut f| f.write_all(text.as_bytes()))
        });
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "memory log append failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_to_daily_file() {
        let dir = tempfile::tempdir().unwrap();
        let logger = MemoryLogger::new(dir.path());
        logger.log_conversation("general", "dana", "hi", "hello");
        logger.log_event("cron", "heartbeat fired");

        let name = format!("{}.md", Local::now().format("%Y-%m-%d"));
        let content = std::fs::read_to_string(dir.path().join(name)).unwrap();
        assert!(content.contains("**user**: hi"));
        assert!(content.contains("`cron` heartbeat fired"));
    }

    #[test]
    fn missing_directory_is_created_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("deep/memory");
        let logger = MemoryLogger::new(&nested);
        logger.log_event("boot", "started");
        assert!(nested.is_dir());
    }
}
