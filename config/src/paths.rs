//! Persisted state layout under the user home: everything MAMA owns lives in
//! one directory so backup and teardown stay trivial.

use std::path::{Path, PathBuf};

use crate::ConfigError;

/// Resolved `~/.mama` layout.
#[derive(Debug, Clone)]
pub struct MamaHome {
    root: PathBuf,
}

impl MamaHome {
    /// Resolves against the user home directory.
    pub fn resolve() -> Result<Self, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHome)?;
        Ok(Self {
            root: home.join(".mama"),
        })
    }

    /// Uses an explicit root. Tests point this at a tempdir.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.yaml")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn memory_dir(&self) -> PathBuf {
        self.root.join("memory")
    }

    pub fn workspace_dir(&self) -> PathBuf {
        self.root.join("workspace")
    }

    /// Schedule database, alongside the memory database.
    pub fn schedule_db_path(&self) -> PathBuf {
        self.root.join("schedules.db")
    }

    pub fn memory_db_path(&self) -> PathBuf {
        self.root.join("memory.db")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.root.join("mama.pid")
    }

    /// Creates the directory tree. Idempotent.
    pub fn ensure_dirs(&self) -> Result<(), ConfigError> {
        for dir in [
            self.root.clone(),
            self.logs_dir(),
            self.memory_dir(),
            self.workspace_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(ConfigError::Write)?;
        }
        Ok(())
    }
}
