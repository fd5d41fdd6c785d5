//! Core error type shared across the orchestrator.

use thiserror::Error;

/// Error kinds surfaced by the core. Tool-level user-visible failures are
/// returned as structured outcomes instead (see `gateway::ToolOutcome`); this
/// type covers programming errors, transport failures, and scheduler faults.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),
    #[error("job not found: {0}")]
    JobNotFound(String),
    #[error("job already exists: {0}")]
    JobExists(String),
    #[error("job is already running: {0}")]
    JobRunning(String),
    #[error("scheduler: {0}")]
    Scheduler(String),
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("rate limited: {0}")]
    RateLimit(String),
    #[error("api error: {message}")]
    Api { message: String, retryable: bool },
    #[error("transport: {0}")]
    Transport(String),
    #[error("validation: {0}")]
    Validation(String),
}

impl AgentError {
    /// Stable machine-readable code for gateways and logs.
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::InvalidCron(_) => "INVALID_CRON",
            AgentError::JobNotFound(_) => "JOB_NOT_FOUND",
            AgentError::JobExists(_) => "JOB_EXISTS",
            AgentError::JobRunning(_) => "JOB_RUNNING",
            AgentError::Scheduler(_) => "SCHEDULER_ERROR",
            AgentError::UnknownTool(_) => "UNKNOWN_TOOL",
            AgentError::PermissionDenied(_) => "PERMISSION_DENIED",
            AgentError::RateLimit(_) => "RATE_LIMIT",
            AgentError::Api { .. } => "API_ERROR",
            AgentError::Transport(_) => "TRANSPORT",
            AgentError::Validation(_) => "VALIDATION",
        }
    }

    /// Whether a retry may succeed without operator action.
    pub fn retryable(&self) -> bool {
        match self {
            AgentError::RateLimit(_) => true,
            AgentError::Api { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_retryability() {
        assert_eq!(AgentError::UnknownTool("x".into()).code(), "UNKNOWN_TOOL");
        assert!(AgentError::RateLimit("slow down".into()).retryable());
        assert!(AgentError::Api {
            message: "503".into(),
            retryable: true
        }
        .retryable());
        assert!(!AgentError::Api {
            message: "400".into(),
            retryable: false
        }
        .retryable());
        assert!(!AgentError::Transport("broken pipe".into()).retryable());
    }
}
