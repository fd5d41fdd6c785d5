//! The memory API contract: decisions, checkpoints, suggestion search.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AgentError;

/// A decision (or pattern learning) to persist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub topic: String,
    pub decision: String,
    pub reasoning: String,
    /// In `[0, 1]`.
    pub confidence: f64,
    /// MAMA-internal type string, e.g. `user_decision`.
    #[serde(rename = "type")]
    pub kind: String,
}

/// One stored memory item as returned by list/suggest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: String,
    pub topic: String,
    pub decision: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub outcome: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveResult {
    pub success: bool,
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuggestResponse {
    pub success: bool,
    pub results: Vec<MemoryItem>,
    pub count: usize,
}

/// Latest checkpoint as returned by `load_checkpoint`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointSnapshot {
    pub success: bool,
    pub summary: String,
    pub next_steps: Vec<String>,
    pub open_files: Vec<String>,
}

/// Recorded outcome of a past decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Success,
    Failed,
    Pending,
}

impl Outcome {
    /// Case-insensitive parse of the gateway argument.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SUCCESS" => Some(Outcome::Success),
            "FAILED" => Some(Outcome::Failed),
            "PENDING" => Some(Outcome::Pending),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "SUCCESS",
            Outcome::Failed => "FAILED",
            Outcome::Pending => "PENDING",
        }
    }
}

/// External memory service consumed by the executor and hooks. Reads are
/// assumed idempotent; writes may be retried by the service itself.
#[async_trait]
pub trait MemoryApi: Send + Sync {
    async fn save(&self, record: DecisionRecord) -> Result<SaveResult, AgentError>;

    async fn save_checkpoint(
        &self,
        summary: &str,
        open_files: &[String],
        next_steps: &[String],
        recent_conversation: &[String],
    ) -> Result<SaveResult, AgentError>;

    async fn list_decisions(&self, limit: usize) -> Result<Vec<MemoryItem>, AgentError>;

    async fn suggest(&self, query: &str, limit: usize) -> Result<SuggestResponse, AgentError>;

    async fn update_outcome(
        &self,
        id: &str,
        outcome: Outcome,
        failure_reason: Option<String>,
    ) -> Result<(), AgentError>;

    async fn load_checkpoint(&self) -> Result<CheckpointSnapshot, AgentError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_parse_is_case_insensitive() {
        assert_eq!(Outcome::parse("success"), Some(Outcome::Success));
        assert_eq!(Outcome::parse("FAILED"), Some(Outcome::Failed));
        assert_eq!(Outcome::parse("Pending"), Some(Outcome::Pending));
        assert_eq!(Outcome::parse("unknown"), None);
    }
}
