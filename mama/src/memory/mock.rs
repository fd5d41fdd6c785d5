//! In-memory MemoryApi double: fixed-order storage, substring suggest.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::AgentError;
use crate::memory::api::{
    CheckpointSnapshot, DecisionRecord, MemoryApi, MemoryItem, Outcome, SaveResult, SuggestResponse,
};

#[derive(Default)]
struct State {
    items: Vec<MemoryItem>,
    checkpoint: Option<CheckpointSnapshot>,
    next_id: u64,
    fail_all: bool,
}

/// In-process memory store for tests and local development. `suggest` is a
/// case-insensitive substring match over topic + decision.
#[derive(Default)]
pub struct MockMemoryApi {
    state: Mutex<State>,
}

impl MockMemoryApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seeds a stored decision.
    pub fn seed(&self, topic: &str, decision: &str) {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id.to_string();
        state.items.push(MemoryItem {
            id,
            topic: topic.to_string(),
            decision: decision.to_string(),
            reasoning: String::new(),
            kind: "user_decision".to_string(),
            outcome: None,
        });
    }

    /// Makes every call fail with a transport error, for error-path tests.
    pub fn fail_all(&self) {
        self.state.lock().unwrap().fail_all = true;
    }

    pub fn items(&self) -> Vec<MemoryItem> {
        self.state.lock().unwrap().items.clone()
    }

    fn check(&self) -> Result<(), AgentError> {
        if self.state.lock().unwrap().fail_all {
            return Err(AgentError::Transport("memory api unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl MemoryApi for MockMemoryApi {
    async fn save(&self, record: DecisionRecord) -> Result<SaveResult, AgentError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id.to_string();
        state.items.push(MemoryItem {
            id: id.clone(),
            topic: record.topic,
            decision: record.decision,
            reasoning: record.reasoning,
            kind: record.kind,
            outcome: None,
        });
        Ok(SaveResult {
            success: true,
            id: Some(id),
        })
    }

    async fn save_checkpoint(
        &self,
        summary: &str,
        open_files: &[String],
        next_steps: &[String],
        _recent_conversation: &[String],
    ) -> Result<SaveResult, AgentError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        state.checkpoint = Some(CheckpointSnapshot {
            success: true,
            summary: summary.to_string(),
            next_steps: next_steps.to_vec(),
            open_files: open_files.to_vec(),
        });
        Ok(SaveResult {
            success: true,
            id: None,
        })
    }

    async fn list_decisions(&self, limit: usize) -> Result<Vec<MemoryItem>, AgentError> {
        self.check()?;
        let state = self.state.lock().unwrap();
        Ok(state.items.iter().rev().take(limit).cloned().collect())
    }

    async fn suggest(&self, query: &str, limit: usize) -> Result<SuggestResponse, AgentError> {
        self.check()?;
        let needle = query.to_lowercase();
        let state = self.state.lock().unwrap();
        let results: Vec<MemoryItem> = state
            .items
            .iter()
            .filter(|item| {
                item.topic.to_lowercase().contains(&needle)
                    || item.decision.to_lowercase().contains(&needle)
            })
            .take(limit)
            .cloned()
            .collect();
        let count = results.len();
        Ok(SuggestResponse {
            success: true,
            results,
            count,
        })
    }

    async fn update_outcome(
        &self,
        id: &str,
        outcome: Outcome,
        failure_reason: Option<String>,
    ) -> Result<(), AgentError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        let item = state
            .items
            .iter_mut()
            .find(|item| item.id == id)
            .ok_or_else(|| AgentError::Validation(format!("no memory item {id}")))?;
        item.outcome = Some(match (&outcome, failure_reason) {
            (Outcome::Failed, Some(reason)) => format!("{}: {reason}", outcome.as_str()),
            _ => outcome.as_str().to_string(),
        });
        Ok(())
    }

    async fn load_checkpoint(&self) -> Result<CheckpointSnapshot, AgentError> {
        self.check()?;
        let state = self.state.lock().unwrap();
        Ok(state.checkpoint.clone().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn suggest_matches_topic_and_decision() {
        let api = MockMemoryApi::new();
        api.seed("auth", "Use JWT");
        api.seed("storage", "Use SQLite");
        let hits = api.suggest("jwt", 10).await.unwrap();
        assert_eq!(hits.count, 1);
        assert_eq!(hits.results[0].topic, "auth");
    }

    #[tokio::test]
    async fn update_outcome_is_idempotent() {
        let api = MockMemoryApi::new();
        api.seed("auth", "Use JWT");
        let id = api.items()[0].id.clone();
        api.update_outcome(&id, Outcome::Success, None).await.unwrap();
        api.update_outcome(&id, Outcome::Success, None).await.unwrap();
        assert_eq!(api.items()[0].outcome.as_deref(), Some("SUCCESS"));
    }

    #[tokio::test]
    async fn list_decisions_returns_most_recent_first() {
        let api = MockMemoryApi::new();
        api.seed("a", "first");
        api.seed("b", "second");
        let items = api.list_decisions(1).await.unwrap();
        assert_eq!(items[0].topic, "b");
    }
}
