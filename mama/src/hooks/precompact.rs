//! Pre-compaction guard: detect decision-shaped lines the agent never saved,
//! and build the structured compaction prompt.
//!
//! Runs when the session is near its token threshold or on an explicit
//! compaction signal. Never throws: a failing memory API is treated as "no
//! saved results", which at worst re-warns about an already-saved decision.

use std::sync::Arc;

use tracing::warn;

use crate::memory::MemoryApi;

/// Decision line markers, English and Korean. A line counts when it contains
/// `<marker>` and the text after it is at least `MIN_DECISION_LEN` chars.
const DECISION_MARKERS: [&str; 12] = [
    "decided:",
    "decision:",
    "chose:",
    "we'll use:",
    "going with:",
    "approach:",
    "architecture:",
    "strategy:",
    "선택:",
    "결정:",
    "설계:",
    "방식:",
];

const MIN_DECISION_LEN: usize = 10;
const SAVED_LOOKUP_LIMIT: usize = 20;

#[derive(Debug, Clone)]
pub struct PreCompactConfig {
    /// Cap on detected decisions; the most recent are kept.
    pub max_decisions_to_detect: usize,
}

impl Default for PreCompactConfig {
    fn default() -> Self {
        Self {
            max_decisions_to_detect: 5,
        }
    }
}

/// What `process` hands back to the loop.
#[derive(Debug, Clone)]
pub struct PreCompactReport {
    pub unsaved_decisions: Vec<String>,
    pub compaction_prompt: String,
    /// Present only when unsaved decisions exist.
    pub warning_message: Option<String>,
}

/// Detects unsaved decisions before context compaction.
pub struct PreCompactHandler {
    memory: Arc<dyn MemoryApi>,
    config: PreCompactConfig,
}

impl PreCompactHandler {
    pub fn new(memory: Arc<dyn MemoryApi>, config: PreCompactConfig) -> Self {
        Self { memory, config }
    }

    /// Scans history lines, checks candidates against saved decisions, and
    /// builds the compaction prompt plus an optional warning.
    pub async fn process(&self, history: &[String]) -> PreCompactReport {
        let candidates = self.detect_decisions(history);
        let saved = match self.memory.list_decisions(SAVED_LOOKUP_LIMIT).await {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "saved-decision lookup failed, assuming none saved");
                Vec::new()
            }
        };

        let unsaved: Vec<String> = candidates
            .into_iter()
            .filter(|candidate| {
                let lower = candidate.to_lowercase();
                !saved.iter().any(|item| {
                    let topic = item.topic.to_lowercase();
                    let decision = item.decision.to_lowercase();
                    (!topic.is_empty() && (lower.contains(&topic) || topic.contains(&lower)))
                        || (!decision.is_empty()
                            && (lower.contains(&decision) || decision.contains(&lower)))
                })
            })
            .collect();

        let compaction_prompt = build_compaction_prompt(&unsaved, history.len());
        let warning_message = (!unsaved.is_empty()).then(|| {
            format!(
                "{} unsaved decision(s) detected before compaction: {}. Save them with mama_save before continuing.",
                unsaved.len(),
                unsaved.join("; ")
            )
        });

        PreCompactReport {
            unsaved_decisions: unsaved,
            compaction_prompt,
            warning_message,
        }
    }

    /// Decision-shaped lines, deduplicated, capped to the most recent.
    fn detect_decisions(&self, history: &[String]) -> Vec<String> {
        let mut seen = Vec::new();
        for line in history {
            if line.trim().len() < MIN_DECISION_LEN {
                continue;
            }
            let lower = line.to_lowercase();
            for marker in DECISION_MARKERS {
                if let Some(at) = lower.find(marker) {
                    // Lowercasing can shift byte offsets for some scripts;
                    // an out-of-range slice must yield empty, not panic.
                    let text = line
                        .get(at + marker.len()..)
                        .unwrap_or("")
                        .trim()
                        .to_string();
                    if !text.is_empty()
                        && !seen.iter().any(|s: &String| s.eq_ignore_ascii_case(&text))
                    {
                        seen.push(text);
                    }
                    break;
                }
            }
        }
        let cap = self.config.max_decisions_to_detect;
        if seen.len() > cap {
            seen.split_off(seen.len() - cap)
        } else {
            seen
        }
    }
}

/// The 7-section compaction prompt, with an Unsaved Decisions section only
/// when something is at risk.
fn build_compaction_prompt(unsaved: &[String], history_lines: usize) -> String {
    let mut prompt = String::from(
        "Summarize this conversation for continuation after compaction. \
         Cover every section:\n\n",
    );
    let sections = [
        ("User Requests", "every request the user made, including ones already satisfied"),
        ("Final Goal", "the end state the user is driving toward"),
        ("Work Completed", "what has been finished and verified"),
        ("Remaining Tasks", "what is still open, in priority order"),
        ("Active Working Context", "files, identifiers, and state currently in play"),
        ("Explicit Constraints", "rules and preferences the user stated"),
        ("Agent Verification State", "what has been tested and what remains unverified"),
    ];
    for (title, guidance) in sections {
        prompt.push_str(&format!("## {title}\n{guidance}\n\n"));
    }
    if !unsaved.is_empty() {
        prompt.push_str("## Unsaved Decisions\n");
        for decision in unsaved {
            prompt.push_str(&format!("- {decision}\n"));
        }
        prompt.push('\n');
    }
    prompt.push_str(&format!(
        "Conversation context: ~{history_lines} lines before compaction"
    ));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MockMemoryApi;

    fn handler_with(memory: Arc<MockMemoryApi>) -> PreCompactHandler {
        PreCompactHandler::new(memory, PreCompactConfig::default())
    }

    #[tokio::test]
    async fn detects_unsaved_and_skips_saved() {
        let memory = Arc::new(MockMemoryApi::new());
        memory.seed("JWT", "");
        let handler = handler_with(memory);

        let history = vec![
            "decided: use JWT tokens for auth".to_string(),
            "approach: REST API design".to_string(),
        ];
        let report = handler.process(&history).await;
        assert_eq!(report.unsaved_decisions, vec!["REST API design"]);

        let prompt = &report.compaction_prompt;
        for section in [
            "## User Requests",
            "## Final Goal",
            "## Work Completed",
            "## Remaining Tasks",
            "## Active Working Context",
            "## Explicit Constraints",
            "## Agent Verification State",
            "## Unsaved Decisions",
        ] {
            assert!(prompt.contains(section), "missing {section}");
        }
        assert!(prompt.contains("- REST API design"));
        assert!(!prompt.contains("- use JWT tokens for auth"));
        assert!(prompt.contains("Conversation context: ~2 lines before compaction"));

        let warning = report.warning_message.unwrap();
        assert!(warning.contains("REST API design"));
    }

    #[tokio::test]
    async fn no_unsaved_section_or_warning_when_all_saved() {
        let memory = Arc::new(MockMemoryApi::new());
        memory.seed("auth", "use JWT tokens for auth");
        let handler = handler_with(memory);

        let history = vec!["decided: use JWT tokens for auth".to_string()];
        let report = handler.process(&history).await;
        assert!(report.unsaved_decisions.is_empty());
        assert!(report.warning_message.is_none());
        assert!(!report.compaction_prompt.contains("## Unsaved Decisions"));
    }

    #[tokio::test]
    async fn short_lines_and_duplicates_are_ignored() {
        let memory = Arc::new(MockMemoryApi::new());
        let handler = handler_with(memory);
        let history = vec![
            "chose: ok".to_string(), // too short
            "decided: adopt event sourcing".to_string(),
            "DECIDED: adopt event sourcing".to_string(), // duplicate
        ];
        let report = handler.process(&history).await;
        assert_eq!(report.unsaved_decisions, vec!["adopt event sourcing"]);
    }

    #[tokio::test]
    async fn korean_markers_detect() {
        let memory = Arc::new(MockMemoryApi::new());
        let handler = handler_with(memory);
        let history = vec!["결정: 데이터베이스는 SQLite 사용".to_string()];
        let report = handler.process(&history).await;
        assert_eq!(report.unsaved_decisions.len(), 1);
        assert!(report.unsaved_decisions[0].contains("SQLite"));
    }

    #[tokio::test]
    async fn cap_retains_most_recent() {
        let memory = Arc::new(MockMemoryApi::new());
        let handler = PreCompactHandler::new(
            memory,
            PreCompactConfig {
                max_decisions_to_detect: 2,
            },
        );
        let history: Vec<String> = (1..=4)
            .map(|i| format!("decided: decision number {i} stands"))
            .collect();
        let report = handler.process(&history).await;
        assert_eq!(
            report.unsaved_decisions,
            vec!["decision number 3 stands", "decision number 4 stands"]
        );
    }

    #[tokio::test]
    async fn memory_failure_assumes_nothing_saved() {
        let memory = Arc::new(MockMemoryApi::new());
        memory.fail_all();
        let handler = handler_with(memory);
        let history = vec!["decided: keep the monolith for now".to_string()];
        let report = handler.process(&history).await;
        assert_eq!(report.unsaved_decisions.len(), 1);
        assert!(report.warning_message.is_some());
    }
}
