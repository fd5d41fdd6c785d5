//! LLM subprocess backends: a common capability set over two interchangeable
//! implementations (Claude CLI, Codex app server).
//!
//! The loop is polymorphic over `{set_system_prompt, set_session_id, prompt,
//! reset_session}`; everything else (framing, state machines, restarts) stays
//! behind the trait.

mod claude;
mod codex;
mod mock;
mod pool;

pub use claude::{build_claude_args, ClaudeCliOptions, ClaudeCliWrapper};
pub use codex::{CodexAppServerProcess, CodexOptions, ProcessPhase};
pub use mock::MockBackend;
pub use pool::{BackendFactory, BackendPool};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AgentError;

/// One content block of a prompt. Multimodal inputs carry base64 payloads and
/// a media type straight through; there is no text-only fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        data: String,
        media_type: String,
    },
    Document {
        data: String,
        media_type: String,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

/// Input to one backend turn.
#[derive(Debug, Clone)]
pub enum PromptInput {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl PromptInput {
    /// Wire form: plain string for text, block array otherwise.
    pub fn to_wire(&self) -> Value {
        match self {
            PromptInput::Text(text) => Value::String(text.clone()),
            PromptInput::Blocks(blocks) => serde_json::to_value(blocks).unwrap_or(Value::Null),
        }
    }
}

/// Token usage for one call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Why the model stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTurns,
    StopSequence,
}

/// One tool invocation emitted by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: Value,
}

/// One backend turn's result.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub response: String,
    pub usage: Usage,
    pub session_id: Option<String>,
    pub stop_reason: StopReason,
    pub tool_uses: Vec<ToolUse>,
}

/// The behavioral contract both subprocess families implement.
///
/// `set_system_prompt` takes effect exactly once, on the first turn of a
/// session; later turns rely on server-side session persistence (Claude) or
/// the thread id (Codex).
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn set_system_prompt(&self, prompt: &str) -> Result<(), AgentError>;

    async fn set_session_id(&self, session_id: &str) -> Result<(), AgentError>;

    async fn prompt(&self, input: PromptInput) -> Result<BackendResponse, AgentError>;

    async fn reset_session(&self) -> Result<(), AgentError>;
}

/// The two production backends as a closed sum, so call sites can hold a
/// concrete type while staying polymorphic over the capability set.
pub enum Backend {
    Claude(ClaudeCliWrapper),
    Codex(CodexAppServerProcess),
}

#[async_trait]
impl AgentBackend for Backend {
    async fn set_system_prompt(&self, prompt: &str) -> Result<(), AgentError> {
        match self {
            Backend::Claude(b) => b.set_system_prompt(prompt).await,
            Backend::Codex(b) => b.set_system_prompt(prompt).await,
        }
    }

    async fn set_session_id(&self, session_id: &str) -> Result<(), AgentError> {
        match self {
            Backend::Claude(b) => b.set_session_id(session_id).await,
            Backend::Codex(b) => b.set_session_id(session_id).await,
        }
    }

    async fn prompt(&self, input: PromptInput) -> Result<BackendResponse, AgentError> {
        match self {
            Backend::Claude(b) => b.prompt(input).await,
            Backend::Codex(b) => b.prompt(input).await,
        }
    }

    async fn reset_session(&self) -> Result<(), AgentError> {
        match self {
            Backend::Claude(b) => b.reset_session().await,
            Backend::Codex(b) => b.reset_session().await,
        }
    }
}

/// Maps a transport-level status to the error taxonomy: 429 is rate limiting,
/// 5xx is retryable API failure, anything else is a terminal API failure.
pub(crate) fn classify_status(status: i64, message: &str) -> AgentError {
    match status {
        429 => AgentError::RateLimit(message.to_string()),
        500..=599 => AgentError::Api {
            message: message.to_string(),
            retryable: true,
        },
        _ => AgentError::Api {
            message: message.to_string(),
            retryable: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_blocks_serialize_with_type_tags() {
        let blocks = vec![
            ContentBlock::Text {
                text: "hi".into(),
            },
            ContentBlock::Image {
                data: "aGk=".into(),
                media_type: "image/png".into(),
            },
            ContentBlock::ToolResult {
                tool_use_id: "t1".into(),
                content: "{}".into(),
                is_error: true,
            },
        ];
        let wire = serde_json::to_value(&blocks).unwrap();
        assert_eq!(wire[0]["type"], "text");
        assert_eq!(wire[1]["type"], "image");
        assert_eq!(wire[1]["media_type"], "image/png");
        assert_eq!(wire[2]["type"], "tool_result");
        assert_eq!(wire[2]["is_error"], true);
    }

    #[test]
    fn usage_accumulates() {
        let mut total = Usage::default();
        total.add(Usage {
            input_tokens: 10,
            output_tokens: 5,
        });
        total.add(Usage {
            input_tokens: 1,
            output_tokens: 2,
        });
        assert_eq!(total.input_tokens, 11);
        assert_eq!(total.output_tokens, 7);
        assert_eq!(total.total(), 18);
    }

    #[test]
    fn status_classification() {
        assert!(matches!(classify_status(429, "slow"), AgentError::RateLimit(_)));
        assert!(classify_status(503, "oops").retryable());
        assert!(!classify_status(400, "bad").retryable());
    }
}
