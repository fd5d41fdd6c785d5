//! Scripted backend for tests: fixed responses in order, recorded prompts.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::backend::{
    AgentBackend, BackendResponse, PromptInput, StopReason, ToolUse, Usage,
};
use crate::error::AgentError;

/// Test backend: pops one scripted response per prompt and records what it
/// was asked. With an empty script it echoes the input.
#[derive(Default)]
pub struct MockBackend {
    script: Mutex<VecDeque<Result<BackendResponse, AgentError>>>,
    prompts: Mutex<Vec<String>>,
    system_prompt: Mutex<Option<String>>,
    session_id: Mutex<Option<String>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a plain end-turn response.
    pub fn push_text(&self, text: &str, input_tokens: u64, output_tokens: u64) {
        self.script.lock().unwrap().push_back(Ok(BackendResponse {
            response: text.to_string(),
            usage: Usage {
                input_tokens,
                output_tokens,
            },
            session_id: Some("mock-session".to_string()),
            stop_reason: StopReason::EndTurn,
            tool_uses: Vec::new(),
        }));
    }

    /// Queues a tool-use response.
    pub fn push_tool_use(&self, name: &str, input: serde_json::Value) {
        self.script.lock().unwrap().push_back(Ok(BackendResponse {
            response: String::new(),
            usage: Usage {
                input_tokens: 1,
                output_tokens: 1,
            },
            session_id: Some("mock-session".to_string()),
            stop_reason: StopReason::ToolUse,
            tool_uses: vec![ToolUse {
                id: format!("tu-{name}"),
                name: name.to_string(),
                input,
            }],
        }));
    }

    pub fn push_error(&self, error: AgentError) {
        self.script.lock().unwrap().push_back(Err(error));
    }

    /// Prompts seen so far, rendered to strings.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn system_prompt(&self) -> Option<String> {
        self.system_prompt.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentBackend for MockBackend {
    async fn set_system_prompt(&self, prompt: &str) -> Result<(), AgentError> {
        *self.system_prompt.lock().unwrap() = Some(prompt.to_string());
        Ok(())
    }

    async fn set_session_id(&self, session_id: &str) -> Result<(), AgentError> {
        *self.session_id.lock().unwrap() = Some(session_id.to_string());
        Ok(())
    }

    async fn prompt(&self, input: PromptInput) -> Result<BackendResponse, AgentError> {
        let rendered = match &input {
            PromptInput::Text(text) => text.clone(),
            PromptInput::Blocks(_) => input.to_wire().to_string(),
        };
        self.prompts.lock().unwrap().push(rendered.clone());
        match self.script.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(BackendResponse {
                response: format!("echo: {rendered}"),
                usage: Usage {
                    input_tokens: 1,
                    output_tokens: 1,
                },
                session_id: Some("mock-session".to_string()),
                stop_reason: StopReason::EndTurn,
                tool_uses: Vec::new(),
            }),
        }
    }

    async fn reset_session(&self) -> Result<(), AgentError> {
        *self.session_id.lock().unwrap() = None;
        Ok(())
    }
}
