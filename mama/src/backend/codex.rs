//! Codex app-server backend: JSON-RPC 2.0 frames over stdio with an explicit
//! process state machine.
//!
//! States: `Dead → Starting → Ready → Busy → Ready`. An outstanding
//! `initialize` (60 s timeout) must complete before any `thread.create` or
//! `thread.message`; per-request default timeout is 3 minutes. One automatic
//! restart per failure; a second consecutive failure propagates.

use std::process::Stdio;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::backend::{
    classify_status, AgentBackend, BackendResponse, PromptInput, StopReason, ToolUse, Usage,
};
use crate::error::AgentError;

pub const CODEX_INIT_TIMEOUT: Duration = Duration::from_secs(60);
pub const CODEX_REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

/// Options for the Codex subprocess.
#[derive(Debug, Clone)]
pub struct CodexOptions {
    pub command: String,
    pub args: Vec<String>,
    pub model: Option<String>,
    /// Exported as `CODEX_HOME` for the subprocess when set.
    pub codex_home: Option<std::path::PathBuf>,
    pub init_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for CodexOptions {
    fn default() -> Self {
        Self {
            command: "codex".to_string(),
            args: vec!["app-server".to_string()],
            model: None,
            codex_home: None,
            init_timeout: CODEX_INIT_TIMEOUT,
            request_timeout: CODEX_REQUEST_TIMEOUT,
        }
    }
}

/// Process lifecycle phase, used for observability and re-entry checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessPhase {
    Dead,
    Starting,
    Ready,
    Busy,
}

struct CodexIo {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

struct CodexState {
    phase: ProcessPhase,
    io: Option<CodexIo>,
    system_prompt: Option<String>,
    thread_id: Option<String>,
    next_id: u64,
    /// Set after a restart; cleared by the next success.
    restarted: bool,
}

/// JSON-RPC-over-stdio Codex backend. Requests are serialized through one
/// mutex; the thread id is the session handle carried across prompts.
pub struct CodexAppServerProcess {
    options: CodexOptions,
    state: Mutex<CodexState>,
}

impl CodexAppServerProcess {
    pub fn new(options: CodexOptions) -> Self {
        Self {
            options,
            state: Mutex::new(CodexState {
                phase: ProcessPhase::Dead,
                io: None,
                system_prompt: None,
                thread_id: None,
                next_id: 0,
                restarted: false,
            }),
        }
    }

    pub async fn phase(&self) -> ProcessPhase {
        self.state.lock().await.phase
    }

    fn spawn(&self) -> Result<CodexIo, AgentError> {
        debug!(command = %self.options.command, "spawning codex app server");
        let mut command = tokio::process::Command::new(&self.options.command);
        if let Some(home) = &self.options.codex_home {
            command.env("CODEX_HOME", home);
        }
        let mut child = command
            .args(&self.options.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::Transport(format!("failed to spawn codex: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::Transport("codex stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .map(BufReader::new)
            .ok_or_else(|| AgentError::Transport("codex stdout unavailable".into()))?;
        Ok(CodexIo {
            child,
            stdin,
            stdout,
        })
    }

    /// Sends one request frame and reads until the response with the same id.
    /// Notifications (frames without a matching id) are skipped.
    async fn call(
        state: &mut CodexState,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, AgentError> {
        state.next_id += 1;
        let id = state.next_id;
        let frame = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        let io = state
            .io
            .as_mut()
            .ok_or_else(|| AgentError::Transport("codex process not running".into()))?;

        let line = frame.to_string() + "\n";
        io.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| AgentError::Transport(format!("codex write: {e}")))?;
        io.stdin
            .flush()
            .await
            .map_err(|e| AgentError::Transport(format!("codex flush: {e}")))?;

        let mut buf = String::new();
        loop {
            buf.clear();
            let n = tokio::time::timeout(timeout, io.stdout.read_line(&mut buf))
                .await
                .map_err(|_| AgentError::Transport(format!("codex {method} timed out after {timeout:?}")))?
                .map_err(|e| AgentError::Transport(format!("codex read: {e}")))?;
            if n == 0 {
                return Err(AgentError::Transport("codex closed stdout".into()));
            }
            let Ok(parsed) = serde_json::from_str::<Value>(buf.trim()) else {
                continue;
            };
            if parsed.get("id").and_then(Value::as_u64) != Some(id) {
                continue; // notification or stale frame
            }
            if let Some(error) = parsed.get("error") {
                let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("codex error")
                    .to_string();
                let status = error
                    .get("data")
                    .and_then(|d| d.get("status"))
                    .and_then(Value::as_i64)
                    .unwrap_or(code);
                return Err(classify_status(status, &message));
            }
            return Ok(parsed.get("result").cloned().unwrap_or(Value::Null));
        }
    }

    /// Dead → Starting → Ready, creating a thread when none is attached.
    async fn ensure_ready(&self, state: &mut CodexState) -> Result<(), AgentError> {
        if state.phase == ProcessPhase::Ready && state.io.is_some() {
            return Ok(());
        }
        state.phase = ProcessPhase::Starting;
        state.io = Some(self.spawn()?);
        let init_params = json!({
            "client": { "name": "mama", "version": env!("CARGO_PKG_VERSION") },
            "model": self.options.model,
        });
        Self::call(state, "initialize", init_params, self.options.init_timeout)
            .await
            .map_err(|e| {
                state.phase = ProcessPhase::Dead;
                state.io = None;
                e
            })?;
        if state.thread_id.is_none() {
            let params = match &state.system_prompt {
                Some(prompt) => json!({ "system_prompt": prompt }),
                None => json!({}),
            };
            let created =
                Self::call(state, "thread.create", params, self.options.init_timeout).await?;
            state.thread_id = created
                .get("thread_id")
                .and_then(Value::as_str)
                .map(str::to_string);
        }
        state.phase = ProcessPhase::Ready;
        Ok(())
    }

    fn kill(state: &mut CodexState) {
        if let Some(mut io) = state.io.take() {
            let _ = io.child.start_kill();
        }
        state.phase = ProcessPhase::Dead;
    }

    async fn prompt_once(
        &self,
        state: &mut CodexState,
        input: &PromptInput,
    ) -> Result<BackendResponse, AgentError> {
        self.ensure_ready(state).await?;
        state.phase = ProcessPhase::Busy;
        let params = json!({
            "thread_id": state.thread_id,
            "content": input.to_wire(),
        });
        let result = Self::call(state, "thread.message", params, self.options.request_timeout).await;
        match result {
            Ok(value) => {
                state.phase = ProcessPhase::Ready;
                let usage: Usage = value
                    .get("usage")
                    .cloned()
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default();
                let tool_uses: Vec<ToolUse> = value
                    .get("tool_uses")
                    .cloned()
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default();
                let stop_reason = value
                    .get("stop_reason")
                    .cloned()
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or(if tool_uses.is_empty() {
                        StopReason::EndTurn
                    } else {
                        StopReason::ToolUse
                    });
                Ok(BackendResponse {
                    response: value
                        .get("text")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    usage,
                    session_id: state.thread_id.clone(),
                    stop_reason,
                    tool_uses,
                })
            }
            Err(e) => {
                Self::kill(state);
                Err(e)
            }
        }
    }

    /// Best-effort shutdown verb plus kill.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if state.io.is_some() {
            let _ = Self::call(
                &mut state,
                "shutdown",
                json!({}),
                Duration::from_millis(500),
            )
            .await;
        }
        Self::kill(&mut state);
    }
}

#[async_trait::async_trait]
impl AgentBackend for CodexAppServerProcess {
    async fn set_system_prompt(&self, prompt: &str) -> Result<(), AgentError> {
        let mut state = self.state.lock().await;
        if state.thread_id.is_some() {
            warn!("system prompt after thread creation is ignored");
            return Ok(());
        }
        state.system_prompt = Some(prompt.to_string());
        Ok(())
    }

    async fn set_session_id(&self, session_id: &str) -> Result<(), AgentError> {
        let mut state = self.state.lock().await;
        state.thread_id = Some(session_id.to_string());
        Ok(())
    }

    async fn prompt(&self, input: PromptInput) -> Result<BackendResponse, AgentError> {
        let mut state = self.state.lock().await;
        match self.prompt_once(&mut state, &input).await {
            Ok(response) => {
                state.restarted = false;
                Ok(response)
            }
            Err(first_error) if !state.restarted => {
                warn!(error = %first_error, "codex request failed, restarting once");
                state.restarted = true;
                Self::kill(&mut state);
                let response = self.prompt_once(&mut state, &input).await?;
                state.restarted = false;
                Ok(response)
            }
            Err(e) => {
                Self::kill(&mut state);
                Err(e)
            }
        }
    }

    async fn reset_session(&self) -> Result<(), AgentError> {
        let mut state = self.state.lock().await;
        state.thread_id = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_codex(script: &str) -> CodexAppServerProcess {
        CodexAppServerProcess::new(CodexOptions {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            init_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            ..Default::default()
        })
    }

    /// A canned server: initialize (id 1), thread.create (id 2),
    /// thread.message (id 3).
    const HAPPY_SCRIPT: &str = r#"printf '%s\n' \
        '{"jsonrpc":"2.0","method":"log","params":{"note":"booting"}}' \
        '{"jsonrpc":"2.0","id":1,"result":{}}' \
        '{"jsonrpc":"2.0","id":2,"result":{"thread_id":"th-7"}}' \
        '{"jsonrpc":"2.0","id":3,"result":{"text":"pong","usage":{"input_tokens":4,"output_tokens":2}}}'; cat >/dev/null"#;

    #[tokio::test]
    async fn initialize_then_thread_then_message() {
        let backend = fake_codex(HAPPY_SCRIPT);
        assert_eq!(backend.phase().await, ProcessPhase::Dead);
        backend.set_system_prompt("persona").await.unwrap();

        let response = backend.prompt(PromptInput::Text("ping".into())).await.unwrap();
        assert_eq!(response.response, "pong");
        assert_eq!(response.session_id.as_deref(), Some("th-7"));
        assert_eq!(response.usage.total(), 6);
        assert_eq!(backend.phase().await, ProcessPhase::Ready);
    }

    #[tokio::test]
    async fn attached_thread_skips_thread_create() {
        // With a pre-attached thread, ids are 1 (initialize) and 2 (message).
        let script = r#"printf '%s\n' \
            '{"jsonrpc":"2.0","id":1,"result":{}}' \
            '{"jsonrpc":"2.0","id":2,"result":{"text":"resumed"}}'; cat >/dev/null"#;
        let backend = fake_codex(script);
        backend.set_session_id("th-existing").await.unwrap();
        let response = backend.prompt(PromptInput::Text("hello again".into())).await.unwrap();
        assert_eq!(response.response, "resumed");
        assert_eq!(response.session_id.as_deref(), Some("th-existing"));
    }

    #[tokio::test]
    async fn one_automatic_restart_then_propagate() {
        // Every spawn initializes fine, then fails the message with a 500.
        let script = r#"printf '%s\n' \
            '{"jsonrpc":"2.0","id":1,"result":{}}' \
            '{"jsonrpc":"2.0","id":2,"result":{"thread_id":"t"}}' \
            '{"jsonrpc":"2.0","id":3,"error":{"code":-32000,"message":"boom","data":{"status":500}}}' \
            '{"jsonrpc":"2.0","id":4,"error":{"code":-32000,"message":"boom","data":{"status":500}}}' \
            '{"jsonrpc":"2.0","id":5,"error":{"code":-32000,"message":"boom","data":{"status":500}}}'; cat >/dev/null"#;
        let backend = fake_codex(script);
        let err = backend.prompt(PromptInput::Text("x".into())).await.unwrap_err();
        assert!(matches!(err, AgentError::Api { retryable: true, .. }));
        assert_eq!(backend.phase().await, ProcessPhase::Dead);
    }

    #[tokio::test]
    async fn rate_limit_classification_from_error_code() {
        let script = r#"printf '%s\n' \
            '{"jsonrpc":"2.0","id":1,"result":{}}' \
            '{"jsonrpc":"2.0","id":2,"result":{"thread_id":"t"}}' \
            '{"jsonrpc":"2.0","id":3,"error":{"code":429,"message":"too fast"}}' \
            '{"jsonrpc":"2.0","id":4,"error":{"code":429,"message":"too fast"}}' \
            '{"jsonrpc":"2.0","id":5,"error":{"code":429,"message":"too fast"}}'; cat >/dev/null"#;
        let backend = fake_codex(script);
        let err = backend.prompt(PromptInput::Text("x".into())).await.unwrap_err();
        assert!(matches!(err, AgentError::RateLimit(_)));
    }

    #[tokio::test]
    async fn reset_session_forgets_thread() {
        let backend = fake_codex(HAPPY_SCRIPT);
        backend.set_session_id("th-old").await.unwrap();
        backend.reset_session().await.unwrap();
        // After reset the next prompt creates a fresh thread (id 2 frame).
        let response = backend.prompt(PromptInput::Text("ping".into())).await.unwrap();
        assert_eq!(response.session_id.as_deref(), Some("th-7"));
    }
}
