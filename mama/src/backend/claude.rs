//! Claude CLI backend: argv construction plus a persistent subprocess with
//! newline-delimited JSON framing on stdio.
//!
//! Request frames are one JSON object per line: `{"prompt": <string|blocks>}`.
//! The process answers with one JSON object per line; non-JSON lines are
//! treated as log noise and skipped. A successful frame carries `result`,
//! `usage`, `session_id`, and optionally `stop_reason`/`tool_uses`; a failure
//! frame carries `error: {status, message}`.
//!
//! Agents run from `$HOME`: the builder never emits `--add-dir`.

use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::backend::{
    classify_status, AgentBackend, BackendResponse, PromptInput, StopReason, ToolUse, Usage,
};
use crate::error::AgentError;

/// Options for the Claude CLI subprocess.
#[derive(Debug, Clone)]
pub struct ClaudeCliOptions {
    /// Executable name or path.
    pub command: String,
    /// Arguments placed before the generated flags (e.g. a subcommand).
    pub base_args: Vec<String>,
    pub model: Option<String>,
    /// Emitted as `--allowedTools <names…>` iff non-empty.
    pub allowed_tools: Vec<String>,
    /// Emitted as `--disallowedTools <names…>` iff non-empty.
    pub disallowed_tools: Vec<String>,
    pub request_timeout: Duration,
}

impl Default for ClaudeCliOptions {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            base_args: Vec::new(),
            model: None,
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            request_timeout: Duration::from_secs(300),
        }
    }
}

/// Builds the argv for one process spawn. Tool flag arrays are passed as
/// space-separated arguments after the flag; `--system-prompt` appears only on
/// a session's first spawn.
pub fn build_claude_args(
    options: &ClaudeCliOptions,
    system_prompt: Option<&str>,
    session_id: Option<&str>,
) -> Vec<String> {
    let mut args = options.base_args.clone();
    if let Some(model) = &options.model {
        args.push("--model".to_string());
        args.push(model.clone());
    }
    if let Some(prompt) = system_prompt {
        args.push("--system-prompt".to_string());
        args.push(prompt.to_string());
    }
    if let Some(id) = session_id {
        args.push("--session-id".to_string());
        args.push(id.to_string());
    }
    if !options.allowed_tools.is_empty() {
        args.push("--allowedTools".to_string());
        args.extend(options.allowed_tools.iter().cloned());
    }
    if !options.disallowed_tools.is_empty() {
        args.push("--disallowedTools".to_string());
        args.extend(options.disallowed_tools.iter().cloned());
    }
    args
}

struct ProcessHandle {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

struct ClaudeState {
    system_prompt: Option<String>,
    session_id: Option<String>,
    turns: u64,
    process: Option<ProcessHandle>,
}

/// Long-lived Claude CLI wrapper. Requests on one wrapper are serialized; the
/// pool gives each channel key its own wrapper.
pub struct ClaudeCliWrapper {
    options: ClaudeCliOptions,
    state: Mutex<ClaudeState>,
}

impl ClaudeCliWrapper {
    pub fn new(options: ClaudeCliOptions) -> Self {
        Self {
            options,
            state: Mutex::new(ClaudeState {
                system_prompt: None,
                session_id: None,
                turns: 0,
                process: None,
            }),
        }
    }

    fn spawn(&self, state: &ClaudeState) -> Result<ProcessHandle, AgentError> {
        // System prompt only on the first turn; afterwards the server-side
        // session carries it.
        let system_prompt = (state.turns == 0).then_some(state.system_prompt.as_deref()).flatten();
        let args = build_claude_args(&self.options, system_prompt, state.session_id.as_deref());
        debug!(command = %self.options.command, "spawning claude cli");
        let mut child = tokio::process::Command::new(&self.options.command)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::Transport(format!("failed to spawn claude cli: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::Transport("claude cli stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .map(BufReader::new)
            .ok_or_else(|| AgentError::Transport("claude cli stdout unavailable".into()))?;
        Ok(ProcessHandle {
            child,
            stdin,
            stdout,
        })
    }

    async fn send_and_receive(
        &self,
        process: &mut ProcessHandle,
        request: &str,
    ) -> Result<Value, AgentError> {
        process
            .stdin
            .write_all(request.as_bytes())
            .await
            .map_err(|e| AgentError::Transport(format!("claude cli write: {e}")))?;
        process
            .stdin
            .flush()
            .await
            .map_err(|e| AgentError::Transport(format!("claude cli flush: {e}")))?;

        let mut line = String::new();
        loop {
            line.clear();
            let n = tokio::time::timeout(
                self.options.request_timeout,
                process.stdout.read_line(&mut line),
            )
            .await
            .map_err(|_| {
                AgentError::Transport(format!(
                    "claude cli timed out after {:?}",
                    self.options.request_timeout
                ))
            })?
            .map_err(|e| AgentError::Transport(format!("claude cli read: {e}")))?;
            if n == 0 {
                return Err(AgentError::Transport("claude cli closed stdout".into()));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(frame) if frame.get("result").is_some() || frame.get("error").is_some() => {
                    return Ok(frame);
                }
                // Log noise on stdout: skip until a frame arrives.
                _ => continue,
            }
        }
    }

    async fn request_once(
        &self,
        state: &mut ClaudeState,
        request: &str,
    ) -> Result<Value, AgentError> {
        if state.process.is_none() {
            state.process = Some(self.spawn(state)?);
        }
        let process = state.process.as_mut().unwrap();
        let result = self.send_and_receive(process, request).await;
        if result.is_err() {
            // Dead or wedged process: drop it so the retry path respawns.
            if let Some(mut dead) = state.process.take() {
                let _ = dead.child.start_kill();
            }
        }
        result
    }

    fn parse_frame(state: &mut ClaudeState, frame: Value) -> Result<BackendResponse, AgentError> {
        if let Some(error) = frame.get("error") {
            let status = error.get("status").and_then(Value::as_i64).unwrap_or(0);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("claude cli error")
                .to_string();
            return Err(classify_status(status, &message));
        }
        let response = frame
            .get("result")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let usage: Usage = frame
            .get("usage")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        let session_id = frame
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(id) = &session_id {
            state.session_id = Some(id.clone());
        }
        let tool_uses: Vec<ToolUse> = frame
            .get("tool_uses")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        let stop_reason = frame
            .get("stop_reason")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or(if tool_uses.is_empty() {
                StopReason::EndTurn
            } else {
                StopReason::ToolUse
            });
        state.turns += 1;
        Ok(BackendResponse {
            response,
            usage,
            session_id: state.session_id.clone(),
            stop_reason,
            tool_uses,
        })
    }
}

#[async_trait::async_trait]
impl AgentBackend for ClaudeCliWrapper {
    async fn set_system_prompt(&self, prompt: &str) -> Result<(), AgentError> {
        let mut state = self.state.lock().await;
        if state.turns > 0 {
            warn!("system prompt after first turn is ignored; session already carries it");
            return Ok(());
        }
        state.system_prompt = Some(prompt.to_string());
        Ok(())
    }

    async fn set_session_id(&self, session_id: &str) -> Result<(), AgentError> {
        let mut state = self.state.lock().await;
        state.session_id = Some(session_id.to_string());
        Ok(())
    }

    async fn prompt(&self, input: PromptInput) -> Result<BackendResponse, AgentError> {
        let mut state = self.state.lock().await;
        let request = serde_json::json!({ "prompt": input.to_wire() }).to_string() + "\n";

        let frame = match self.request_once(&mut state, &request).await {
            Ok(frame) => frame,
            Err(first_error) => {
                // One pool recreation, then surface the failure.
                warn!(error = %first_error, "claude cli request failed, recreating process");
                self.request_once(&mut state, &request).await?
            }
        };
        Self::parse_frame(&mut state, frame)
    }

    async fn reset_session(&self) -> Result<(), AgentError> {
        let mut state = self.state.lock().await;
        if let Some(mut process) = state.process.take() {
            let _ = process.child.start_kill();
        }
        state.session_id = None;
        state.turns = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_flags_emitted_iff_non_empty() {
        let mut options = ClaudeCliOptions {
            model: Some("m1".into()),
            ..Default::default()
        };
        let args = build_claude_args(&options, Some("be helpful"), Some("s-1"));
        assert_eq!(
            args,
            vec![
                "--model",
                "m1",
                "--system-prompt",
                "be helpful",
                "--session-id",
                "s-1"
            ]
        );
        assert!(!args.iter().any(|a| a == "--allowedTools"));
        assert!(!args.iter().any(|a| a == "--add-dir"));

        options.allowed_tools = vec!["Read".into(), "Grep".into()];
        options.disallowed_tools = vec!["Bash".into()];
        let args = build_claude_args(&options, None, None);
        let allowed_at = args.iter().position(|a| a == "--allowedTools").unwrap();
        assert_eq!(&args[allowed_at + 1..allowed_at + 3], ["Read", "Grep"]);
        let disallowed_at = args.iter().position(|a| a == "--disallowedTools").unwrap();
        assert_eq!(args[disallowed_at + 1], "Bash");
        assert!(!args.iter().any(|a| a == "--system-prompt"));
    }

    fn fake_cli(script: &str) -> ClaudeCliWrapper {
        ClaudeCliWrapper::new(ClaudeCliOptions {
            command: "sh".to_string(),
            base_args: vec!["-c".to_string(), script.to_string()],
            request_timeout: Duration::from_secs(5),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn prompt_round_trip_through_fake_process() {
        let script = r#"printf '%s\n' 'starting up' \
            '{"result":"hello there","usage":{"input_tokens":7,"output_tokens":3},"session_id":"sess-9"}'; cat >/dev/null"#;
        let backend = fake_cli(script);
        backend.set_system_prompt("persona").await.unwrap();

        let response = backend.prompt(PromptInput::Text("hi".into())).await.unwrap();
        assert_eq!(response.response, "hello there");
        assert_eq!(response.usage.input_tokens, 7);
        assert_eq!(response.session_id.as_deref(), Some("sess-9"));
        assert_eq!(response.stop_reason, StopReason::EndTurn);
    }

    #[tokio::test]
    async fn tool_use_frames_surface_invocations() {
        let script = r#"printf '%s\n' '{"result":"","stop_reason":"tool_use","tool_uses":[{"id":"t1","name":"Read","input":{"file_path":"x"}}]}'; cat >/dev/null"#;
        let backend = fake_cli(script);
        let response = backend.prompt(PromptInput::Text("read x".into())).await.unwrap();
        assert_eq!(response.stop_reason, StopReason::ToolUse);
        assert_eq!(response.tool_uses.len(), 1);
        assert_eq!(response.tool_uses[0].name, "Read");
    }

    #[tokio::test]
    async fn error_frames_classify() {
        let rate_limited = fake_cli(
            r#"printf '%s\n' '{"error":{"status":429,"message":"slow down"}}'; cat >/dev/null"#,
        );
        // An error frame is a delivered response, so no respawn happens.
        let err = rate_limited
            .prompt(PromptInput::Text("hi".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::RateLimit(_)));

        let server_error = fake_cli(
            r#"printf '%s\n' '{"error":{"status":503,"message":"upstream"}}'; cat >/dev/null"#,
        );
        let err = server_error
            .prompt(PromptInput::Text("hi".into()))
            .await
            .unwrap_err();
        assert!(err.retryable());
    }

    #[tokio::test]
    async fn crashed_process_is_recreated_once() {
        // First spawn exits immediately; the retry gets a working process.
        // A marker file distinguishes the first spawn from the second.
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("spawned-once");
        let script = format!(
            r#"if [ -f {m} ]; then printf '%s\n' '{{"result":"recovered","usage":{{"input_tokens":1,"output_tokens":1}}}}'; cat >/dev/null; else touch {m}; fi"#,
            m = marker.display()
        );
        let backend = fake_cli(&script);
        let response = backend.prompt(PromptInput::Text("hi".into())).await.unwrap();
        assert_eq!(response.response, "recovered");
    }
}
