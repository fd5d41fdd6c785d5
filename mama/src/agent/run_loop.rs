//! The agent loop: one inbound message in, one finished turn out.
//!
//! A run is serialized through the lane for its channel key, so two messages
//! in the same conversation can never interleave; distinct conversations run
//! in parallel. Inside a run the loop feeds the backend, dispatches tool use
//! through the gateway executor, and keeps the session's token account.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::backend::{
    AgentBackend, BackendPool, ContentBlock, PromptInput, StopReason, ToolUse, Usage,
};
use crate::error::AgentError;
use crate::gateway::{AgentContext, GatewayToolExecutor};
use crate::hooks::{is_edit_tool, PostToolHandler, PreCompactHandler};
use crate::memory::MemoryLogger;
use crate::prompt::{ContentDeduplicator, PromptEnhancer, RuleContext};
use crate::session::{ChannelKey, LaneManager, SessionPool};
use crate::stream::StreamingCallbackManager;

#[derive(Debug, Clone)]
pub struct AgentLoopConfig {
    pub max_turns: usize,
    /// Workspace scanned for AGENTS.md and rules.
    pub workspace: PathBuf,
    /// Persona injected as the backend system prompt on new sessions.
    pub system_prompt: Option<String>,
    /// Capability tier ("1".."3") matched against rule frontmatter.
    pub tier: Option<String>,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self {
            max_turns: 24,
            workspace: std::env::temp_dir(),
            system_prompt: None,
            tier: None,
        }
    }
}

/// Result of one completed run.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub response: String,
    pub turns: usize,
    /// One line per model response and tool result, oldest first.
    pub history: Vec<String>,
    pub total_usage: Usage,
    pub stop_reason: StopReason,
}

/// Turn orchestrator. Clone-cheap; all collaborators are shared.
#[derive(Clone)]
pub struct AgentLoop {
    backends: Arc<BackendPool>,
    executor: Arc<GatewayToolExecutor>,
    sessions: Arc<SessionPool>,
    lanes: Arc<LaneManager>,
    enhancer: Arc<PromptEnhancer>,
    precompact: Arc<PreCompactHandler>,
    posttool: Arc<PostToolHandler>,
    memory_logger: Option<Arc<MemoryLogger>>,
    config: AgentLoopConfig,
}

impl AgentLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backends: Arc<BackendPool>,
        executor: Arc<GatewayToolExecutor>,
        sessions: Arc<SessionPool>,
        lanes: Arc<LaneManager>,
        enhancer: Arc<PromptEnhancer>,
        precompact: Arc<PreCompactHandler>,
        posttool: Arc<PostToolHandler>,
        memory_logger: Option<Arc<MemoryLogger>>,
        config: AgentLoopConfig,
    ) -> Self {
        Self {
            backends,
            executor,
            sessions,
            lanes,
            enhancer,
            precompact,
            posttool,
            memory_logger,
            config,
        }
    }

    /// Runs one turn for `ctx` on the lane of `key`. Serialized per key.
    pub async fn run(
        &self,
        ctx: AgentContext,
        key: ChannelKey,
        input: PromptInput,
        streaming: Option<Arc<StreamingCallbackManager>>,
    ) -> Result<TurnOutcome, AgentError> {
        let this = self.clone();
        let lane_key = key.clone();
        let handle = self.lanes.enqueue(&lane_key, move || async move {
            this.run_inner(ctx, key, input, streaming).await
        });
        handle
            .join()
            .await
            .unwrap_or_else(|| Err(AgentError::Validation("run cancelled before start".into())))
    }

    async fn run_inner(
        &self,
        ctx: AgentContext,
        key: ChannelKey,
        input: PromptInput,
        streaming: Option<Arc<StreamingCallbackManager>>,
    ) -> Result<TurnOutcome, AgentError> {
        if let Some(stream) = &streaming {
            stream.start("…").await;
        }
        let result = self.drive_turns(&ctx, &key, input, streaming.as_deref()).await;
        match &result {
            Ok(outcome) => {
                if let Some(stream) = &streaming {
                    stream.finish().await;
                }
                if let Some(logger) = &self.memory_logger {
                    let user_text = ctx
                        .session
                        .user_name
                        .as_deref()
                        .or(ctx.session.user.as_deref())
                        .unwrap_or("user");
                    logger.log_conversation(
                        ctx.session.channel.as_deref().unwrap_or("default"),
                        user_text,
                        outcome.history.first().map(String::as_str).unwrap_or(""),
                        &outcome.response,
                    );
                }
            }
            Err(e) => {
                if let Some(stream) = &streaming {
                    stream.on_error(e).await;
                }
            }
        }
        result
    }

    async fn drive_turns(
        &self,
        ctx: &AgentContext,
        key: &ChannelKey,
        input: PromptInput,
        streaming: Option<&StreamingCallbackManager>,
    ) -> Result<TurnOutcome, AgentError> {
        let backend: Arc<dyn AgentBackend> = self.backends.for_key(&key.to_string());
        let session = self.sessions.get_session(key);
        if session.is_new {
            if let Some(system_prompt) = &self.config.system_prompt {
                backend.set_system_prompt(system_prompt).await?;
            }
        } else {
            backend.set_session_id(&session.session_id).await?;
        }

        let first_input = self.assemble_first_input(ctx, input);
        let mut current_input = first_input;
        let mut history: Vec<String> = Vec::new();
        let mut total_usage = Usage::default();
        let mut turns = 0usize;
        let mut final_response = String::new();

        loop {
            let response = backend.prompt(current_input).await?;
            turns += 1;
            total_usage.add(response.usage);

            if let Some(session_id) = &response.session_id {
                self.sessions.attach_session_id(key, session_id);
            }
            if !response.response.is_empty() {
                history.push(response.response.clone());
                if let Some(stream) = streaming {
                    stream.on_delta(&response.response).await;
                }
                final_response = response.response.clone();
            }

            let report =
                self.sessions
                    .update_tokens(key, response.usage.input_tokens, response.usage.output_tokens);
            if report.near_threshold {
                self.handle_near_threshold(&history, streaming).await;
            }

            match response.stop_reason {
                StopReason::ToolUse if !response.tool_uses.is_empty() => {
                    if turns >= self.config.max_turns {
                        info!(turns, "max turns reached mid tool-use");
                        return Ok(TurnOutcome {
                            response: final_response,
                            turns,
                            history,
                            total_usage,
                            stop_reason: StopReason::MaxTurns,
                        });
                    }
                    let results = self
                        .dispatch_tools(ctx, &response.tool_uses, &mut history, streaming)
                        .await;
                    current_input = PromptInput::Blocks(results);
                }
                StopReason::ToolUse => {
                    // Tool-use stop with no invocations: treat as a finished turn.
                    return Ok(TurnOutcome {
                        response: final_response,
                        turns,
                        history,
                        total_usage,
                        stop_reason: StopReason::EndTurn,
                    });
                }
                reason => {
                    return Ok(TurnOutcome {
                        response: final_response,
                        turns,
                        history,
                        total_usage,
                        stop_reason: reason,
                    });
                }
            }

            if turns >= self.config.max_turns {
                return Ok(TurnOutcome {
                    response: final_response,
                    turns,
                    history,
                    total_usage,
                    stop_reason: StopReason::MaxTurns,
                });
            }
        }
    }

    /// Context preamble + keyword instructions + rules + AGENTS.md + user
    /// content, deduplicated per turn.
    fn assemble_first_input(&self, ctx: &AgentContext, input: PromptInput) -> PromptInput {
        let user_text = match &input {
            PromptInput::Text(text) => text.clone(),
            PromptInput::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        };
        let rule_ctx = RuleContext {
            agent_id: Some(ctx.role_name.clone()),
            tier: self.config.tier.clone(),
            channel: ctx.session.channel.clone(),
            keywords: Vec::new(),
        };
        let enhancement = self
            .enhancer
            .enhance(&user_text, &self.config.workspace, Some(&rule_ctx));

        // Fresh deduplicator per run: injected sections must not repeat even
        // when discovery surfaces the same file twice.
        let mut dedup = ContentDeduplicator::new();
        if !enhancement.keyword_instructions.is_empty() {
            dedup.add("keyword-instructions", &enhancement.keyword_instructions, 0.0);
        }
        if let Some(rules) = &enhancement.rules_content {
            dedup.add("rules", rules, 1.0);
        }
        if let Some(agents) = &enhancement.agents_content {
            dedup.add("agents-md", agents, 2.0);
        }

        let mut preamble = crate::gateway::build_context_prompt(ctx);
        for entry in dedup.entries() {
            preamble.push_str("\n---\n");
            preamble.push_str(&entry.content);
        }
        preamble.push_str("\n---\n");

        match input {
            PromptInput::Text(text) => PromptInput::Text(format!("{preamble}{text}")),
            PromptInput::Blocks(mut blocks) => {
                blocks.insert(
                    0,
                    ContentBlock::Text {
                        text: preamble,
                    },
                );
                PromptInput::Blocks(blocks)
            }
        }
    }

    async fn dispatch_tools(
        &self,
        ctx: &AgentContext,
        tool_uses: &[ToolUse],
        history: &mut Vec<String>,
        streaming: Option<&StreamingCallbackManager>,
    ) -> Vec<ContentBlock> {
        let mut results = Vec::with_capacity(tool_uses.len());
        for tool_use in tool_uses {
            if let Some(stream) = streaming {
                stream.on_tool_use(&tool_use.name).await;
            }
            let (content, is_error) = match self
                .executor
                .execute(&tool_use.name, tool_use.input.clone(), ctx)
                .await
            {
                Ok(outcome) => {
                    if outcome.success && is_edit_tool(&tool_use.name) {
                        if let Some(path) = edited_path(&tool_use.input) {
                            self.posttool.process_in_background(&tool_use.name, &path);
                        }
                    }
                    (outcome.to_model_text(), !outcome.success)
                }
                // Typed executor errors become error tool results; the turn
                // continues.
                Err(e) => (
                    serde_json::json!({"success": false, "error": e.to_string()}).to_string(),
                    true,
                ),
            };
            history.push(format!("[tool {}] {}", tool_use.name, content));
            results.push(ContentBlock::ToolResult {
                tool_use_id: tool_use.id.clone(),
                content,
                is_error,
            });
        }
        results
    }

    async fn handle_near_threshold(
        &self,
        history: &[String],
        streaming: Option<&StreamingCallbackManager>,
    ) {
        debug!("session near token threshold, running pre-compact check");
        let report = self.precompact.process(history).await;
        if let Some(warning) = &report.warning_message {
            warn!(%warning, "unsaved decisions before compaction");
            if let Some(stream) = streaming {
                stream.on_tool_use("pre_compact_warning").await;
            }
        }
    }
}

fn edited_path(input: &Value) -> Option<String> {
    input
        .get("file_path")
        .or_else(|| input.get("path"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::gateway::{
        context_for_source, GatewayToolExecutor, RoleManager, SessionMeta,
    };
    use crate::hooks::{PostToolConfig, PreCompactConfig};
    use crate::memory::MockMemoryApi;
    use crate::session::SessionPoolConfig;
    use serde_json::json;

    struct Fixture {
        backend: Arc<MockBackend>,
        memory: Arc<MockMemoryApi>,
        agent: AgentLoop,
        workspace: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        fixture_with(SessionPoolConfig::default())
    }

    fn fixture_with(pool_config: SessionPoolConfig) -> Fixture {
        let workspace = tempfile::tempdir().unwrap();
        let backend = Arc::new(MockBackend::new());
        let memory = Arc::new(MockMemoryApi::new());
        let roles = Arc::new(RoleManager::permissive());
        let executor = Arc::new(GatewayToolExecutor::new(
            roles,
            memory.clone(),
            workspace.path(),
        ));
        let agent = AgentLoop::new(
            Arc::new(BackendPool::single(backend.clone())),
            executor,
            Arc::new(SessionPool::new(pool_config)),
            Arc::new(LaneManager::new()),
            Arc::new(PromptEnhancer::new()),
            Arc::new(PreCompactHandler::new(
                memory.clone(),
                PreCompactConfig::default(),
            )),
            Arc::new(PostToolHandler::new(
                memory.clone(),
                PostToolConfig::default(),
            )),
            None,
            AgentLoopConfig {
                max_turns: 4,
                workspace: workspace.path().to_path_buf(),
                system_prompt: Some("you are mama".to_string()),
                tier: None,
            },
        );
        Fixture {
            backend,
            memory,
            agent,
            workspace,
        }
    }

    fn ctx() -> AgentContext {
        context_for_source(
            &RoleManager::permissive(),
            "discord",
            SessionMeta {
                session_id: "s-1".into(),
                channel: Some("general".into()),
                user: Some("u1".into()),
                user_name: None,
            },
        )
    }

    fn key() -> ChannelKey {
        ChannelKey::new("discord", Some("g"), Some("c"), Some("u"))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn plain_turn_returns_response_and_usage() {
        let fx = fixture();
        fx.backend.push_text("hello from the agent", 12, 8);

        let outcome = fx
            .agent
            .run(ctx(), key(), PromptInput::Text("hi".into()), None)
            .await
            .unwrap();
        assert_eq!(outcome.response, "hello from the agent");
        assert_eq!(outcome.turns, 1);
        assert_eq!(outcome.stop_reason, StopReason::EndTurn);
        assert_eq!(outcome.total_usage.total(), 20);

        // System prompt was injected for the new session.
        assert_eq!(fx.backend.system_prompt().as_deref(), Some("you are mama"));
        // The turn prompt carries the context preamble and the user text.
        let prompts = fx.backend.prompts();
        assert!(prompts[0].contains("## Current Agent Context"));
        assert!(prompts[0].ends_with("hi"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tool_use_round_trip_feeds_result_back() {
        let fx = fixture();
        std::fs::write(fx.workspace.path().join("notes.txt"), "remember me\n").unwrap();
        fx.backend
            .push_tool_use("Read", json!({"file_path": "notes.txt"}));
        fx.backend.push_text("done reading", 5, 5);

        let outcome = fx
            .agent
            .run(ctx(), key(), PromptInput::Text("read notes".into()), None)
            .await
            .unwrap();
        assert_eq!(outcome.response, "done reading");
        assert_eq!(outcome.turns, 2);

        // Second prompt to the backend is the tool_result block.
        let prompts = fx.backend.prompts();
        assert!(prompts[1].contains("tool_result"));
        assert!(prompts[1].contains("remember me"));
        assert!(outcome.history.iter().any(|h| h.contains("[tool Read]")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_tool_becomes_error_result_and_turn_continues() {
        let fx = fixture();
        fx.backend.push_tool_use("no_such_tool", json!({}));
        fx.backend.push_text("recovered", 1, 1);

        let outcome = fx
            .agent
            .run(ctx(), key(), PromptInput::Text("try it".into()), None)
            .await
            .unwrap();
        assert_eq!(outcome.response, "recovered");
        let prompts = fx.backend.prompts();
        assert!(prompts[1].contains("is_error"));
        assert!(prompts[1].contains("unknown tool"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn max_turns_caps_tool_loops() {
        let fx = fixture();
        for _ in 0..6 {
            fx.backend.push_tool_use("Glob", json!({"pattern": "*.rs"}));
        }
        let outcome = fx
            .agent
            .run(ctx(), key(), PromptInput::Text("loop forever".into()), None)
            .await
            .unwrap();
        assert_eq!(outcome.stop_reason, StopReason::MaxTurns);
        assert_eq!(outcome.turns, 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn successful_edit_tools_feed_posttool_worker() {
        let fx = fixture();
        let file = fx.workspace.path().join("routes.js");
        std::fs::write(&file, "app.get('/users', h);\n").unwrap();
        fx.backend.push_tool_use(
            "Write",
            json!({"file_path": file.to_str().unwrap(), "content": "app.get('/users', h);\n"}),
        );
        fx.backend.push_text("written", 1, 1);

        fx.agent
            .run(ctx(), key(), PromptInput::Text("write it".into()), None)
            .await
            .unwrap();
        fx.agent.posttool.wait_idle().await;
        assert!(fx
            .memory
            .items()
            .iter()
            .any(|i| i.topic == "API: GET /users"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn near_threshold_triggers_precompact() {
        let fx = fixture_with(SessionPoolConfig {
            token_threshold: 10,
            ..Default::default()
        });
        fx.backend
            .push_text("decided: migrate the queue to postgres", 20, 20);

        let outcome = fx
            .agent
            .run(ctx(), key(), PromptInput::Text("hi".into()), None)
            .await
            .unwrap();
        // The turn still completes; the warning lands in the logs.
        assert_eq!(outcome.stop_reason, StopReason::EndTurn);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn multimodal_blocks_pass_through() {
        let fx = fixture();
        fx.backend.push_text("I see the image", 3, 3);
        let blocks = vec![
            ContentBlock::Text {
                text: "what is this?".into(),
            },
            ContentBlock::Image {
                data: "aGVsbG8=".into(),
                media_type: "image/png".into(),
            },
        ];
        let outcome = fx
            .agent
            .run(ctx(), key(), PromptInput::Blocks(blocks), None)
            .await
            .unwrap();
        assert_eq!(outcome.response, "I see the image");
        let prompts = fx.backend.prompts();
        assert!(prompts[0].contains("image/png"));
        assert!(prompts[0].contains("aGVsbG8="));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn backend_errors_propagate() {
        let fx = fixture();
        fx.backend
            .push_error(AgentError::RateLimit("too many requests".into()));
        let err = fx
            .agent
            .run(ctx(), key(), PromptInput::Text("hi".into()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::RateLimit(_)));
    }
}
