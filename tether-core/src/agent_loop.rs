//! Agent Run Engine
//!
//! One run: prompt → provider → if tool calls, wait for approvals, execute
//! the approved tools, record the results → repeat until the model answers
//! without tool calls, the run is cancelled, or the provider fails.
//!
//! Each run executes in its own tokio task. The caller drives it through a
//! bounded command queue and observes it through a bounded event queue; the
//! event queue closes right after the run's single terminal event.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::approval::{collect_approvals, discard_stale_commands, PendingBatch};
use crate::context::{BudgetParams, ContextWindow};
use crate::error::{ApprovalAborted, ToolTimeout};
use crate::ids::{RunId, SessionId};
use crate::normalize::MERGE_SEPARATOR;
use crate::protocol::{
    ProposedToolCall, RunCommand, RunEvent, COMMAND_QUEUE_CAPACITY, EVENT_QUEUE_CAPACITY,
};
use crate::provider::ProviderRouter;
use crate::tool::{ToolContext, ToolExecutor};
use crate::types::{ChatResponse, Message, SamplingConfig, ToolCall, ToolDefinition, ToolResult};

pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// Tool name carried by a merged batch result.
pub const MERGED_RESULT_NAME: &str = "batch_tool_results";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// How a batch's tool results are written to the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolResultMode {
    /// One tool message per call.
    #[default]
    Separate,
    /// One combined tool message when a batch has more than one result.
    Merged,
}

/// Per-engine run settings.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub context_size: usize,
    pub model: String,
    pub sampling: SamplingConfig,
    /// Whether the backend accepts the `tool` role.
    pub use_tool_role: bool,
    pub tool_result_mode: ToolResultMode,
    pub tool_timeout: Duration,
    pub agent_name: Option<String>,
    pub session_id: Option<SessionId>,
    pub working_dir: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            context_size: 4096,
            model: "default".to_string(),
            sampling: SamplingConfig::default(),
            use_tool_role: true,
            tool_result_mode: ToolResultMode::default(),
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            agent_name: None,
            session_id: None,
            working_dir: PathBuf::from("."),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Starts runs against one provider router and tool executor.
pub struct AgentEngine {
    router: Arc<ProviderRouter>,
    tools: Arc<dyn ToolExecutor>,
    config: RunConfig,
}

impl AgentEngine {
    pub fn new(router: Arc<ProviderRouter>, tools: Arc<dyn ToolExecutor>, config: RunConfig) -> Self {
        Self {
            router,
            tools,
            config,
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Start a run on a fresh task.
    ///
    /// An empty `prompt` resumes the session: the provider is called with
    /// the loaded history and no new user message. The caller must drain
    /// `events` until it closes, or drop it to stop the run.
    pub fn start(&self, prompt: impl Into<String>, window: ContextWindow) -> RunHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        let worker = RunWorker {
            run_id: RunId::new(),
            router: self.router.clone(),
            tools: self.tools.clone(),
            tool_ctx: ToolContext::new(self.config.working_dir.clone()),
            config: self.config.clone(),
            definitions: Vec::new(),
            window,
            commands: command_rx,
            events: event_tx,
        };
        let run_id = worker.run_id.clone();
        let prompt = prompt.into();
        let task = tokio::spawn(worker.run(prompt));

        RunHandle {
            run_id,
            commands: command_tx,
            events: event_rx,
            task,
        }
    }
}

/// Caller's side of one run.
pub struct RunHandle {
    pub run_id: RunId,
    pub commands: mpsc::Sender<RunCommand>,
    pub events: mpsc::Receiver<RunEvent>,
    pub task: JoinHandle<()>,
}

impl RunHandle {
    /// Queue a command. Fails only once the run has finished.
    pub async fn send(&self, cmd: RunCommand) -> Result<()> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| anyhow!("run {} is no longer accepting commands", self.run_id))
    }

    /// Next event, or `None` after the terminal event.
    pub async fn next_event(&mut self) -> Option<RunEvent> {
        self.events.recv().await
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// The event receiver was dropped; nobody is listening any more.
struct ReceiverGone;

struct RunWorker {
    run_id: RunId,
    router: Arc<ProviderRouter>,
    tools: Arc<dyn ToolExecutor>,
    tool_ctx: ToolContext,
    config: RunConfig,
    definitions: Vec<ToolDefinition>,
    window: ContextWindow,
    commands: mpsc::Receiver<RunCommand>,
    events: mpsc::Sender<RunEvent>,
}

impl RunWorker {
    async fn run(mut self, prompt: String) {
        if self.drive(prompt).await.is_err() {
            debug!(run_id = %self.run_id, "event receiver dropped, stopping run");
        }
        self.window.complete_run();
    }

    async fn emit(&self, event: RunEvent) -> Result<(), ReceiverGone> {
        self.events.send(event).await.map_err(|_| ReceiverGone)
    }

    async fn drive(&mut self, prompt: String) -> Result<(), ReceiverGone> {
        debug!(
            run_id = %self.run_id,
            session_id = ?self.config.session_id.as_ref().map(|s| s.as_str()),
            agent = ?self.config.agent_name,
            "run started"
        );
        self.emit(RunEvent::RunStarted {
            run_id: self.run_id.clone(),
            session_id: self.config.session_id.clone(),
            agent_name: self.config.agent_name.clone(),
        })
        .await?;

        self.prepare(&prompt).await;

        let mut turn = 0usize;
        loop {
            turn += 1;
            let messages = self.window.build_context();
            debug!(run_id = %self.run_id, turn, message_count = messages.len(), "requesting completion");

            let response = match self
                .router
                .generate_chat(
                    &messages,
                    &self.definitions,
                    &self.config.sampling,
                    &self.config.model,
                    self.config.use_tool_role,
                )
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    let error = format!("{e:#}");
                    warn!(run_id = %self.run_id, turn, err = %error, "run failed");
                    return self
                        .emit(RunEvent::RunFailed {
                            run_id: self.run_id.clone(),
                            error,
                        })
                        .await;
                }
            };

            let completion_tokens = match response.usage {
                Some(usage) if usage.completion_tokens > 0 => usage.completion_tokens,
                _ => self.router.count_tokens(&response.content).await,
            };

            if response.tool_calls.is_empty() {
                self.record(
                    Message::assistant(response.content.clone(), Vec::new(), completion_tokens)
                        .with_agent_name(self.config.agent_name.clone()),
                );
                self.emit(RunEvent::TurnCompleted {
                    run_id: self.run_id.clone(),
                    response: response.clone(),
                    snapshot: self.window.snapshot(),
                })
                .await?;

                debug!(run_id = %self.run_id, turns = turn, "run completed");
                return self
                    .emit(RunEvent::RunCompleted {
                        run_id: self.run_id.clone(),
                        response,
                    })
                    .await;
            }

            let mut batch = PendingBatch::from_calls(response.tool_calls.clone());
            let response = ChatResponse {
                tool_calls: batch.tool_calls(),
                ..response
            };

            self.record(
                Message::assistant(response.content.clone(), batch.tool_calls(), completion_tokens)
                    .with_agent_name(self.config.agent_name.clone()),
            );
            self.emit(RunEvent::TurnCompleted {
                run_id: self.run_id.clone(),
                response,
                snapshot: self.window.snapshot(),
            })
            .await?;

            let cancel_pending = discard_stale_commands(&mut self.commands);
            let calls = self.proposals(&batch).await;
            info!(run_id = %self.run_id, batch_id = %batch.id(), calls = calls.len(), "tool calls proposed");
            self.emit(RunEvent::ToolBatchProposed {
                run_id: self.run_id.clone(),
                batch_id: batch.id().clone(),
                calls,
            })
            .await?;

            let approval = if cancel_pending {
                Err(ApprovalAborted::Cancelled)
            } else {
                collect_approvals(&mut self.commands, &mut batch).await
            };
            if let Err(reason) = approval {
                debug!(run_id = %self.run_id, batch_id = %batch.id(), reason = %reason, "run cancelled");
                return self
                    .emit(RunEvent::RunCancelled {
                        run_id: self.run_id.clone(),
                    })
                    .await;
            }

            let batch_id = batch.id().clone();
            let results = self.execute_batch(batch).await?;
            self.record_results(results).await;

            self.emit(RunEvent::ToolBatchCompleted {
                run_id: self.run_id.clone(),
                batch_id,
            })
            .await?;
        }
    }

    /// Count the fixed parts of the prompt, load history and record the
    /// user's message.
    async fn prepare(&mut self, prompt: &str) {
        self.definitions = self.tools.definitions();

        let system_content = self.window.system_content();
        let system_tokens = self.router.count_tokens(&system_content).await;

        let tool_tokens = if self.definitions.is_empty() {
            0
        } else {
            match serde_json::to_string(&self.definitions) {
                Ok(json) => self.router.count_tokens(&json).await,
                Err(e) => {
                    warn!(run_id = %self.run_id, err = %e, "failed to serialize tool definitions");
                    0
                }
            }
        };

        let user_message = (!prompt.is_empty()).then(|| self.window.render_user_message(prompt));
        let user_prompt_tokens = match &user_message {
            Some(text) => self.router.count_tokens(text).await,
            None => 0,
        };

        let params = BudgetParams {
            context_size: self.config.context_size,
            system_content,
            system_tokens,
            tool_tokens,
            user_prompt_tokens,
        };
        if let Err(e) = self.window.start_run(params) {
            warn!(run_id = %self.run_id, err = %e, "failed to load session history");
        }

        if let Some(text) = user_message {
            self.record(Message::user(text, user_prompt_tokens));
        }
    }

    /// Append a message to the window; persistence failures are not fatal.
    fn record(&mut self, msg: Message) {
        if let Err(e) = self.window.add_message(msg) {
            warn!(run_id = %self.run_id, err = %e, "failed to persist message");
        }
    }

    /// Proposed calls with best-effort previews.
    async fn proposals(&self, batch: &PendingBatch) -> Vec<ProposedToolCall> {
        let mut proposed = batch.proposed();
        for (entry, pending) in proposed.iter_mut().zip(batch.calls()) {
            match self
                .tools
                .preview(&pending.call.name, &pending.call.arguments, &self.tool_ctx)
                .await
            {
                Ok(text) => entry.preview = Some(text),
                Err(e) => debug!(call_id = %entry.call_id, tool = %entry.name, err = %e, "no preview"),
            }
        }
        proposed
    }

    /// Execute a resolved batch in proposal order.
    async fn execute_batch(&mut self, batch: PendingBatch) -> Result<Vec<ToolResult>, ReceiverGone> {
        let mut results = Vec::with_capacity(batch.len());

        for pending in batch.into_calls() {
            let call_id = pending.id();
            let denial = pending.denial_reason().map(str::to_string);
            let call = pending.call;

            if let Some(reason) = denial {
                info!(run_id = %self.run_id, call_id = %call_id, tool = %call.name, reason = %reason, "tool call denied");
                results.push(ToolResult {
                    call_id: call.id,
                    name: call.name,
                    output: format!("denied: {reason}"),
                    is_error: true,
                });
                continue;
            }

            self.emit(RunEvent::ToolStarted {
                run_id: self.run_id.clone(),
                call_id: call_id.clone(),
                name: call.name.clone(),
            })
            .await?;

            let result = match self.invoke(&call).await {
                Ok(output) => {
                    info!(run_id = %self.run_id, call_id = %call_id, tool = %call.name, output_len = output.len(), "tool completed");
                    self.emit(RunEvent::ToolCompleted {
                        run_id: self.run_id.clone(),
                        call_id,
                        output: output.clone(),
                    })
                    .await?;
                    ToolResult {
                        call_id: call.id,
                        name: call.name,
                        output,
                        is_error: false,
                    }
                }
                Err(e) => {
                    let error = format!("{e:#}");
                    warn!(run_id = %self.run_id, call_id = %call_id, tool = %call.name, err = %error, "tool failed");
                    self.emit(RunEvent::ToolFailed {
                        run_id: self.run_id.clone(),
                        call_id,
                        error: error.clone(),
                    })
                    .await?;
                    ToolResult {
                        call_id: call.id,
                        name: call.name,
                        output: error,
                        is_error: true,
                    }
                }
            };
            results.push(result);
        }

        Ok(results)
    }

    async fn invoke(&self, call: &ToolCall) -> Result<String> {
        let limit = self.config.tool_timeout;
        match tokio::time::timeout(
            limit,
            self.tools.execute(&call.name, &call.arguments, &self.tool_ctx),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ToolTimeout {
                tool: call.name.clone(),
                after: limit,
            }
            .into()),
        }
    }

    async fn record_results(&mut self, results: Vec<ToolResult>) {
        if self.config.tool_result_mode == ToolResultMode::Merged && results.len() > 1 {
            let merged = merge_tool_results(&results);
            let tokens = self.router.count_tokens(&merged.output).await;
            self.record(Message::tool(merged, tokens));
            return;
        }

        for result in results {
            let tokens = self.router.count_tokens(&result.output).await;
            self.record(Message::tool(result, tokens));
        }
    }
}

/// Combine a batch's results into one.
///
/// Each part reads `[<call id>] <tool>\nStatus: SUCCESS|ERROR\n<output>`;
/// call ids are comma-joined and the result is an error if any part is.
pub fn merge_tool_results(results: &[ToolResult]) -> ToolResult {
    let output = results
        .iter()
        .map(|r| {
            let status = if r.is_error { "ERROR" } else { "SUCCESS" };
            format!("[{}] {}\nStatus: {}\n{}", r.call_id, r.name, status, r.output)
        })
        .collect::<Vec<_>>()
        .join(MERGE_SEPARATOR);

    ToolResult {
        call_id: results
            .iter()
            .map(|r| r.call_id.as_str())
            .collect::<Vec<_>>()
            .join(","),
        name: MERGED_RESULT_NAME.to_string(),
        output,
        is_error: results.iter().any(|r| r.is_error),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
