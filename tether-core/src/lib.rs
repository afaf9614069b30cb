//! # Tether Core
//!
//! Engine library for running a tool-using agent against a local chat
//! backend: the run loop, the tool approval gate, the token-budgeted
//! context window over an append-only session log, and the provider router.

pub mod agent_loop;
pub mod approval;
pub mod config;
pub mod context;
pub mod error;
pub mod ids;
pub mod normalize;
pub mod protocol;
pub mod provider;
pub mod runner;
pub mod session;
pub mod session_log;
pub mod tool;
pub mod types;
pub mod validate;

// Re-export key types
pub use agent_loop::{merge_tool_results, AgentEngine, RunConfig, RunHandle, ToolResultMode};
pub use approval::{collect_approvals, Decision, PendingBatch, PendingCall};
pub use config::EngineConfig;
pub use context::{BudgetParams, ContextSnapshot, ContextWindow, PromptTemplates};
pub use error::{ApprovalAborted, ToolTimeout, ValidationError};
pub use ids::{BatchId, CallId, RequestId, RunId, SessionId};
pub use protocol::{ProposedToolCall, RunCommand, RunEvent};
pub use provider::{ChatBackend, ProviderRouter};
pub use runner::{ActiveRun, AgentRunner, RunRequest, SkillInvocation};
pub use session::{RunRecord, RunStatus, RunStore, SessionInfo, SessionStore};
pub use session_log::SessionLog;
pub use tool::{Tool, ToolContext, ToolExecutor, ToolRegistry};
pub use types::{
    ChatResponse, Message, Role, SamplingConfig, SkillMetadata, TokenUsage, ToolCall, ToolDefinition,
    ToolResult,
};
