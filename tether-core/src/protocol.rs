//! Run Command/Event Protocol
//!
//! Commands flow from the caller to a running engine, events flow back.
//! Both serialize as internally tagged JSON objects (`{"type": "...", ...}`)
//! so a transport adapter can forward them unchanged.

use serde::{Deserialize, Serialize};

use crate::context::ContextSnapshot;
use crate::ids::{BatchId, CallId, RunId, SessionId};
use crate::types::ChatResponse;

/// Capacity of the caller → engine queue.
pub const COMMAND_QUEUE_CAPACITY: usize = 16;
/// Capacity of the engine → caller queue.
pub const EVENT_QUEUE_CAPACITY: usize = 32;

/// Instruction sent to a running engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunCommand {
    ApproveTool {
        call_id: CallId,
    },
    DenyTool {
        call_id: CallId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Approve every undecided call of the batch.
    ApproveAll {
        batch_id: BatchId,
    },
    /// Deny every undecided call of the batch.
    DenyAll {
        batch_id: BatchId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Cancel,
}

impl RunCommand {
    pub fn approve(call_id: impl Into<CallId>) -> Self {
        RunCommand::ApproveTool {
            call_id: call_id.into(),
        }
    }

    pub fn deny(call_id: impl Into<CallId>, reason: impl Into<String>) -> Self {
        RunCommand::DenyTool {
            call_id: call_id.into(),
            reason: Some(reason.into()),
        }
    }
}

/// A tool call awaiting a decision, as shown to the approver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedToolCall {
    pub call_id: CallId,
    pub name: String,
    pub arguments_json: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

/// Progress notification from a running engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: RunId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_name: Option<String>,
    },
    TurnCompleted {
        run_id: RunId,
        response: ChatResponse,
        snapshot: ContextSnapshot,
    },
    ToolBatchProposed {
        run_id: RunId,
        batch_id: BatchId,
        calls: Vec<ProposedToolCall>,
    },
    ToolStarted {
        run_id: RunId,
        call_id: CallId,
        name: String,
    },
    ToolCompleted {
        run_id: RunId,
        call_id: CallId,
        output: String,
    },
    ToolFailed {
        run_id: RunId,
        call_id: CallId,
        error: String,
    },
    ToolBatchCompleted {
        run_id: RunId,
        batch_id: BatchId,
    },
    RunCompleted {
        run_id: RunId,
        response: ChatResponse,
    },
    RunCancelled {
        run_id: RunId,
    },
    RunFailed {
        run_id: RunId,
        error: String,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            RunEvent::RunStarted { run_id, .. }
            | RunEvent::TurnCompleted { run_id, .. }
            | RunEvent::ToolBatchProposed { run_id, .. }
            | RunEvent::ToolStarted { run_id, .. }
            | RunEvent::ToolCompleted { run_id, .. }
            | RunEvent::ToolFailed { run_id, .. }
            | RunEvent::ToolBatchCompleted { run_id, .. }
            | RunEvent::RunCompleted { run_id, .. }
            | RunEvent::RunCancelled { run_id }
            | RunEvent::RunFailed { run_id, .. } => run_id,
        }
    }

    /// Whether this is the last event of its run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunEvent::RunCompleted { .. } | RunEvent::RunCancelled { .. } | RunEvent::RunFailed { .. }
        )
    }

    /// Wire name of the event, as used in the `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            RunEvent::RunStarted { .. } => "run_started",
            RunEvent::TurnCompleted { .. } => "turn_completed",
            RunEvent::ToolBatchProposed { .. } => "tool_batch_proposed",
            RunEvent::ToolStarted { .. } => "tool_started",
            RunEvent::ToolCompleted { .. } => "tool_completed",
            RunEvent::ToolFailed { .. } => "tool_failed",
            RunEvent::ToolBatchCompleted { .. } => "tool_batch_completed",
            RunEvent::RunCompleted { .. } => "run_completed",
            RunEvent::RunCancelled { .. } => "run_cancelled",
            RunEvent::RunFailed { .. } => "run_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn commands_use_type_tag() {
        let cmd = RunCommand::deny("call_1", "unsafe");
        assert_eq!(
            serde_json::to_value(&cmd).unwrap(),
            json!({"type": "deny_tool", "call_id": "call_1", "reason": "unsafe"})
        );

        let parsed: RunCommand = serde_json::from_value(json!({"type": "cancel"})).unwrap();
        assert_eq!(parsed, RunCommand::Cancel);

        let parsed: RunCommand =
            serde_json::from_value(json!({"type": "deny_all", "batch_id": "batch_x"})).unwrap();
        assert_eq!(
            parsed,
            RunCommand::DenyAll {
                batch_id: "batch_x".into(),
                reason: None
            }
        );
    }

    #[test]
    fn event_kind_matches_tag() {
        let event = RunEvent::ToolBatchCompleted {
            run_id: "run_1".into(),
            batch_id: "batch_1".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], event.kind());
        assert_eq!(event.run_id().as_str(), "run_1");
        assert!(!event.is_terminal());
        assert!(RunEvent::RunCancelled { run_id: "r".into() }.is_terminal());
    }
}
