//! Tool Approval Batch
//!
//! Every tool call the model proposes in one turn waits here for an explicit
//! decision. The run only moves on once the whole batch is decided.

use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::ApprovalAborted;
use crate::ids::{BatchId, CallId};
use crate::protocol::{ProposedToolCall, RunCommand};
use crate::types::ToolCall;

/// Reason recorded when a denial carries none.
pub const DEFAULT_DENIAL_REASON: &str = "denied";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Decision {
    #[default]
    Unset,
    Approved,
    Denied {
        reason: Option<String>,
    },
}

/// A proposed call and its decision.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCall {
    pub call: ToolCall,
    pub decision: Decision,
}

impl PendingCall {
    pub fn id(&self) -> CallId {
        CallId::from(self.call.id.as_str())
    }

    pub fn is_decided(&self) -> bool {
        self.decision != Decision::Unset
    }

    pub fn is_approved(&self) -> bool {
        self.decision == Decision::Approved
    }

    /// Denial reason, with blank reasons replaced by the default.
    pub fn denial_reason(&self) -> Option<&str> {
        match &self.decision {
            Decision::Denied { reason } => Some(
                reason
                    .as_deref()
                    .filter(|r| !r.trim().is_empty())
                    .unwrap_or(DEFAULT_DENIAL_REASON),
            ),
            _ => None,
        }
    }

    /// First decision wins. Returns whether this call changed.
    fn decide(&mut self, decision: Decision) -> bool {
        if self.is_decided() {
            return false;
        }
        self.decision = decision;
        true
    }
}

/// The calls proposed in one model turn, in proposal order.
#[derive(Debug, Clone)]
pub struct PendingBatch {
    id: BatchId,
    calls: Vec<PendingCall>,
    index: HashMap<String, usize>,
}

impl PendingBatch {
    /// Build a batch from the model's tool calls.
    ///
    /// Calls with an empty id, or an id already used earlier in the batch,
    /// get a fresh one so every call is addressable.
    pub fn from_calls(tool_calls: Vec<ToolCall>) -> Self {
        let mut seen: HashSet<String> = HashSet::new();
        let mut calls = Vec::with_capacity(tool_calls.len());
        let mut index = HashMap::with_capacity(tool_calls.len());

        for mut call in tool_calls {
            if call.id.is_empty() || seen.contains(&call.id) {
                let fresh = CallId::new().to_string();
                debug!(original = %call.id, call_id = %fresh, tool = %call.name, "synthesized call id");
                call.id = fresh;
            }
            seen.insert(call.id.clone());
            index.insert(call.id.clone(), calls.len());
            calls.push(PendingCall {
                call,
                decision: Decision::Unset,
            });
        }

        Self {
            id: BatchId::new(),
            calls,
            index,
        }
    }

    pub fn id(&self) -> &BatchId {
        &self.id
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn calls(&self) -> &[PendingCall] {
        &self.calls
    }

    pub fn get(&self, call_id: &str) -> Option<&PendingCall> {
        self.index.get(call_id).map(|&i| &self.calls[i])
    }

    /// Tool calls with their final ids, for the assistant message.
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.calls.iter().map(|p| p.call.clone()).collect()
    }

    /// Calls as shown to the approver, without previews.
    pub fn proposed(&self) -> Vec<ProposedToolCall> {
        self.calls
            .iter()
            .map(|p| ProposedToolCall {
                call_id: p.id(),
                name: p.call.name.clone(),
                arguments_json: p.call.arguments_json(),
                preview: None,
            })
            .collect()
    }

    /// Resolved once every call has a decision.
    pub fn is_resolved(&self) -> bool {
        self.calls.iter().all(PendingCall::is_decided)
    }

    pub fn into_calls(self) -> Vec<PendingCall> {
        self.calls
    }

    /// Apply a decision command. Returns whether any decision changed;
    /// unknown ids, repeated decisions and commands for another batch change
    /// nothing. `Cancel` is not a decision and is ignored here.
    pub fn apply(&mut self, cmd: &RunCommand) -> bool {
        match cmd {
            RunCommand::ApproveTool { call_id } => self.decide_one(call_id, Decision::Approved),
            RunCommand::DenyTool { call_id, reason } => self.decide_one(
                call_id,
                Decision::Denied {
                    reason: reason.clone(),
                },
            ),
            RunCommand::ApproveAll { batch_id } if *batch_id == self.id => {
                self.decide_rest(|| Decision::Approved)
            }
            RunCommand::DenyAll { batch_id, reason } if *batch_id == self.id => {
                self.decide_rest(|| Decision::Denied {
                    reason: reason.clone(),
                })
            }
            _ => false,
        }
    }

    fn decide_one(&mut self, call_id: &CallId, decision: Decision) -> bool {
        match self.index.get(call_id.as_str()) {
            Some(&i) => self.calls[i].decide(decision),
            None => false,
        }
    }

    fn decide_rest(&mut self, decision: impl Fn() -> Decision) -> bool {
        let mut changed = false;
        for call in &mut self.calls {
            changed |= call.decide(decision());
        }
        changed
    }
}

/// Read commands until every call in `batch` is decided.
///
/// Aborts on `Cancel` or when the command queue closes; decisions already
/// recorded stay on the batch either way.
pub async fn collect_approvals(
    commands: &mut mpsc::Receiver<RunCommand>,
    batch: &mut PendingBatch,
) -> Result<(), ApprovalAborted> {
    while !batch.is_resolved() {
        let Some(cmd) = commands.recv().await else {
            return Err(ApprovalAborted::CommandQueueClosed);
        };

        if cmd == RunCommand::Cancel {
            return Err(ApprovalAborted::Cancelled);
        }

        if !batch.apply(&cmd) {
            debug!(batch_id = %batch.id(), command = ?cmd, "ignored command");
        }
    }
    Ok(())
}

/// Drop every command queued while no batch was waiting.
///
/// Call ids are only unique within a batch, so a leftover approval must
/// never reach the next one. A queued `Cancel` survives as the return value
/// and is honoured at the next approval wait.
pub fn discard_stale_commands(commands: &mut mpsc::Receiver<RunCommand>) -> bool {
    let mut cancelled = false;
    while let Ok(cmd) = commands.try_recv() {
        if cmd == RunCommand::Cancel {
            cancelled = true;
        } else {
            debug!(command = ?cmd, "dropped stale command");
        }
    }
    cancelled
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn batch(ids: &[&str]) -> PendingBatch {
        PendingBatch::from_calls(ids.iter().map(|id| ToolCall::new(*id, "t", Map::new())).collect())
    }

    fn queue(cmds: Vec<RunCommand>) -> mpsc::Receiver<RunCommand> {
        let (tx, rx) = mpsc::channel(64);
        for cmd in cmds {
            tx.try_send(cmd).unwrap();
        }
        rx
    }

    #[test]
    fn synthesizes_missing_and_duplicate_ids() {
        let b = batch(&["a", "", "a", "b"]);
        let ids: Vec<_> = b.calls().iter().map(|c| c.call.id.clone()).collect();
        assert_eq!(ids[0], "a");
        assert!(ids[1].starts_with("call_"));
        assert!(ids[2].starts_with("call_"));
        assert_ne!(ids[1], ids[2]);
        assert_eq!(ids[3], "b");
        assert_eq!(b.len(), 4);
    }

    #[test]
    fn preserves_proposal_order() {
        let b = batch(&["z", "a", "m"]);
        let ids: Vec<_> = b.proposed().into_iter().map(|p| p.call_id.to_string()).collect();
        assert_eq!(ids, ["z", "a", "m"]);
    }

    #[test]
    fn first_decision_wins() {
        let mut b = batch(&["a"]);
        assert!(b.apply(&RunCommand::deny("a", "unsafe")));
        assert!(!b.apply(&RunCommand::approve("a")));
        assert_eq!(b.get("a").unwrap().denial_reason(), Some("unsafe"));
    }

    #[test]
    fn unknown_ids_are_ignored() {
        let mut b = batch(&["a"]);
        assert!(!b.apply(&RunCommand::approve("nope")));
        assert!(!b.is_resolved());
    }

    #[test]
    fn blank_reason_falls_back() {
        let mut b = batch(&["a", "b"]);
        b.apply(&RunCommand::deny("a", "  "));
        b.apply(&RunCommand::DenyTool {
            call_id: "b".into(),
            reason: None,
        });
        assert_eq!(b.get("a").unwrap().denial_reason(), Some("denied"));
        assert_eq!(b.get("b").unwrap().denial_reason(), Some("denied"));
    }

    #[test]
    fn batch_commands_only_touch_their_batch() {
        let mut b = batch(&["a", "b", "c"]);
        b.apply(&RunCommand::deny("b", "no"));
        assert!(!b.apply(&RunCommand::ApproveAll {
            batch_id: "batch_other".into()
        }));
        let id = b.id().clone();
        assert!(b.apply(&RunCommand::ApproveAll { batch_id: id }));
        assert!(b.is_resolved());
        assert!(b.get("a").unwrap().is_approved());
        assert_eq!(b.get("b").unwrap().denial_reason(), Some("no"));
    }

    #[tokio::test]
    async fn collects_until_resolved() {
        let mut b = batch(&["a", "b"]);
        let mut rx = queue(vec![
            RunCommand::approve("stale"),
            RunCommand::approve("a"),
            RunCommand::approve("a"),
            RunCommand::deny("b", "unsafe"),
            RunCommand::Cancel,
        ]);
        collect_approvals(&mut rx, &mut b).await.unwrap();
        assert!(b.is_resolved());
        // The trailing cancel is left unread for the next wait.
        assert_eq!(rx.try_recv().unwrap(), RunCommand::Cancel);
    }

    #[test]
    fn stale_commands_are_dropped() {
        let mut rx = queue(vec![RunCommand::approve("call_0"), RunCommand::deny("call_1", "no")]);
        assert!(!discard_stale_commands(&mut rx));
        assert!(rx.try_recv().is_err());

        let mut rx = queue(vec![
            RunCommand::approve("call_0"),
            RunCommand::Cancel,
            RunCommand::approve("call_0"),
        ]);
        assert!(discard_stale_commands(&mut rx));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn leftover_approval_does_not_decide_next_batch() {
        let mut first = batch(&["call_0"]);
        let mut rx = queue(vec![RunCommand::approve("call_0"), RunCommand::approve("call_0")]);
        collect_approvals(&mut rx, &mut first).await.unwrap();

        assert!(!discard_stale_commands(&mut rx));
        let second = batch(&["call_0"]);
        assert!(!second.is_resolved());
        assert!(second.get("call_0").is_some_and(|c| !c.is_approved()));
    }

    #[tokio::test]
    async fn cancel_aborts() {
        let mut b = batch(&["a", "b"]);
        let mut rx = queue(vec![RunCommand::approve("a"), RunCommand::Cancel]);
        let err = collect_approvals(&mut rx, &mut b).await.unwrap_err();
        assert_eq!(err, ApprovalAborted::Cancelled);
        assert!(b.get("a").unwrap().is_approved());
    }

    #[tokio::test]
    async fn closed_queue_aborts() {
        let mut b = batch(&["a"]);
        let (tx, mut rx) = mpsc::channel::<RunCommand>(1);
        drop(tx);
        let err = collect_approvals(&mut rx, &mut b).await.unwrap_err();
        assert_eq!(err, ApprovalAborted::CommandQueueClosed);
    }

    #[tokio::test]
    async fn waits_for_late_decisions() {
        let mut b = batch(&["a"]);
        let (tx, mut rx) = mpsc::channel(4);
        let sender = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            tx.send(RunCommand::approve("a")).await.unwrap();
        });
        collect_approvals(&mut rx, &mut b).await.unwrap();
        sender.await.unwrap();
        assert!(b.get("a").unwrap().is_approved());
    }
}
