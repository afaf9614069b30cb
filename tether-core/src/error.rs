//! Typed errors at module boundaries.
//!
//! These travel inside `anyhow::Error` where the surrounding API returns
//! `anyhow::Result`; callers can `downcast_ref` when they need the variant.

use std::time::Duration;

use thiserror::Error;

use crate::types::Role;

/// A malformed message sequence detected before dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("first message must be system role, got: {role}")]
    FirstNotSystem { role: Role },

    #[error("consecutive {role} messages at index {previous} and {index}")]
    ConsecutiveRole {
        role: Role,
        previous: usize,
        index: usize,
    },

    #[error("tool result at index {index} (role {role}) without preceding assistant tool calls")]
    OrphanToolResult { index: usize, role: Role },
}

impl ValidationError {
    /// Index of the offending message.
    pub fn index(&self) -> usize {
        match self {
            ValidationError::FirstNotSystem { .. } => 0,
            ValidationError::ConsecutiveRole { index, .. } => *index,
            ValidationError::OrphanToolResult { index, .. } => *index,
        }
    }
}

/// Why `collect_approvals` stopped before the batch was resolved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApprovalAborted {
    #[error("cancelled")]
    Cancelled,

    #[error("command queue closed")]
    CommandQueueClosed,
}

/// A tool that did not finish within its time budget.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("tool '{tool}' timed out after {after:?}")]
pub struct ToolTimeout {
    pub tool: String,
    pub after: Duration,
}
