//! Role Alternation Validation
//!
//! Checks a normalized message sequence before dispatch. Violations are
//! reported, never repaired.

use crate::error::ValidationError;
use crate::normalize::effective_role;
use crate::types::{Message, Role};

/// Validate role alternation for a sequence about to be sent to a backend.
///
/// Rules:
/// 1. The first message is `system`.
/// 2. No two adjacent messages share an effective role, except tool runs.
/// 3. A tool result follows an assistant message that declared tool calls;
///    that expectation carries across tool messages until any other message
///    clears it.
pub fn validate_role_alternation(
    messages: &[Message],
    use_tool_role: bool,
) -> Result<(), ValidationError> {
    let Some(first) = messages.first() else {
        return Ok(());
    };

    if first.role != Role::System {
        return Err(ValidationError::FirstNotSystem { role: first.role });
    }

    let mut prev_role = Role::System;
    let mut expecting_tool_result = false;

    for (index, msg) in messages.iter().enumerate().skip(1) {
        let role = effective_role(msg, use_tool_role);

        if role == prev_role && role != Role::Tool {
            return Err(ValidationError::ConsecutiveRole {
                role,
                previous: index - 1,
                index,
            });
        }

        let is_tool_result = msg.is_tool_result();
        if is_tool_result && !expecting_tool_result {
            return Err(ValidationError::OrphanToolResult {
                index,
                role: msg.role,
            });
        }

        expecting_tool_result = is_tool_result || (msg.role == Role::Assistant && msg.has_tool_calls());
        prev_role = role;
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
