//! Message Normalization
//!
//! Merges consecutive messages that share an effective role before they are
//! sent to a backend. Persisted history is never touched; merged messages are
//! new values.

use crate::types::{Message, Role};

/// Separator placed between merged message bodies.
pub const MERGE_SEPARATOR: &str = "\n\n---\n\n";

/// Role used for merging and validation.
///
/// Backends without a native tool role see tool results as user turns.
pub fn effective_role(msg: &Message, use_tool_role: bool) -> Role {
    if !use_tool_role && msg.tool_result.is_some() {
        Role::User
    } else {
        msg.role
    }
}

/// Merge consecutive messages with the same effective role.
///
/// With `use_tool_role` a tool message is never merged, so every tool result
/// stays individually addressable. Without it, each tool result is first
/// rewritten as framed user text so that merged results keep their own
/// name and output.
pub fn normalize_messages(messages: &[Message], use_tool_role: bool) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());

    for msg in messages {
        let msg = if use_tool_role {
            msg.clone()
        } else {
            tool_result_as_user(msg)
        };
        match out.last_mut() {
            Some(prev) if should_merge(&msg, prev, use_tool_role) => merge_into(prev, &msg),
            _ => out.push(msg),
        }
    }

    out
}

/// Text a tool result is sent as when the backend has no tool role.
pub fn tool_result_text(name: &str, output: &str) -> String {
    format!("Tool: {name}\n\nResult:\n{output}")
}

fn tool_result_as_user(msg: &Message) -> Message {
    let mut msg = msg.clone();
    if let Some(result) = msg.tool_result.take() {
        msg.role = Role::User;
        msg.content = tool_result_text(&result.name, &msg.content);
    }
    msg
}

fn should_merge(current: &Message, previous: &Message, use_tool_role: bool) -> bool {
    let current_role = effective_role(current, use_tool_role);
    if use_tool_role && current_role == Role::Tool {
        return false;
    }
    current_role == effective_role(previous, use_tool_role)
}

fn merge_into(target: &mut Message, source: &Message) {
    if !target.content.is_empty() && !source.content.is_empty() {
        target.content.push_str(MERGE_SEPARATOR);
    }
    target.content.push_str(&source.content);
    target.tokens = target.tokens.saturating_add(source.tokens);
    target.tool_calls.extend(source.tool_calls.iter().cloned());
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ToolCall, ToolResult};
    use serde_json::Map;

    fn tool_msg(id: &str, output: &str) -> Message {
        Message::tool(
            ToolResult {
                call_id: id.into(),
                name: "t".into(),
                output: output.into(),
                is_error: false,
            },
            5,
        )
    }

    fn call(id: &str) -> ToolCall {
        ToolCall::new(id, "t", Map::new())
    }

    #[test]
    fn merges_consecutive_user_messages() {
        let msgs = vec![
            Message::system("sys", 1),
            Message::user("a", 2),
            Message::user("b", 3),
        ];
        let out = normalize_messages(&msgs, true);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].content, "a\n\n---\n\nb");
        assert_eq!(out[1].tokens, 5);
    }

    #[test]
    fn empty_bodies_join_without_separator() {
        let msgs = vec![Message::user("", 0), Message::user("b", 0)];
        let out = normalize_messages(&msgs, true);
        assert_eq!(out[0].content, "b");
    }

    #[test]
    fn tool_results_stay_separate_with_tool_role() {
        let msgs = vec![
            Message::system("sys", 0),
            Message::assistant("", vec![call("1"), call("2")], 0),
            tool_msg("1", "one"),
            tool_msg("2", "two"),
        ];
        let out = normalize_messages(&msgs, true);
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn tool_results_fold_into_user_without_tool_role() {
        let msgs = vec![
            Message::system("sys", 0),
            Message::assistant("", vec![call("1"), call("2")], 0),
            tool_msg("1", "one"),
            tool_msg("2", "two"),
            Message::user("next", 1),
        ];
        let out = normalize_messages(&msgs, false);
        assert_eq!(out.len(), 3);
        assert_eq!(
            out[2].content,
            "Tool: t\n\nResult:\none\n\n---\n\nTool: t\n\nResult:\ntwo\n\n---\n\nnext"
        );
        assert_eq!(out[2].tokens, 11);
        assert_eq!(out[2].role, Role::User);
        assert!(out[2].tool_result.is_none());
    }

    #[test]
    fn every_folded_tool_result_keeps_its_output() {
        let msgs = vec![
            Message::system("sys", 0),
            Message::user("go", 0),
            Message::assistant("", vec![call("c1"), call("c2")], 0),
            tool_msg("c1", "FIRST_OUTPUT"),
            tool_msg("c2", "SECOND_OUTPUT"),
        ];
        let out = normalize_messages(&msgs, false);
        assert_eq!(out.len(), 4);
        assert!(out[3].content.contains("FIRST_OUTPUT"));
        assert!(out[3].content.contains("SECOND_OUTPUT"));
        assert_eq!(out[3].content.matches("Tool: t").count(), 2);
    }

    #[test]
    fn assistant_tool_calls_concatenate() {
        let msgs = vec![
            Message::assistant("x", vec![call("1")], 0),
            Message::assistant("y", vec![call("2")], 0),
        ];
        let out = normalize_messages(&msgs, true);
        assert_eq!(out.len(), 1);
        let ids: Vec<_> = out[0].tool_calls.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["1", "2"]);
    }

    #[test]
    fn normalization_is_idempotent() {
        let msgs = vec![
            Message::system("sys", 0),
            Message::user("a", 1),
            Message::user("b", 1),
            Message::assistant("", vec![call("1")], 0),
            tool_msg("1", "one"),
            tool_msg("2", "two"),
            Message::assistant("c", vec![], 1),
            Message::assistant("d", vec![], 1),
        ];
        for use_tool_role in [true, false] {
            let once = normalize_messages(&msgs, use_tool_role);
            let twice = normalize_messages(&once, use_tool_role);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn source_history_is_untouched() {
        let msgs = vec![Message::user("a", 1), Message::user("b", 1)];
        let _ = normalize_messages(&msgs, true);
        assert_eq!(msgs[0].content, "a");
    }
}
