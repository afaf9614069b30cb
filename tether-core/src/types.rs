//! Core Data Types
//!
//! Message, role, tool and completion types shared by the engine, the
//! backends and the session log.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

/// Message role.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One turn in the conversation, as persisted to the session log
/// (one JSON object per line).
///
/// Use the role-specific constructors; they keep the populated fields
/// consistent with the role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    /// Only present on assistant turns that invoke tools.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Only present on tool-role turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    /// Precomputed token count used for budget accounting.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub tokens: usize,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

impl Message {
    pub fn system(content: impl Into<String>, tokens: usize) -> Self {
        Self::plain(Role::System, content.into(), tokens)
    }

    pub fn user(content: impl Into<String>, tokens: usize) -> Self {
        Self::plain(Role::User, content.into(), tokens)
    }

    /// Assistant turn. `tool_calls` may be empty for a final answer.
    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>, tokens: usize) -> Self {
        Self {
            tool_calls,
            ..Self::plain(Role::Assistant, content.into(), tokens)
        }
    }

    /// Tool turn carrying a result. The content mirrors the output.
    pub fn tool(result: ToolResult, tokens: usize) -> Self {
        Self {
            role: Role::Tool,
            content: result.output.clone(),
            tool_calls: Vec::new(),
            tool_result: Some(result),
            agent_name: None,
            tokens,
        }
    }

    pub fn with_agent_name(mut self, agent_name: Option<String>) -> Self {
        self.agent_name = agent_name;
        self
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Whether this message carries a tool result (regardless of stored role).
    pub fn is_tool_result(&self) -> bool {
        self.role == Role::Tool || self.tool_result.is_some()
    }

    fn plain(role: Role, content: String, tokens: usize) -> Self {
        Self {
            role,
            content,
            tool_calls: Vec::new(),
            tool_result: None,
            agent_name: None,
            tokens,
        }
    }
}

// ---------------------------------------------------------------------------
// Tool types
// ---------------------------------------------------------------------------

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique within its batch. Synthesized when the backend omits one.
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub arguments: Map<String, Value>,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// Arguments rendered as a JSON object string.
    pub fn arguments_json(&self) -> String {
        serde_json::to_string(&self.arguments).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Outcome of one (or, when merged, several) tool calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub name: String,
    pub output: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

/// A tool definition advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: Value,
}

// ---------------------------------------------------------------------------
// Completion types
// ---------------------------------------------------------------------------

/// Optional sampling parameters forwarded to the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// Token usage reported by the backend for a single call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

/// Response from a backend `generate_chat` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Text content (may be empty if only tool calls).
    pub content: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

/// Name and location of the skill active in a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillMetadata {
    pub name: String,
    pub path: PathBuf,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
