//! OpenAI-Compatible Chat Backend
//!
//! Implements `ChatBackend` for servers speaking the OpenAI Chat Completions
//! API (llama.cpp server, vLLM, LM Studio, ...). Token counting uses the
//! llama.cpp `/tokenize` endpoint; servers without it fall back to the
//! router's estimate.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;

use tether_core::ids::RequestId;
use tether_core::normalize::tool_result_text;
use tether_core::provider::ChatBackend;
use tether_core::types::{
    ChatResponse, Message, Role, SamplingConfig, TokenUsage, ToolCall, ToolDefinition,
};

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// Chat Completions backend for a single server endpoint.
pub struct OpenAiCompatibleBackend {
    endpoint: String,
    client: reqwest::Client,
}

impl OpenAiCompatibleBackend {
    /// `endpoint` is the server base URL, without the `/v1` path.
    pub fn new(endpoint: &str, http_timeout: Option<Duration>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(http_timeout.unwrap_or(DEFAULT_HTTP_TIMEOUT))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Convert internal messages and settings to the request payload.
    fn build_request_body(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        sampling: &SamplingConfig,
        model: &str,
        use_tool_role: bool,
    ) -> Value {
        let api_messages: Vec<Value> = messages
            .iter()
            .map(|msg| render_message(msg, use_tool_role))
            .collect();

        let mut body = json!({
            "model": model_name(model),
            "messages": api_messages,
            "max_tokens": sampling.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "stream": false,
        });

        if !tools.is_empty() {
            let api_tools: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters
                        }
                    })
                })
                .collect();
            body["tools"] = json!(api_tools);
        }

        if let Some(temperature) = sampling.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(top_p) = sampling.top_p {
            body["top_p"] = json!(top_p);
        }
        if let Some(top_k) = sampling.top_k {
            body["top_k"] = json!(top_k);
        }
        if let Some(repeat_penalty) = sampling.repeat_penalty {
            body["repeat_penalty"] = json!(repeat_penalty);
        }

        body
    }
}

#[async_trait]
impl ChatBackend for OpenAiCompatibleBackend {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn generate_chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        sampling: &SamplingConfig,
        model: &str,
        use_tool_role: bool,
    ) -> Result<ChatResponse> {
        let request_id = RequestId::new();
        let body = self.build_request_body(messages, tools, sampling, model, use_tool_role);
        let url = format!("{}/v1/chat/completions", self.endpoint);

        debug!(%request_id, url = %url, messages = messages.len(), tools = tools.len(), "calling chat backend");

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("provider request failed (request_id={request_id})"))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let text = text.trim();
            if text.is_empty() {
                bail!("provider error (request_id={request_id}): HTTP {status}");
            }
            bail!("provider error (request_id={request_id}): HTTP {status}: {text}");
        }

        let payload: Value = response
            .json()
            .await
            .with_context(|| format!("invalid response body (request_id={request_id})"))?;

        let parsed = parse_response(&payload)
            .with_context(|| format!("provider response parse failed (request_id={request_id})"))?;

        debug!(
            %request_id,
            content_len = parsed.content.len(),
            tool_calls = parsed.tool_calls.len(),
            "chat backend responded"
        );
        Ok(parsed)
    }

    async fn count_tokens(&self, text: &str) -> Result<usize> {
        let url = format!("{}/tokenize", self.endpoint);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "content": text }))
            .send()
            .await
            .context("tokenize request failed")?;

        if !response.status().is_success() {
            bail!("tokenize failed: HTTP {}", response.status());
        }

        let payload: Value = response.json().await.context("invalid tokenize response")?;
        if let Some(tokens) = payload.get("tokens").and_then(Value::as_array) {
            return Ok(tokens.len());
        }
        payload
            .get("count")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .ok_or_else(|| anyhow!("tokenize response has neither tokens nor count"))
    }
}

// ---------------------------------------------------------------------------
// Request rendering
// ---------------------------------------------------------------------------

/// Model name as the server expects it: blank means `default`, and a
/// trailing `.gguf` is dropped.
fn model_name(model: &str) -> &str {
    let model = if model.trim().is_empty() { "default" } else { model };
    model.strip_suffix(".gguf").unwrap_or(model)
}

fn render_message(msg: &Message, use_tool_role: bool) -> Value {
    if let Some(result) = &msg.tool_result {
        if use_tool_role {
            let mut entry = json!({ "role": "tool", "content": result.output });
            if !result.call_id.is_empty() {
                entry["tool_call_id"] = json!(result.call_id);
            }
            return entry;
        }
        return json!({
            "role": "user",
            "content": tool_result_text(&result.name, &msg.content),
        });
    }

    // A bare tool-role message without a result can only go out as user text
    // to a server that has no tool role.
    let role = match msg.role {
        Role::Tool if !use_tool_role => Role::User,
        role => role,
    };

    let mut entry = json!({ "role": role.as_str(), "content": msg.content });
    if msg.has_tool_calls() {
        let calls: Vec<Value> = msg
            .tool_calls
            .iter()
            .map(|c| {
                json!({
                    "id": c.id,
                    "type": "function",
                    "function": {
                        "name": c.name,
                        "arguments": c.arguments_json()
                    }
                })
            })
            .collect();
        entry["tool_calls"] = json!(calls);
    }
    entry
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

fn parse_response(payload: &Value) -> Result<ChatResponse> {
    let choice = payload
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .ok_or_else(|| anyhow!("no choices in response"))?;

    let message = choice
        .get("message")
        .filter(|m| m.is_object())
        .ok_or_else(|| anyhow!("malformed message in response"))?;

    let text = |key: &str| {
        message
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    Ok(ChatResponse {
        content: text("content"),
        reasoning: text("reasoning_content"),
        tool_calls: parse_tool_calls(message),
        usage: parse_usage(payload),
    })
}

fn parse_tool_calls(message: &Value) -> Vec<ToolCall> {
    let Some(raw_calls) = message.get("tool_calls").and_then(Value::as_array) else {
        return Vec::new();
    };

    raw_calls
        .iter()
        .filter_map(|raw| {
            let function = raw.get("function")?;
            let name = function
                .get("name")
                .and_then(Value::as_str)
                .filter(|n| !n.is_empty())?;
            let id = raw.get("id").and_then(Value::as_str).unwrap_or_default();
            Some(ToolCall::new(id, name, parse_arguments(function.get("arguments"))))
        })
        .collect()
}

/// Arguments arrive as a JSON string or, from some servers, as an object.
/// Anything unparseable becomes an empty map.
fn parse_arguments(raw: Option<&Value>) -> Map<String, Value> {
    match raw {
        Some(Value::Object(map)) => map.clone(),
        Some(Value::String(s)) if !s.trim().is_empty() => {
            match serde_json::from_str::<Value>(s) {
                Ok(Value::Object(map)) => map,
                _ => {
                    debug!(arguments = %s, "ignoring non-object tool arguments");
                    Map::new()
                }
            }
        }
        _ => Map::new(),
    }
}

fn parse_usage(payload: &Value) -> Option<TokenUsage> {
    let usage = payload.get("usage").filter(|u| u.is_object())?;
    let field = |key: &str| usage.get(key).and_then(Value::as_u64).unwrap_or(0) as usize;
    Some(TokenUsage {
        prompt_tokens: field("prompt_tokens"),
        completion_tokens: field("completion_tokens"),
        total_tokens: field("total_tokens"),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
