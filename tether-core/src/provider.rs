//! Chat Backends and the Provider Router
//!
//! Defines the `ChatBackend` trait implemented by each model backend and the
//! `ProviderRouter` the engine dispatches through. The router normalizes the
//! outgoing sequence, optionally validates it, and bounds the number of
//! concurrently in-flight generation requests.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::normalize::normalize_messages;
use crate::types::{ChatResponse, Message, SamplingConfig, ToolDefinition};
use crate::validate::validate_role_alternation;

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

/// Trait implemented by each model backend (OpenAI-compatible HTTP, local
/// process, test doubles).
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Backend identifier used in logs.
    fn name(&self) -> &str;

    /// Produce one completion for the given (already normalized) messages.
    async fn generate_chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        sampling: &SamplingConfig,
        model: &str,
        use_tool_role: bool,
    ) -> Result<ChatResponse>;

    /// Count the tokens of `text` with the backend's tokenizer.
    async fn count_tokens(&self, text: &str) -> Result<usize>;
}

/// Fallback token estimate: bytes / 4.
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / 4
}

// ---------------------------------------------------------------------------
// Provider router
// ---------------------------------------------------------------------------

/// Wraps exactly one backend.
///
/// Cheap to share behind an `Arc`; every run dispatched through the same
/// router shares its admission gate.
pub struct ProviderRouter {
    backend: Arc<dyn ChatBackend>,
    /// `None` means unbounded concurrency.
    gate: Option<Arc<Semaphore>>,
    max_concurrent: usize,
    validate_roles: bool,
}

impl std::fmt::Debug for ProviderRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRouter")
            .field("backend", &self.backend.name())
            .field("max_concurrent", &self.max_concurrent)
            .field("validate_roles", &self.validate_roles)
            .finish()
    }
}

impl ProviderRouter {
    /// Create a router. `max_concurrent == 0` disables the admission gate.
    pub fn new(backend: Arc<dyn ChatBackend>, max_concurrent: usize) -> Self {
        let gate = (max_concurrent > 0).then(|| Arc::new(Semaphore::new(max_concurrent)));
        Self {
            backend,
            gate,
            max_concurrent,
            validate_roles: false,
        }
    }

    /// Enable role-alternation validation before dispatch.
    pub fn with_role_validation(mut self, enabled: bool) -> Self {
        self.validate_roles = enabled;
        self
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Number of generation requests currently holding a permit.
    /// Always 0 when unbounded.
    pub fn in_flight(&self) -> usize {
        match &self.gate {
            Some(gate) => self.max_concurrent - gate.available_permits(),
            None => 0,
        }
    }

    /// Normalize, validate and dispatch one generation request.
    ///
    /// Validation failures return before any permit is taken or any backend
    /// call is made. The permit is released when the backend call returns,
    /// whether it succeeded or not.
    pub async fn generate_chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        sampling: &SamplingConfig,
        model: &str,
        use_tool_role: bool,
    ) -> Result<ChatResponse> {
        let messages = normalize_messages(messages, use_tool_role);

        if self.validate_roles {
            validate_role_alternation(&messages, use_tool_role)
                .context("role validation failed")?;
        }

        let _permit = match &self.gate {
            Some(gate) => Some(
                gate.clone()
                    .acquire_owned()
                    .await
                    .context("provider admission gate closed")?,
            ),
            None => None,
        };

        debug!(
            backend = self.backend.name(),
            message_count = messages.len(),
            tool_count = tools.len(),
            "dispatching generation request"
        );

        self.backend
            .generate_chat(&messages, tools, sampling, model, use_tool_role)
            .await
    }

    /// Count tokens, falling back to an estimate when the backend's tokenizer
    /// is unavailable.
    pub async fn count_tokens(&self, text: &str) -> usize {
        match self.backend.count_tokens(text).await {
            Ok(count) => count,
            Err(e) => {
                debug!(backend = self.backend.name(), err = %e, "token count failed, using estimate");
                estimate_tokens(text)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
