//! Tool Execution
//!
//! The engine only sees a `ToolExecutor`. `ToolRegistry` is the stock
//! executor: a name-indexed set of `Tool` trait objects.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::types::ToolDefinition;

/// Per-run information handed to every tool invocation.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// Directory relative paths are resolved against.
    pub working_dir: PathBuf,
}

impl ToolContext {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Executor contract
// ---------------------------------------------------------------------------

/// What the run engine needs from the tool layer.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Definitions advertised to the model.
    fn definitions(&self) -> Vec<ToolDefinition>;

    /// Run a tool. An `Err` becomes an error result fed back to the model.
    async fn execute(&self, name: &str, arguments: &Map<String, Value>, ctx: &ToolContext) -> Result<String>;

    /// Describe what a call would do, for the approval prompt.
    async fn preview(&self, name: &str, arguments: &Map<String, Value>, ctx: &ToolContext) -> Result<String> {
        let _ = (arguments, ctx);
        bail!("tool '{name}' has no preview")
    }
}

// ---------------------------------------------------------------------------
// Individual tools
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema of the arguments object.
    fn parameters(&self) -> Value;

    async fn execute(&self, arguments: &Map<String, Value>, ctx: &ToolContext) -> Result<String>;

    async fn preview(&self, arguments: &Map<String, Value>, ctx: &ToolContext) -> Result<String> {
        let _ = (arguments, ctx);
        bail!("tool '{}' has no preview", self.name())
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

/// Registry of tools keyed by name. Definitions come out sorted by name so
/// the serialized tool list is stable across runs.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    fn lookup(&self, name: &str) -> Result<&Arc<dyn Tool>> {
        match self.tools.get(name) {
            Some(tool) => Ok(tool),
            None => bail!("unknown tool: {name}"),
        }
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    async fn execute(&self, name: &str, arguments: &Map<String, Value>, ctx: &ToolContext) -> Result<String> {
        self.lookup(name)?.execute(arguments, ctx).await
    }

    async fn preview(&self, name: &str, arguments: &Map<String, Value>, ctx: &ToolContext) -> Result<String> {
        self.lookup(name)?.preview(arguments, ctx).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the text argument"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }
        async fn execute(&self, arguments: &Map<String, Value>, _ctx: &ToolContext) -> Result<String> {
            Ok(arguments
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string())
        }
        async fn preview(&self, arguments: &Map<String, Value>, _ctx: &ToolContext) -> Result<String> {
            Ok(format!("would echo {}", Value::Object(arguments.clone())))
        }
    }

    struct Silent;

    #[async_trait]
    impl Tool for Silent {
        fn name(&self) -> &str {
            "silent"
        }
        fn description(&self) -> &str {
            ""
        }
        fn parameters(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _arguments: &Map<String, Value>, _ctx: &ToolContext) -> Result<String> {
            Ok(String::new())
        }
    }

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(Silent));
        reg.register(Arc::new(Echo));
        reg
    }

    fn args(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn definitions_sorted_by_name() {
        let names: Vec<_> = registry().definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, ["echo", "silent"]);
    }

    #[tokio::test]
    async fn executes_registered_tool() {
        let out = registry()
            .execute("echo", &args(json!({"text": "hi"})), &ToolContext::default())
            .await
            .unwrap();
        assert_eq!(out, "hi");
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error() {
        let err = registry()
            .execute("nope", &Map::new(), &ToolContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "unknown tool: nope");
    }

    #[tokio::test]
    async fn preview_defaults_to_error() {
        let reg = registry();
        let ctx = ToolContext::default();
        assert!(reg.preview("silent", &Map::new(), &ctx).await.is_err());
        let p = reg.preview("echo", &args(json!({"text": "x"})), &ctx).await.unwrap();
        assert_eq!(p, r#"would echo {"text":"x"}"#);
    }
}
