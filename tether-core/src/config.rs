//! Configuration
//!
//! TOML-based configuration: backend endpoint and limits, agent defaults,
//! prompt templates. Every field has a default, so an empty file (or no
//! file at all) is a valid configuration. Includes startup validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::agent_loop::{RunConfig, ToolResultMode};
use crate::context::{PromptTemplates, DEFAULT_SYSTEM_TEMPLATE, USER_MESSAGE_PLACEHOLDER};
use crate::types::SamplingConfig;

// ---------------------------------------------------------------------------
// Configuration structures
// ---------------------------------------------------------------------------

/// Top-level configuration (maps to TOML).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Where sessions and run records live. Defaults to the platform data
    /// directory; a leading `~/` expands to the home directory.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    #[serde(default)]
    pub provider: ProviderSettings,

    #[serde(default)]
    pub agent: AgentSettings,

    #[serde(default)]
    pub context: ContextSettings,
}

/// Chat backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Base URL of the OpenAI-compatible server.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
    /// Maximum generation requests in flight at once; 0 means unbounded.
    #[serde(default)]
    pub max_concurrent_requests: usize,
    /// Check role alternation before every request.
    #[serde(default)]
    pub validate_roles: bool,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: default_model(),
            http_timeout_secs: default_http_timeout(),
            max_concurrent_requests: 0,
            validate_roles: false,
        }
    }
}

fn default_endpoint() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_model() -> String {
    "default".to_string()
}

fn default_http_timeout() -> u64 {
    300
}

/// Agent defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_agent_name")]
    pub name: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_context_size")]
    pub context_size: usize,
    /// Whether the backend understands the `tool` role.
    #[serde(default = "default_true")]
    pub tool_role: bool,
    #[serde(default)]
    pub tool_result_mode: ToolResultMode,
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,
    #[serde(default)]
    pub sampling: SamplingConfig,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            name: default_agent_name(),
            system_prompt: None,
            context_size: default_context_size(),
            tool_role: true,
            tool_result_mode: ToolResultMode::default(),
            tool_timeout_secs: default_tool_timeout(),
            sampling: SamplingConfig::default(),
        }
    }
}

fn default_agent_name() -> String {
    "default".to_string()
}

fn default_context_size() -> usize {
    4096
}

fn default_true() -> bool {
    true
}

fn default_tool_timeout() -> u64 {
    120
}

/// Prompt templates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSettings {
    #[serde(default = "default_system_template")]
    pub system_template: String,
    #[serde(default = "default_user_template")]
    pub user_template: String,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            system_template: default_system_template(),
            user_template: default_user_template(),
        }
    }
}

fn default_system_template() -> String {
    DEFAULT_SYSTEM_TEMPLATE.to_string()
}

fn default_user_template() -> String {
    USER_MESSAGE_PLACEHOLDER.to_string()
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

impl EngineConfig {
    /// Load config from the default location:
    /// `<config dir>/tether/config.toml`
    pub fn load_default() -> Result<Self> {
        let path = Self::default_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            info!("no config file found at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config: {}", path.display()))?;
        info!(path = %path.display(), endpoint = %config.provider.endpoint, "loaded config");
        Ok(config)
    }

    /// Default config file path.
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("could not determine config directory"))?;
        Ok(dir.join("tether").join("config.toml"))
    }

    /// Resolved data directory.
    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => match dir.strip_prefix("~") {
                Ok(rest) => {
                    let home = dirs::home_dir()
                        .ok_or_else(|| anyhow::anyhow!("could not determine home directory"))?;
                    Ok(home.join(rest))
                }
                Err(_) => Ok(dir.clone()),
            },
            None => {
                let base = dirs::data_local_dir()
                    .ok_or_else(|| anyhow::anyhow!("could not determine local data directory"))?;
                Ok(base.join("tether"))
            }
        }
    }

    /// Engine settings for runs started from `working_dir`.
    pub fn run_config(&self, working_dir: impl Into<PathBuf>) -> RunConfig {
        RunConfig {
            context_size: self.agent.context_size,
            model: self.provider.model.clone(),
            sampling: self.agent.sampling.clone(),
            use_tool_role: self.agent.tool_role,
            tool_result_mode: self.agent.tool_result_mode,
            tool_timeout: Duration::from_secs(self.agent.tool_timeout_secs),
            agent_name: Some(self.agent.name.clone()),
            session_id: None,
            working_dir: working_dir.into(),
        }
    }

    /// Templates for the context window; blank templates are dropped.
    pub fn templates(&self) -> PromptTemplates {
        let non_blank = |s: &str| (!s.trim().is_empty()).then(|| s.to_string());
        PromptTemplates {
            system: non_blank(&self.context.system_template),
            user: non_blank(&self.context.user_template),
        }
    }

    /// Validate the config on startup. Returns a list of warnings.
    pub fn validate(&self) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        if self.provider.endpoint.trim().is_empty() {
            bail!("provider.endpoint must not be empty");
        }
        if self.agent.context_size == 0 {
            bail!("agent.context_size must be greater than zero");
        }
        if self.agent.tool_timeout_secs == 0 {
            bail!("agent.tool_timeout_secs must be greater than zero");
        }

        let user_template = &self.context.user_template;
        if !user_template.trim().is_empty() && !user_template.contains(USER_MESSAGE_PLACEHOLDER) {
            warnings.push(format!(
                "context.user_template does not contain '{USER_MESSAGE_PLACEHOLDER}'; prompts will be discarded"
            ));
        }
        if self.provider.http_timeout_secs == 0 {
            warnings.push("provider.http_timeout_secs is 0; requests will fail immediately".to_string());
        }
        if let Some(temperature) = self.agent.sampling.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                warnings.push(format!("agent.sampling.temperature {temperature} is outside 0.0..=2.0"));
            }
        }

        Ok(warnings)
    }
}

// ---------------------------------------------------------------------------
// Config generation (for `config init`)
// ---------------------------------------------------------------------------

/// Generate a sample config TOML string.
pub fn sample_config() -> String {
    r#"# Tether configuration

# data_dir = "~/.local/share/tether"

[provider]
# OpenAI-compatible server (llama.cpp, vLLM, LM Studio, ...)
endpoint = "http://127.0.0.1:8080"
model = "default"
http_timeout_secs = 300
# 0 = unbounded
max_concurrent_requests = 0
validate_roles = false

[agent]
name = "default"
# system_prompt = "You are a careful coding assistant."
context_size = 4096
# Set to false for models without a native tool role
tool_role = true
# "separate" or "merged"
tool_result_mode = "separate"
tool_timeout_secs = 120

[agent.sampling]
temperature = 0.7
# top_p = 0.9
# top_k = 40
# repeat_penalty = 1.1
max_tokens = 4096

[context]
system_template = "You are a helpful assistant."
user_template = "{{ user_message }}"
"#
    .to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.provider.endpoint, "http://127.0.0.1:8080");
        assert_eq!(config.provider.http_timeout_secs, 300);
        assert_eq!(config.agent.context_size, 4096);
        assert!(config.agent.tool_role);
        assert_eq!(config.agent.tool_result_mode, ToolResultMode::Separate);
        assert_eq!(config.context.user_template, "{{ user_message }}");
        assert!(config.validate().unwrap().is_empty());
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
data_dir = "/srv/tether"

[provider]
endpoint = "http://gpu-box:9000"
model = "qwen2.5-coder.gguf"
max_concurrent_requests = 2
validate_roles = true

[agent]
name = "coder"
system_prompt = "Write Rust."
context_size = 32768
tool_role = false
tool_result_mode = "merged"
tool_timeout_secs = 30

[agent.sampling]
temperature = 0.2
top_k = 20

[context]
system_template = ""
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.data_dir().unwrap(), PathBuf::from("/srv/tether"));
        assert_eq!(config.provider.max_concurrent_requests, 2);
        assert!(config.provider.validate_roles);
        assert_eq!(config.agent.tool_result_mode, ToolResultMode::Merged);
        assert_eq!(config.agent.sampling.top_k, Some(20));

        let run = config.run_config("/work");
        assert_eq!(run.context_size, 32768);
        assert!(!run.use_tool_role);
        assert_eq!(run.tool_timeout, Duration::from_secs(30));
        assert_eq!(run.agent_name.as_deref(), Some("coder"));
        assert_eq!(run.model, "qwen2.5-coder.gguf");

        let templates = config.templates();
        assert_eq!(templates.system, None);
        assert_eq!(templates.user.as_deref(), Some("{{ user_message }}"));
    }

    #[test]
    fn rejects_unknown_result_mode() {
        let err = toml::from_str::<EngineConfig>("[agent]\ntool_result_mode = \"batched\"").unwrap_err();
        assert!(err.to_string().contains("batched"));
    }

    #[test]
    fn validate_rejects_zero_context() {
        let mut config = EngineConfig::default();
        config.agent.context_size = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.provider.endpoint = " ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_warns_on_template_without_placeholder() {
        let mut config = EngineConfig::default();
        config.context.user_template = "static text".into();
        let warnings = config.validate().unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("{{ user_message }}"));
    }

    #[test]
    fn tilde_data_dir_expands() {
        let config = EngineConfig {
            data_dir: Some(PathBuf::from("~/tether-data")),
            ..Default::default()
        };
        if let Some(home) = dirs::home_dir() {
            assert_eq!(config.data_dir().unwrap(), home.join("tether-data"));
        }
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[agent]\nname = \"reviewer\"\n").unwrap();
        let config = EngineConfig::load_from(&path).unwrap();
        assert_eq!(config.agent.name, "reviewer");
        assert!(EngineConfig::load_from(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn sample_config_parses() {
        let config: EngineConfig = toml::from_str(&sample_config()).unwrap();
        assert!(config.validate().unwrap().is_empty());
        assert_eq!(config.agent.sampling.temperature, Some(0.7));
        assert_eq!(config.agent.sampling.max_tokens, Some(4096));
    }
}
