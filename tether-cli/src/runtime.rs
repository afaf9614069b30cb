use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use tether_core::config::EngineConfig;
use tether_core::provider::ProviderRouter;
use tether_core::runner::AgentRunner;
use tether_provider_openai::OpenAiCompatibleBackend;
use tether_storage_fs::{FsRunStore, FsSessionStore};

use crate::tools::builtin_registry;

/// Wire the configured backend, stores and builtin tools into a runner.
pub fn build_runner(config: &EngineConfig, working_dir: PathBuf) -> Result<AgentRunner> {
    let data_dir = config.data_dir().context("failed to determine data directory")?;
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    info!(data_dir = %data_dir.display(), "using data directory");

    let backend = OpenAiCompatibleBackend::new(
        &config.provider.endpoint,
        Some(Duration::from_secs(config.provider.http_timeout_secs)),
    )?;
    info!(
        endpoint = %config.provider.endpoint,
        model = %config.provider.model,
        max_concurrent = config.provider.max_concurrent_requests,
        "registering chat backend"
    );
    let router = ProviderRouter::new(Arc::new(backend), config.provider.max_concurrent_requests)
        .with_role_validation(config.provider.validate_roles);

    let sessions = Arc::new(FsSessionStore::new(&data_dir).context("failed to initialize session store")?);
    let runs = Arc::new(FsRunStore::new(&data_dir).context("failed to initialize run store")?);
    let tools = Arc::new(builtin_registry());

    Ok(AgentRunner::new(
        Arc::new(router),
        tools,
        sessions,
        config.run_config(working_dir),
    )
    .with_run_store(runs)
    .with_templates(config.templates())
    .with_agent_system_prompt(config.agent.system_prompt.clone()))
}
