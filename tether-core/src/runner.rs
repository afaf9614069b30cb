//! Agent Runner
//!
//! Session wiring around the engine: resolves or creates the session,
//! builds its context window, applies skill and project-instruction prompt
//! prefixes, then forwards the run's events to the caller while logging the
//! run's lifecycle and recording its status.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::agent_loop::{AgentEngine, RunConfig};
use crate::context::{ContextWindow, PromptTemplates};
use crate::ids::{RunId, SessionId};
use crate::normalize::MERGE_SEPARATOR;
use crate::protocol::{RunCommand, RunEvent, EVENT_QUEUE_CAPACITY};
use crate::provider::ProviderRouter;
use crate::session::{RunRecord, RunStatus, RunStore, SessionStore};
use crate::session_log::SessionLog;
use crate::tool::ToolExecutor;
use crate::types::SkillMetadata;

/// File in the working directory whose content is prepended to prompts.
pub const PROJECT_INSTRUCTIONS_FILE: &str = "AGENTS.md";

/// A skill applied to one run.
#[derive(Debug, Clone)]
pub struct SkillInvocation {
    pub name: String,
    pub path: PathBuf,
    /// Rendered skill body.
    pub content: String,
}

impl SkillInvocation {
    fn format_content(&self) -> String {
        format!(
            "[Skill: {}]\nBase path: {}\n\n{}",
            self.name,
            self.path.display(),
            self.content
        )
    }

    fn metadata(&self) -> SkillMetadata {
        SkillMetadata {
            name: self.name.clone(),
            path: self.path.clone(),
        }
    }
}

/// Everything needed to start one run.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub prompt: String,
    /// Continue this session; a new one is created when `None`.
    pub session_id: Option<SessionId>,
    pub skill: Option<SkillInvocation>,
    /// Overrides the configured working directory.
    pub working_dir: Option<PathBuf>,
}

/// Caller's side of a run started through the runner.
pub struct ActiveRun {
    pub run_id: RunId,
    pub session_id: SessionId,
    pub commands: mpsc::Sender<RunCommand>,
    /// Closes after the terminal event.
    pub events: mpsc::Receiver<RunEvent>,
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

pub struct AgentRunner {
    router: Arc<ProviderRouter>,
    tools: Arc<dyn ToolExecutor>,
    sessions: Arc<dyn SessionStore>,
    runs: Option<Arc<dyn RunStore>>,
    config: RunConfig,
    templates: PromptTemplates,
    agent_system_prompt: Option<String>,
    /// One log per session file, shared by every live run on that session.
    logs: Mutex<HashMap<PathBuf, Weak<SessionLog>>>,
}

impl AgentRunner {
    pub fn new(
        router: Arc<ProviderRouter>,
        tools: Arc<dyn ToolExecutor>,
        sessions: Arc<dyn SessionStore>,
        config: RunConfig,
    ) -> Self {
        Self {
            router,
            tools,
            sessions,
            runs: None,
            config,
            templates: PromptTemplates::default(),
            agent_system_prompt: None,
            logs: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_run_store(mut self, runs: Arc<dyn RunStore>) -> Self {
        self.runs = Some(runs);
        self
    }

    pub fn with_templates(mut self, templates: PromptTemplates) -> Self {
        self.templates = templates;
        self
    }

    pub fn with_agent_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.agent_system_prompt = prompt;
        self
    }

    /// Shared log for a session file.
    ///
    /// The runner keeps only weak references; a log lives as long as some
    /// run or caller holds it, and dead entries are pruned here.
    pub fn session_log(&self, path: &Path) -> Arc<SessionLog> {
        let mut logs = self.logs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(log) = logs.get(path).and_then(Weak::upgrade) {
            return log;
        }

        logs.retain(|_, log| log.strong_count() > 0);
        let log = Arc::new(SessionLog::new(path));
        logs.insert(path.to_path_buf(), Arc::downgrade(&log));
        log
    }

    /// Cached entries and how many of them are still in use.
    #[cfg(test)]
    fn cached_logs(&self) -> (usize, usize) {
        let logs = self.logs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let live = logs.values().filter(|log| log.strong_count() > 0).count();
        (logs.len(), live)
    }

    pub async fn start_run(&self, request: RunRequest) -> Result<ActiveRun> {
        let (session_id, path) = match &request.session_id {
            None => self.sessions.create().await.context("failed to create session")?,
            Some(id) => {
                let path = self
                    .sessions
                    .ensure(id)
                    .await
                    .with_context(|| format!("failed to open session {id}"))?;
                (id.clone(), path)
            }
        };

        let mut window = ContextWindow::new(self.session_log(&path), self.templates.clone());
        window.set_agent_system_prompt(self.agent_system_prompt.clone());

        let mut prompt = request.prompt;
        if let Some(skill) = &request.skill {
            window.set_active_skill(Some(skill.metadata()));
            prompt = format!("{}{}{}", skill.format_content(), MERGE_SEPARATOR, prompt);
        }

        let working_dir = request
            .working_dir
            .unwrap_or_else(|| self.config.working_dir.clone());
        if !prompt.is_empty() {
            if let Some(instructions) = read_project_instructions(&working_dir).await {
                prompt = format!(
                    "<project-instructions>\n{instructions}\n</project-instructions>\n\n{prompt}"
                );
            }
        }

        let config = RunConfig {
            session_id: Some(session_id.clone()),
            working_dir,
            ..self.config.clone()
        };
        let engine = AgentEngine::new(self.router.clone(), self.tools.clone(), config);
        let handle = engine.start(prompt, window);

        let (out_tx, out_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        tokio::spawn(forward_events(
            handle.events,
            out_tx,
            self.runs.clone(),
            session_id.clone(),
        ));

        Ok(ActiveRun {
            run_id: handle.run_id,
            session_id,
            commands: handle.commands,
            events: out_rx,
        })
    }
}

async fn read_project_instructions(working_dir: &Path) -> Option<String> {
    let path = working_dir.join(PROJECT_INSTRUCTIONS_FILE);
    match tokio::fs::read_to_string(&path).await {
        Ok(content) => Some(content.trim().to_string()),
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => {
            warn!(path = %path.display(), err = %e, "failed to read project instructions");
            None
        }
    }
}

/// Relay events to the caller until the terminal one.
async fn forward_events(
    mut events: mpsc::Receiver<RunEvent>,
    out: mpsc::Sender<RunEvent>,
    runs: Option<Arc<dyn RunStore>>,
    session_id: SessionId,
) {
    let mut turn = 0usize;

    while let Some(event) = events.recv().await {
        let status = match &event {
            RunEvent::RunStarted { run_id, .. } => {
                info!(run_id = %run_id, session_id = %session_id, "run started");
                Some((RunStatus::Started, None))
            }
            RunEvent::TurnCompleted { run_id, snapshot, .. } => {
                turn += 1;
                info!(
                    run_id = %run_id,
                    turn,
                    context_size = snapshot.context_size,
                    total_tokens = snapshot.total_tokens,
                    remaining_tokens = snapshot.remaining_tokens,
                    history_tokens = snapshot.history_tokens,
                    history_messages = snapshot.history_messages,
                    total_messages = snapshot.total_messages,
                    "context snapshot"
                );
                None
            }
            RunEvent::RunCompleted { run_id, .. } => {
                info!(run_id = %run_id, "run completed");
                Some((RunStatus::Completed, None))
            }
            RunEvent::RunCancelled { run_id } => {
                info!(run_id = %run_id, "run cancelled");
                Some((RunStatus::Cancelled, None))
            }
            RunEvent::RunFailed { run_id, error } => {
                info!(run_id = %run_id, err = %error, "run failed");
                Some((RunStatus::Failed, Some(error.clone())))
            }
            _ => None,
        };

        if let (Some(store), Some((status, error))) = (&runs, status) {
            let mut record = RunRecord::new(event.run_id().clone(), Some(session_id.clone()), status);
            record.error = error;
            if let Err(e) = store.record(record).await {
                warn!(run_id = %event.run_id(), err = %e, "failed to record run status");
            }
        }

        let terminal = event.is_terminal();
        if out.send(event).await.is_err() {
            debug!(session_id = %session_id, "run event receiver dropped");
            return;
        }
        if terminal {
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
