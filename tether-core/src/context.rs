//! Context Window Manager
//!
//! Owns one conversation's messages for the duration of a run: the persisted
//! history tail that fits the token budget, plus the messages produced by the
//! current run. Builds the prompt sent to the provider and reports token
//! usage snapshots.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::normalize::MERGE_SEPARATOR;
use crate::session_log::SessionLog;
use crate::types::{Message, Role, SkillMetadata};

/// Placeholder replaced by the user's prompt in the user template.
pub const USER_MESSAGE_PLACEHOLDER: &str = "{{ user_message }}";

pub const DEFAULT_SYSTEM_TEMPLATE: &str = "You are a helpful assistant.";

// ---------------------------------------------------------------------------
// Budget and snapshot types
// ---------------------------------------------------------------------------

/// Token budget inputs for one run.
#[derive(Debug, Clone, Default)]
pub struct BudgetParams {
    pub context_size: usize,
    pub system_content: String,
    pub system_tokens: usize,
    pub tool_tokens: usize,
    pub user_prompt_tokens: usize,
}

impl BudgetParams {
    /// Tokens left for persisted history, saturating at zero.
    pub fn history_budget(&self) -> usize {
        self.context_size
            .saturating_sub(self.system_tokens)
            .saturating_sub(self.tool_tokens)
            .saturating_sub(self.user_prompt_tokens)
    }
}

/// Where a message in the built context came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageSource {
    System,
    History,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageStats {
    pub role: Role,
    pub tokens: usize,
    pub source: MessageSource,
}

/// Token accounting for the context as it would be sent right now.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub context_size: usize,
    pub system_tokens: usize,
    pub tool_tokens: usize,
    pub history_tokens: usize,
    pub memory_tokens: usize,
    pub total_tokens: usize,
    /// Negative when the context is over budget.
    pub remaining_tokens: i64,
    pub history_budget: usize,
    pub history_messages: usize,
    pub memory_messages: usize,
    pub total_messages: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<MessageStats>,
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

/// Prompt templates applied by the window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplates {
    pub system: Option<String>,
    /// Must contain [`USER_MESSAGE_PLACEHOLDER`] to include the prompt.
    pub user: Option<String>,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self {
            system: Some(DEFAULT_SYSTEM_TEMPLATE.to_string()),
            user: Some(USER_MESSAGE_PLACEHOLDER.to_string()),
        }
    }
}

impl PromptTemplates {
    /// No system preamble and the prompt passed through verbatim.
    pub fn none() -> Self {
        Self {
            system: None,
            user: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Context Window
// ---------------------------------------------------------------------------

/// Manages the conversation context for one session during a run.
pub struct ContextWindow {
    log: Arc<SessionLog>,
    templates: PromptTemplates,
    agent_system_prompt: Option<String>,
    active_skill: Option<SkillMetadata>,

    /// Persisted messages loaded at run start.
    history: Vec<Message>,
    /// Messages added during the current run.
    memory: Vec<Message>,

    system_content: String,
    context_size: usize,
    system_tokens: usize,
    tool_tokens: usize,
}

impl std::fmt::Debug for ContextWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextWindow")
            .field("log", &self.log.path())
            .field("history", &self.history.len())
            .field("memory", &self.memory.len())
            .field("context_size", &self.context_size)
            .finish()
    }
}

impl ContextWindow {
    pub fn new(log: Arc<SessionLog>, templates: PromptTemplates) -> Self {
        Self {
            log,
            templates,
            agent_system_prompt: None,
            active_skill: None,
            history: Vec::new(),
            memory: Vec::new(),
            system_content: String::new(),
            context_size: 0,
            system_tokens: 0,
            tool_tokens: 0,
        }
    }

    pub fn session_log(&self) -> &Arc<SessionLog> {
        &self.log
    }

    pub fn set_agent_system_prompt(&mut self, prompt: Option<String>) {
        self.agent_system_prompt = prompt.filter(|p| !p.trim().is_empty());
    }

    pub fn set_active_skill(&mut self, skill: Option<SkillMetadata>) {
        self.active_skill = skill;
    }

    pub fn active_skill(&self) -> Option<&SkillMetadata> {
        self.active_skill.as_ref()
    }

    /// System prompt for the next run: the system template, then the agent's
    /// own prompt, then a marker for the active skill.
    pub fn system_content(&self) -> String {
        let parts: Vec<&str> = [self.templates.system.as_deref(), self.agent_system_prompt.as_deref()]
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .collect();
        let mut content = parts.join(MERGE_SEPARATOR);

        if let Some(skill) = &self.active_skill {
            if !content.is_empty() {
                content.push_str("\n\n");
            }
            content.push_str(&format!(
                "<active-skill name={:?} path={:?} />",
                skill.name,
                skill.path.display().to_string()
            ));
        }
        content
    }

    /// Apply the user template to a prompt.
    pub fn render_user_message(&self, prompt: &str) -> String {
        match &self.templates.user {
            Some(template) => template.replace(USER_MESSAGE_PLACEHOLDER, prompt),
            None => prompt.to_string(),
        }
    }

    /// Reset the window for a new run and load as much history as fits.
    ///
    /// On a load failure the history is left empty and the error returned;
    /// the window is still usable.
    pub fn start_run(&mut self, params: BudgetParams) -> Result<()> {
        let budget = params.history_budget();

        self.context_size = params.context_size;
        self.system_tokens = params.system_tokens;
        self.tool_tokens = params.tool_tokens;
        self.system_content = params.system_content;
        self.history.clear();
        self.memory.clear();

        self.history = self.log.load_tail(budget)?;
        Ok(())
    }

    /// Record a message produced during this run.
    ///
    /// The message is kept in memory even when persisting it fails.
    pub fn add_message(&mut self, msg: Message) -> Result<()> {
        let result = self.log.append(&msg);
        self.memory.push(msg);
        result
    }

    /// The message sequence for the next provider call.
    pub fn build_context(&self) -> Vec<Message> {
        let mut out = Vec::with_capacity(1 + self.history.len() + self.memory.len());
        out.push(Message::system(self.system_content.clone(), self.system_tokens));
        out.extend(self.history.iter().cloned());
        out.extend(self.memory.iter().cloned());
        out
    }

    /// Drop this run's in-memory messages; they remain in the session log.
    pub fn complete_run(&mut self) {
        self.memory.clear();
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn memory(&self) -> &[Message] {
        &self.memory
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        let history_tokens = token_sum(&self.history);
        let memory_tokens = token_sum(&self.memory);
        let total_tokens = self
            .system_tokens
            .saturating_add(self.tool_tokens)
            .saturating_add(history_tokens)
            .saturating_add(memory_tokens);

        let history_budget = self
            .context_size
            .saturating_sub(self.system_tokens)
            .saturating_sub(self.tool_tokens)
            .saturating_sub(memory_tokens);

        let stats = |source: MessageSource| {
            move |m: &Message| MessageStats {
                role: m.role,
                tokens: m.tokens,
                source,
            }
        };

        let mut messages = Vec::with_capacity(1 + self.history.len() + self.memory.len());
        messages.push(MessageStats {
            role: Role::System,
            tokens: self.system_tokens,
            source: MessageSource::System,
        });
        messages.extend(self.history.iter().map(stats(MessageSource::History)));
        messages.extend(self.memory.iter().map(stats(MessageSource::Memory)));

        ContextSnapshot {
            context_size: self.context_size,
            system_tokens: self.system_tokens,
            tool_tokens: self.tool_tokens,
            history_tokens,
            memory_tokens,
            total_tokens,
            remaining_tokens: signed(self.context_size).saturating_sub(signed(total_tokens)),
            history_budget,
            history_messages: self.history.len(),
            memory_messages: self.memory.len(),
            total_messages: 1 + self.history.len() + self.memory.len(),
            messages,
        }
    }
}

/// Token counts come from persisted logs, so sums saturate instead of
/// overflowing.
fn token_sum(messages: &[Message]) -> usize {
    messages.iter().fold(0, |acc, m| acc.saturating_add(m.tokens))
}

fn signed(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn window(dir: &TempDir) -> ContextWindow {
        let log = Arc::new(SessionLog::new(dir.path().join("s.jsonl")));
        ContextWindow::new(log, PromptTemplates::default())
    }

    fn params(context_size: usize, system: usize, tools: usize, prompt: usize) -> BudgetParams {
        BudgetParams {
            context_size,
            system_content: "sys".into(),
            system_tokens: system,
            tool_tokens: tools,
            user_prompt_tokens: prompt,
        }
    }

    #[test]
    fn history_budget_saturates() {
        assert_eq!(params(1000, 100, 200, 50).history_budget(), 650);
        assert_eq!(params(100, 80, 80, 80).history_budget(), 0);
    }

    #[test]
    fn start_run_loads_tail_within_budget() {
        let dir = TempDir::new().unwrap();
        let log = SessionLog::new(dir.path().join("s.jsonl"));
        for text in ["first", "second", "third", "fourth"] {
            log.append(&Message::user(text, 50)).unwrap();
        }

        let mut w = window(&dir);
        w.start_run(params(200, 40, 30, 10)).unwrap();
        let loaded: Vec<_> = w.history().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(loaded, ["third", "fourth"]);
    }

    #[test]
    fn build_context_orders_system_history_memory() {
        let dir = TempDir::new().unwrap();
        let mut w = window(&dir);
        w.add_message(Message::user("earlier", 3)).unwrap();
        w.complete_run();

        w.start_run(params(1000, 5, 0, 0)).unwrap();
        w.add_message(Message::user("now", 2)).unwrap();

        let ctx = w.build_context();
        let roles: Vec<_> = ctx.iter().map(|m| (m.role, m.content.as_str())).collect();
        assert_eq!(
            roles,
            [(Role::System, "sys"), (Role::User, "earlier"), (Role::User, "now")]
        );
        assert_eq!(ctx[0].tokens, 5);
    }

    #[test]
    fn add_message_persists_before_returning() {
        let dir = TempDir::new().unwrap();
        let mut w = window(&dir);
        w.add_message(Message::user("hello", 1)).unwrap();
        assert_eq!(w.session_log().load_all().unwrap().len(), 1);
    }

    #[test]
    fn persistence_failure_keeps_memory() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(SessionLog::new(dir.path().join("missing").join("s.jsonl")));
        let mut w = ContextWindow::new(log, PromptTemplates::default());
        assert!(w.add_message(Message::user("kept", 1)).is_err());
        assert_eq!(w.memory().len(), 1);
        assert_eq!(w.build_context().len(), 2);
    }

    #[test]
    fn complete_run_clears_memory_only() {
        let dir = TempDir::new().unwrap();
        let mut w = window(&dir);
        w.start_run(params(1000, 0, 0, 0)).unwrap();
        w.add_message(Message::user("a", 1)).unwrap();
        w.complete_run();
        assert!(w.memory().is_empty());
        assert_eq!(w.session_log().load_all().unwrap().len(), 1);
    }

    #[test]
    fn snapshot_accounts_every_source() {
        let dir = TempDir::new().unwrap();
        let log = SessionLog::new(dir.path().join("s.jsonl"));
        log.append(&Message::user("old", 30)).unwrap();

        let mut w = window(&dir);
        w.start_run(params(100, 20, 10, 0)).unwrap();
        w.add_message(Message::user("new", 50)).unwrap();

        let snap = w.snapshot();
        assert_eq!(snap.history_tokens, 30);
        assert_eq!(snap.memory_tokens, 50);
        assert_eq!(snap.total_tokens, 110);
        assert_eq!(snap.remaining_tokens, -10);
        assert_eq!(snap.history_budget, 20);
        assert_eq!(snap.total_messages, 3);
        let sources: Vec<_> = snap.messages.iter().map(|m| m.source).collect();
        assert_eq!(
            sources,
            [MessageSource::System, MessageSource::History, MessageSource::Memory]
        );
    }

    #[test]
    fn snapshot_saturates_huge_token_counts() {
        let dir = TempDir::new().unwrap();
        let log = SessionLog::new(dir.path().join("s.jsonl"));
        log.append(&Message::user("old", usize::MAX)).unwrap();

        let mut w = window(&dir);
        w.start_run(params(100, 20, 10, 0)).unwrap();
        w.add_message(Message::user("new", usize::MAX)).unwrap();

        let snap = w.snapshot();
        assert_eq!(snap.history_tokens, usize::MAX);
        assert_eq!(snap.memory_tokens, usize::MAX);
        assert_eq!(snap.total_tokens, usize::MAX);
        assert_eq!(snap.remaining_tokens, 100 - i64::MAX);
    }

    #[test]
    fn system_content_joins_template_prompt_and_skill() {
        let dir = TempDir::new().unwrap();
        let mut w = window(&dir);
        assert_eq!(w.system_content(), DEFAULT_SYSTEM_TEMPLATE);

        w.set_agent_system_prompt(Some("Be terse.".into()));
        w.set_active_skill(Some(SkillMetadata {
            name: "review".into(),
            path: PathBuf::from("/skills/review.md"),
        }));
        assert_eq!(
            w.system_content(),
            "You are a helpful assistant.\n\n---\n\nBe terse.\n\n\
             <active-skill name=\"review\" path=\"/skills/review.md\" />"
        );
    }

    #[test]
    fn system_content_without_template() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(SessionLog::new(dir.path().join("s.jsonl")));
        let mut w = ContextWindow::new(log, PromptTemplates::none());
        assert_eq!(w.system_content(), "");
        w.set_agent_system_prompt(Some("Only this.".into()));
        assert_eq!(w.system_content(), "Only this.");
    }

    #[test]
    fn renders_user_template() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(SessionLog::new(dir.path().join("s.jsonl")));
        let w = ContextWindow::new(
            log.clone(),
            PromptTemplates {
                system: None,
                user: Some("<q>{{ user_message }}</q>".into()),
            },
        );
        assert_eq!(w.render_user_message("hi"), "<q>hi</q>");

        let plain = ContextWindow::new(log, PromptTemplates::none());
        assert_eq!(plain.render_user_message("hi"), "hi");
    }
}
