use std::future::Future;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tracing::{debug, error};

use tether_core::config::EngineConfig;
use tether_core::ids::{BatchId, SessionId};
use tether_core::protocol::{ProposedToolCall, RunCommand, RunEvent};
use tether_core::runner::{RunRequest, SkillInvocation};

use crate::commands::RunArgs;
use crate::runtime::build_runner;

/// Output longer than this is cut when echoed to the terminal.
const ECHO_LIMIT: usize = 400;

enum Outcome {
    Completed,
    Cancelled,
    Failed(String),
}

pub async fn run_prompt(args: RunArgs, config: EngineConfig) -> Result<()> {
    match config.validate() {
        Ok(warnings) => {
            for w in warnings {
                eprintln!("⚠ {}", w);
            }
        }
        Err(e) => {
            error!("configuration validation failed: {:#}", e);
            eprintln!("   Run `tether config init` to set up your configuration.");
            return Err(e);
        }
    }

    let prompt = args.prompt.join(" ");
    let session_id = args.session.map(SessionId::from);
    if prompt.trim().is_empty() && session_id.is_none() {
        bail!("a prompt is required to start a new session");
    }

    let skill = load_skill(args.skill, args.skill_file.as_deref()).await?;
    let working_dir = std::env::current_dir().context("failed to determine working directory")?;
    let runner = build_runner(&config, working_dir)?;

    let mut run = runner
        .start_run(RunRequest {
            prompt,
            session_id,
            skill,
            working_dir: None,
        })
        .await?;

    let stdin = BufReader::new(tokio::io::stdin());
    let mut approver = Approver::new(stdin, args.yes);
    let mut outcome = None;

    loop {
        let event = tokio::select! {
            event = run.events.recv() => event,
            Ok(()) = tokio::signal::ctrl_c() => {
                eprintln!("\n⏹ cancelling at the next approval prompt");
                send(&run.commands, RunCommand::Cancel).await;
                continue;
            }
        };
        let Some(event) = event else { break };

        match event {
            RunEvent::RunStarted { run_id, .. } => {
                eprintln!("▶ run {} (session {})", run_id, run.session_id);
            }
            RunEvent::TurnCompleted { response, snapshot, .. } => {
                if !response.tool_calls.is_empty() && !response.content.trim().is_empty() {
                    eprintln!("{}", response.content.trim());
                }
                eprintln!(
                    "   context: {}/{} tokens ({} history, {} this run)",
                    snapshot.total_tokens,
                    snapshot.context_size,
                    snapshot.history_messages,
                    snapshot.memory_messages
                );
            }
            RunEvent::ToolBatchProposed { batch_id, calls, .. } => {
                for cmd in approver.decide(&batch_id, &calls, interrupted()).await? {
                    send(&run.commands, cmd).await;
                }
            }
            RunEvent::ToolStarted { call_id, name, .. } => {
                eprintln!("⚙ {name} ({call_id})");
            }
            RunEvent::ToolCompleted { output, .. } => {
                eprintln!("  ✓ {}", echo(&output));
            }
            RunEvent::ToolFailed { error, .. } => {
                eprintln!("  ✗ {}", echo(&error));
            }
            RunEvent::ToolBatchCompleted { .. } => {}
            RunEvent::RunCompleted { response, .. } => {
                println!("{}", response.content);
                outcome = Some(Outcome::Completed);
            }
            RunEvent::RunCancelled { .. } => outcome = Some(Outcome::Cancelled),
            RunEvent::RunFailed { error, .. } => outcome = Some(Outcome::Failed(error)),
        }
    }

    match outcome {
        Some(Outcome::Completed) => Ok(()),
        Some(Outcome::Cancelled) => bail!("run cancelled (session {})", run.session_id),
        Some(Outcome::Failed(e)) => bail!("run failed: {e}"),
        None => bail!("run ended without a result"),
    }
}

/// Resolves on Ctrl-C; never, when the signal cannot be watched.
async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        debug!(err = %e, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

async fn send(commands: &tokio::sync::mpsc::Sender<RunCommand>, cmd: RunCommand) {
    if let Err(e) = commands.send(cmd).await {
        debug!(command = ?e.0, "run no longer accepts commands");
    }
}

fn echo(text: &str) -> String {
    let first = text.lines().next().unwrap_or_default();
    let mut line: String = first.chars().take(ECHO_LIMIT).collect();
    if line.len() < text.trim_end().len() {
        line.push_str(" …");
    }
    line
}

// ---------------------------------------------------------------------------
// Skills
// ---------------------------------------------------------------------------

async fn load_skill(name: Option<String>, file: Option<&Path>) -> Result<Option<SkillInvocation>> {
    let Some(file) = file else {
        return Ok(None);
    };

    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("failed to read skill file: {}", file.display()))?;

    let base = file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    Ok(Some(SkillInvocation {
        name: name.unwrap_or_else(|| skill_name(file)),
        path: base,
        content: content.trim().to_string(),
    }))
}

/// `skills/review/SKILL.md` is named after its directory; anything else
/// after the file.
fn skill_name(file: &Path) -> String {
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "skill".to_string());
    if stem.eq_ignore_ascii_case("skill") {
        if let Some(dir) = file.parent().and_then(Path::file_name) {
            return dir.to_string_lossy().into_owned();
        }
    }
    stem
}

// ---------------------------------------------------------------------------
// Approval prompt
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
enum Answer {
    Approve,
    ApproveAll,
    Deny(Option<String>),
    Quit,
}

fn parse_answer(line: &str) -> Option<Answer> {
    let line = line.trim();
    let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    match word.to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(Answer::Approve),
        "a" | "all" => Some(Answer::ApproveAll),
        "" | "n" | "no" => Some(Answer::Deny((!rest.is_empty()).then(|| rest.to_string()))),
        "q" | "quit" => Some(Answer::Quit),
        _ => None,
    }
}

/// Turns proposed batches into decision commands, asking on the terminal
/// unless everything is pre-approved.
struct Approver<R> {
    lines: Lines<R>,
    approve_all: bool,
}

impl<R: AsyncBufRead + Unpin> Approver<R> {
    fn new(input: R, approve_all: bool) -> Self {
        Self {
            lines: input.lines(),
            approve_all,
        }
    }

    /// Ask about each call in turn. `interrupt` firing while waiting for an
    /// answer quits, like end of input.
    async fn decide(
        &mut self,
        batch_id: &BatchId,
        calls: &[ProposedToolCall],
        interrupt: impl Future<Output = ()>,
    ) -> Result<Vec<RunCommand>> {
        if self.approve_all {
            for call in calls {
                eprintln!("⚙ approved {} {}", call.name, call.arguments_json);
            }
            return Ok(vec![RunCommand::ApproveAll {
                batch_id: batch_id.clone(),
            }]);
        }

        tokio::pin!(interrupt);
        let mut commands = Vec::with_capacity(calls.len());
        for (i, call) in calls.iter().enumerate() {
            eprintln!("? [{}/{}] {} {}", i + 1, calls.len(), call.name, call.arguments_json);
            if let Some(preview) = &call.preview {
                eprintln!("  {preview}");
            }

            let answer = loop {
                eprint!("  approve? [y]es / [n]o [reason] / [a]ll / [q]uit: ");
                let line = tokio::select! {
                    line = self.lines.next_line() => line?,
                    () = &mut interrupt => {
                        eprintln!();
                        break Answer::Quit;
                    }
                };
                let Some(line) = line else {
                    break Answer::Quit;
                };
                match parse_answer(&line) {
                    Some(answer) => break answer,
                    None => eprintln!("  unrecognized answer: {}", line.trim()),
                }
            };

            match answer {
                Answer::Approve => commands.push(RunCommand::ApproveTool {
                    call_id: call.call_id.clone(),
                }),
                Answer::Deny(reason) => commands.push(RunCommand::DenyTool {
                    call_id: call.call_id.clone(),
                    reason,
                }),
                Answer::ApproveAll => {
                    commands.push(RunCommand::ApproveAll {
                        batch_id: batch_id.clone(),
                    });
                    break;
                }
                Answer::Quit => {
                    commands.push(RunCommand::Cancel);
                    break;
                }
            }
        }
        Ok(commands)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
