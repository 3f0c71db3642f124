use crate::api::PlatformClient;
use crate::commands::{help_text, is_command, parse_command, SlashCommand};
use crate::connection::Dialer;
use crate::render::RenderSink;
use crate::session::{Session, SessionError, TurnOutcome};
use cv_core::ContextEntry;
use cv_sync::{watch, WatchHandle, WatchOptions};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

const EXIT_WORDS: [&str; 2] = ["exit", "quit"];
const PROMPT: &str = "\nyou › ";

#[derive(Debug, Error)]
pub enum ReplError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("prompt unavailable: {0}")]
    Prompt(#[from] ReadlineError),
}

#[derive(Debug, Clone, Default)]
pub struct ReplOptions {
    pub context: Vec<ContextEntry>,
    pub watch: bool,
    /// Routes every line to this agent as an agent task.
    pub agent: Option<String>,
    /// Persistent prompt history; `None` keeps history in memory only.
    pub history: Option<PathBuf>,
}

/// Line editor with history. Reads run on the blocking pool so the runtime
/// keeps driving the watcher while the prompt waits.
pub struct PromptReader {
    editor: Option<DefaultEditor>,
    history: Option<PathBuf>,
}

impl PromptReader {
    pub fn new(history: Option<PathBuf>) -> Result<Self, ReadlineError> {
        let mut editor = DefaultEditor::new()?;
        if let Some(path) = &history {
            if let Err(err) = editor.load_history(path) {
                debug!("history_not_loaded: {}: {err}", path.display());
            }
        }
        Ok(Self {
            editor: Some(editor),
            history,
        })
    }

    /// `None` on end of input, Ctrl-C at the prompt, or a terminal error.
    pub async fn read_line(&mut self, prompt: &str) -> Option<String> {
        let mut editor = self.editor.take()?;
        let prompt = prompt.to_string();
        let joined = tokio::task::spawn_blocking(move || {
            let line = editor.readline(&prompt);
            (editor, line)
        })
        .await;
        let (editor, line) = match joined {
            Ok(result) => result,
            Err(err) => {
                warn!("prompt_task_failed: {err}");
                return None;
            }
        };
        self.editor = Some(editor);
        match line {
            Ok(line) => Some(line),
            Err(ReadlineError::Interrupted) => {
                info!("repl_ctrl_c_at_prompt");
                None
            }
            Err(ReadlineError::Eof) => None,
            Err(err) => {
                warn!("prompt_error: {err}");
                None
            }
        }
    }

    /// Adds `line` to the history and persists it right away.
    pub fn remember(&mut self, line: &str) {
        let Some(editor) = self.editor.as_mut() else {
            return;
        };
        if let Err(err) = editor.add_history_entry(line) {
            debug!("history_add_failed: {err}");
            return;
        }
        let Some(path) = &self.history else {
            return;
        };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(err) = editor.save_history(path) {
            warn!("history_save_failed: {}: {err}", path.display());
        }
    }
}

enum Flow {
    Continue,
    Exit,
}

/// Resolves when the user presses Ctrl-C; used to interrupt a running turn.
pub async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("ctrl_c_unavailable: {err}");
        std::future::pending::<()>().await;
    }
}

/// Reads `paths` as chat context entries, in the order given.
pub fn read_context_files<P: AsRef<Path>>(paths: &[P]) -> io::Result<Vec<ContextEntry>> {
    let mut entries = Vec::with_capacity(paths.len());
    for path in paths {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        entries.push(ContextEntry {
            filename,
            content,
            path: path.display().to_string(),
        });
    }
    Ok(entries)
}

pub async fn run_repl<D, S>(
    session: &mut Session<D, S>,
    client: &PlatformClient,
    options: ReplOptions,
) -> Result<(), ReplError>
where
    D: Dialer,
    S: RenderSink,
{
    let mut prompt = PromptReader::new(options.history.clone())?;
    let target = match &options.agent {
        Some(agent) => format!(" with agent {agent}"),
        None => String::new(),
    };
    let banner = format!(
        "CodeVerse interactive mode{target} in {}. Type /help for commands, exit to quit.",
        session.workspace()
    );
    session.sink_mut().notice(&banner);
    session.connect().await?;

    let watch_handle = if options.watch {
        start_watch(session)
    } else {
        None
    };

    while let Some(line) = prompt.read_line(PROMPT).await {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        prompt.remember(trimmed);
        if EXIT_WORDS.iter().any(|word| trimmed.eq_ignore_ascii_case(word)) {
            break;
        }

        let flow = if is_command(trimmed) {
            match parse_command(trimmed) {
                Ok(command) => handle_command(session, client, command).await,
                Err(err) => {
                    session.sink_mut().error(&err.to_string());
                    Flow::Continue
                }
            }
        } else {
            let result = match &options.agent {
                Some(agent) => session.run_agent_task(agent, trimmed, ctrl_c()).await,
                None => {
                    session
                        .send_message(trimmed, options.context.clone(), ctrl_c())
                        .await
                }
            };
            report_turn(session, result)
        };
        if matches!(flow, Flow::Exit) {
            break;
        }
    }

    if let Some(handle) = watch_handle {
        handle.stop().await;
    }
    session.close().await;
    session.sink_mut().notice("Goodbye!");
    Ok(())
}

fn start_watch<D: Dialer, S: RenderSink>(session: &mut Session<D, S>) -> Option<WatchHandle> {
    match watch(Arc::clone(session.reconciler()), WatchOptions::default()) {
        Ok(handle) => {
            session
                .sink_mut()
                .notice("watching the workspace for changes");
            Some(handle)
        }
        Err(err) => {
            session
                .sink_mut()
                .error(&format!("could not start watcher: {err}"));
            None
        }
    }
}

async fn handle_command<D, S>(
    session: &mut Session<D, S>,
    client: &PlatformClient,
    command: SlashCommand,
) -> Flow
where
    D: Dialer,
    S: RenderSink,
{
    match command {
        SlashCommand::Help => {
            session.sink_mut().text(&help_text());
            session.sink_mut().end_turn();
        }
        SlashCommand::Agents => match client.agents().await {
            Ok(list) => {
                for agent in &list.agents {
                    let marker = if agent.is_active() { "●" } else { "○" };
                    let description = agent.description.as_deref().unwrap_or("No description");
                    session
                        .sink_mut()
                        .notice(&format!("{marker} {} - {description}", agent.name));
                }
                let total = list.total.unwrap_or(list.agents.len() as u64);
                session
                    .sink_mut()
                    .notice(&format!("{total} agents available"));
            }
            Err(err) => session.sink_mut().error(&err.to_string()),
        },
        SlashCommand::Agent { name, task } => {
            let result = session.run_agent_task(&name, &task, ctrl_c()).await;
            return report_turn(session, result);
        }
        SlashCommand::Sync => {
            session.sink_mut().notice("syncing files...");
            let root = session.reconciler().root().to_path_buf();
            let uploaded = session.reconciler().sync_directory(&root).await;
            session
                .sink_mut()
                .notice(&format!("synced {} files", uploaded.len()));
        }
        SlashCommand::Status => {
            let connected = session.connection_state();
            let session_id = session.session_id().unwrap_or("-").to_string();
            session
                .sink_mut()
                .notice(&format!("connection: {connected}, session: {session_id}"));
            match client.status().await {
                Ok(status) => {
                    let server = status.status.as_deref().unwrap_or("unknown");
                    let active = status.active_agents.or(status.agents_available).unwrap_or(0);
                    session
                        .sink_mut()
                        .notice(&format!("server: {server}, active agents: {active}"));
                }
                Err(err) => session.sink_mut().error(&err.to_string()),
            }
        }
        SlashCommand::Clear => session.sink_mut().clear(),
        SlashCommand::Exit => return Flow::Exit,
    }
    Flow::Continue
}

fn report_turn<D: Dialer, S: RenderSink>(
    session: &mut Session<D, S>,
    result: Result<TurnOutcome, SessionError>,
) -> Flow {
    match result {
        Ok(_) => Flow::Continue,
        // Already rendered by the stream renderer.
        Err(SessionError::Remote(_)) => Flow::Continue,
        Err(err) => {
            session.sink_mut().error(&err.to_string());
            if err.is_recoverable() {
                Flow::Continue
            } else {
                Flow::Exit
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_files_keep_order_and_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = dir.path().join("b.py");
        let second = dir.path().join("a.md");
        std::fs::write(&first, "x = 1\n").expect("b");
        std::fs::write(&second, "# A\n").expect("a");

        let entries = read_context_files(&[&first, &second]).expect("read");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].filename, "b.py");
        assert_eq!(entries[0].content, "x = 1\n");
        assert_eq!(entries[1].filename, "a.md");
        assert_eq!(entries[1].path, second.display().to_string());
    }

    #[test]
    fn prompt_history_persists_between_readers() {
        use rustyline::history::History;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("chat_history");
        let mut prompt = PromptReader::new(Some(path.clone())).expect("editor");
        prompt.remember("explain main.rs");
        prompt.remember("/agents");
        let saved = std::fs::read_to_string(&path).expect("history file");
        assert!(saved.contains("explain main.rs"));

        let reloaded = PromptReader::new(Some(path)).expect("editor");
        let editor = reloaded.editor.as_ref().expect("editor present");
        assert_eq!(editor.history().len(), 2);
    }

    #[test]
    fn missing_context_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(read_context_files(&[dir.path().join("nope.txt")]).is_err());
    }
}
