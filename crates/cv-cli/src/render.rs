use crossterm::cursor::{MoveTo, MoveToColumn};
use crossterm::style::{Attribute, Color, Print, ResetColor, SetAttribute, SetForegroundColor};
use crossterm::terminal::{Clear, ClearType};
use crossterm::{execute, queue};
use cv_core::{DecodeError, FileAction, FileChange, StreamEvent};
use cv_sync::PullOutcome;
use std::io::{self, Write};
use std::sync::OnceLock;
use syntect::easy::HighlightLines;
use syntect::highlighting::{Theme, ThemeSet};
use syntect::parsing::SyntaxSet;
use syntect::util::{as_24_bit_terminal_escaped, LinesWithEndings};
use tracing::debug;

const FENCE: &str = "```";
const DEFAULT_LANGUAGE: &str = "text";

/// Where rendered output goes. The terminal implementation is
/// [`TerminalSink`]; tests record calls instead.
pub trait RenderSink: Send {
    fn text(&mut self, text: &str);
    fn code_block(&mut self, language: &str, code: &str);
    /// Transient "current activity" line; must not break running text.
    fn activity(&mut self, agent: &str, status: &str);
    fn notice(&mut self, message: &str);
    fn error(&mut self, message: &str);
    fn end_turn(&mut self);
    fn clear(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FenceMode {
    Plain,
    InCodeFence { language: String, buffer: String },
}

/// Turns the event stream of one turn into sink calls, tracking whether the
/// text is inside a fenced code block. Fence markers split across chunks are
/// reassembled by carrying the ambiguous tail into the next chunk.
pub struct StreamRenderer<S> {
    sink: S,
    mode: FenceMode,
    carry: String,
    swallow_newline: bool,
}

impl<S: RenderSink> StreamRenderer<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            mode: FenceMode::Plain,
            carry: String::new(),
            swallow_newline: false,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    pub fn render(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::Chunk { text } => self.push_chunk(text),
            StreamEvent::AgentUpdate { agent_name, status } => {
                self.sink.activity(agent_name, status);
            }
            StreamEvent::FileChange(change) => {
                debug!("render_file_change: {} {}", change.action, change.path);
            }
            StreamEvent::Error { message } => {
                self.flush_pending();
                self.sink.error(message);
                self.sink.end_turn();
            }
            StreamEvent::Complete => self.finish_turn(),
        }
    }

    pub fn file_applied(&mut self, change: &FileChange, outcome: &PullOutcome) {
        let message = match (change.action, outcome) {
            (_, PullOutcome::AlreadyAbsent { relative_path }) => {
                format!("{relative_path} already absent")
            }
            (_, PullOutcome::Deleted { relative_path }) => format!("deleted {relative_path}"),
            (FileAction::Create, PullOutcome::Written(record)) => {
                format!("created {}", record.relative_path)
            }
            (_, PullOutcome::Written(record)) => format!("updated {}", record.relative_path),
        };
        self.sink.notice(&message);
    }

    pub fn file_failed(&mut self, change: &FileChange, reason: &str) {
        self.sink
            .error(&format!("could not {} {}: {reason}", change.action, change.path));
    }

    pub fn report_decode_error(&mut self, err: &DecodeError) {
        self.sink.notice(&format!("skipped frame: {err}"));
    }

    pub fn interrupt(&mut self) {
        self.flush_pending();
        self.sink.notice("interrupted");
        self.sink.end_turn();
    }

    pub fn finish_turn(&mut self) {
        self.flush_pending();
        self.sink.end_turn();
    }

    /// Emits whatever is still held back: carried fence fragments as text,
    /// an unterminated code block as a block.
    fn flush_pending(&mut self) {
        let carry = std::mem::take(&mut self.carry);
        match std::mem::replace(&mut self.mode, FenceMode::Plain) {
            FenceMode::Plain => {
                if !carry.is_empty() {
                    self.sink.text(&carry);
                }
            }
            FenceMode::InCodeFence {
                language,
                mut buffer,
            } => {
                buffer.push_str(&carry);
                if !buffer.is_empty() {
                    self.sink.code_block(&language, &buffer);
                }
            }
        }
        self.swallow_newline = false;
    }

    fn push_chunk(&mut self, chunk: &str) {
        let mut input = std::mem::take(&mut self.carry);
        input.push_str(chunk);
        let mut rest: &str = &input;

        if self.swallow_newline {
            let trimmed = rest.trim_start_matches(is_inline_space);
            if let Some(after_newline) = trimmed.strip_prefix('\n') {
                rest = after_newline;
                self.swallow_newline = false;
            } else if trimmed.is_empty() {
                return;
            } else {
                self.swallow_newline = false;
            }
        }

        loop {
            let mode = std::mem::replace(&mut self.mode, FenceMode::Plain);
            match mode {
                FenceMode::Plain => match rest.find(FENCE) {
                    Some(index) => {
                        self.emit_text(&rest[..index]);
                        let after = &rest[index + FENCE.len()..];
                        match after.find('\n') {
                            Some(newline) => {
                                let language = after[..newline]
                                    .split_whitespace()
                                    .next()
                                    .unwrap_or(DEFAULT_LANGUAGE)
                                    .to_string();
                                self.mode = FenceMode::InCodeFence {
                                    language,
                                    buffer: String::new(),
                                };
                                rest = &after[newline + 1..];
                            }
                            None => {
                                self.carry = rest[index..].to_string();
                                return;
                            }
                        }
                    }
                    None => {
                        let (ready, held) = split_trailing_backticks(rest);
                        self.emit_text(ready);
                        self.carry = held.to_string();
                        return;
                    }
                },
                FenceMode::InCodeFence {
                    language,
                    mut buffer,
                } => match rest.find(FENCE) {
                    Some(index) => {
                        buffer.push_str(&rest[..index]);
                        self.sink.code_block(&language, &buffer);
                        let after = &rest[index + FENCE.len()..];
                        let trimmed = after.trim_start_matches(is_inline_space);
                        if let Some(after_newline) = trimmed.strip_prefix('\n') {
                            rest = after_newline;
                        } else if trimmed.is_empty() {
                            self.swallow_newline = true;
                            return;
                        } else {
                            rest = after;
                        }
                    }
                    None => {
                        let (ready, held) = split_trailing_backticks(rest);
                        buffer.push_str(ready);
                        self.carry = held.to_string();
                        self.mode = FenceMode::InCodeFence { language, buffer };
                        return;
                    }
                },
            }
        }
    }

    fn emit_text(&mut self, text: &str) {
        if !text.is_empty() {
            self.sink.text(text);
        }
    }
}

fn is_inline_space(ch: char) -> bool {
    ch == ' ' || ch == '\t' || ch == '\r'
}

/// Holds back one or two trailing backticks that may start a fence.
fn split_trailing_backticks(text: &str) -> (&str, &str) {
    let trailing = text.bytes().rev().take_while(|byte| *byte == b'`').count();
    let held = trailing.min(2);
    text.split_at(text.len() - held)
}

struct HighlightAssets {
    syntax_set: SyntaxSet,
    theme: Theme,
}

fn highlight_assets() -> &'static HighlightAssets {
    static ASSETS: OnceLock<HighlightAssets> = OnceLock::new();
    ASSETS.get_or_init(|| {
        let syntax_set = SyntaxSet::load_defaults_newlines();
        let mut theme_set = ThemeSet::load_defaults();
        let theme = theme_set
            .themes
            .remove("base16-ocean.dark")
            .or_else(|| theme_set.themes.into_values().next())
            .unwrap_or_default();
        HighlightAssets { syntax_set, theme }
    })
}

/// Highlights `code` for a 24-bit terminal with a line-number gutter. Unknown
/// languages fall back to plain text.
pub fn highlight_code(language: &str, code: &str) -> String {
    let assets = highlight_assets();
    let syntax = assets
        .syntax_set
        .find_syntax_by_token(language)
        .or_else(|| assets.syntax_set.find_syntax_by_extension(language))
        .unwrap_or_else(|| assets.syntax_set.find_syntax_plain_text());
    let mut highlighter = HighlightLines::new(syntax, &assets.theme);
    let width = code.lines().count().max(1).to_string().len();
    let mut out = String::new();
    for (index, line) in LinesWithEndings::from(code).enumerate() {
        out.push_str(&format!("\x1b[2m{:>width$} │\x1b[0m ", index + 1));
        match highlighter.highlight_line(line, &assets.syntax_set) {
            Ok(ranges) => out.push_str(&as_24_bit_terminal_escaped(&ranges, false)),
            Err(_) => out.push_str(line),
        }
        out.push_str("\x1b[0m");
        if !line.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}

/// Renders to stdout with crossterm styling. Log output never goes here.
pub struct TerminalSink {
    out: io::Stdout,
    at_line_start: bool,
    activity_shown: bool,
    pending_activity: Option<String>,
}

impl TerminalSink {
    pub fn new() -> Self {
        Self {
            out: io::stdout(),
            at_line_start: true,
            activity_shown: false,
            pending_activity: None,
        }
    }

    fn clear_activity(&mut self) {
        if self.activity_shown {
            let _ = queue!(self.out, MoveToColumn(0), Clear(ClearType::CurrentLine));
            self.activity_shown = false;
        }
    }

    fn show_activity(&mut self, label: &str) {
        let _ = queue!(
            self.out,
            MoveToColumn(0),
            Clear(ClearType::CurrentLine),
            SetAttribute(Attribute::Dim),
            Print(label),
            SetAttribute(Attribute::Reset)
        );
        self.activity_shown = true;
        let _ = self.out.flush();
    }

    fn ensure_line_start(&mut self) {
        if !self.at_line_start {
            let _ = queue!(self.out, Print("\n"));
            self.at_line_start = true;
        }
    }

    fn line(&mut self, color: Color, prefix: &str, message: &str) {
        self.clear_activity();
        self.ensure_line_start();
        let _ = queue!(
            self.out,
            SetForegroundColor(color),
            Print(prefix),
            Print(message),
            ResetColor,
            Print("\n")
        );
        let _ = self.out.flush();
        self.show_pending_activity();
    }

    fn show_pending_activity(&mut self) {
        if self.at_line_start {
            if let Some(label) = self.pending_activity.take() {
                self.show_activity(&label);
            }
        }
    }
}

impl Default for TerminalSink {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderSink for TerminalSink {
    fn text(&mut self, text: &str) {
        self.clear_activity();
        let _ = queue!(self.out, Print(text));
        self.at_line_start = text.ends_with('\n');
        let _ = self.out.flush();
        self.show_pending_activity();
    }

    fn code_block(&mut self, language: &str, code: &str) {
        self.clear_activity();
        self.ensure_line_start();
        let _ = queue!(
            self.out,
            SetAttribute(Attribute::Dim),
            Print(format!("── {language} ──\n")),
            SetAttribute(Attribute::Reset),
            Print(highlight_code(language, code))
        );
        self.at_line_start = true;
        let _ = self.out.flush();
        self.show_pending_activity();
    }

    fn activity(&mut self, agent: &str, status: &str) {
        let label = if status.is_empty() {
            format!("⋯ {agent}")
        } else {
            format!("⋯ {agent}: {status}")
        };
        if self.at_line_start {
            self.show_activity(&label);
        } else {
            self.pending_activity = Some(label);
        }
    }

    fn notice(&mut self, message: &str) {
        self.line(Color::Yellow, "• ", message);
    }

    fn error(&mut self, message: &str) {
        self.line(Color::Red, "error: ", message);
    }

    fn end_turn(&mut self) {
        self.clear_activity();
        self.pending_activity = None;
        self.ensure_line_start();
        let _ = self.out.flush();
    }

    fn clear(&mut self) {
        self.activity_shown = false;
        self.pending_activity = None;
        self.at_line_start = true;
        let _ = execute!(self.out, Clear(ClearType::All), MoveTo(0, 0));
    }
}
