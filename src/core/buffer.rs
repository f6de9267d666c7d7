//! Console buffer
//!
//! Styled text in two regions: an append-only history region and the trailing
//! input region the user edits. Offsets are in chars; `input_start` is the
//! first offset of the input region.
//!
//! ```text
//! [ history spans ............... | input ]
//! 0                      input_start     len
//! ```

use tracing::debug;

use crate::history::CommandHistory;

/// Logical color of a span. The presentation layer maps it to real colors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorClass {
    /// Process stdout
    Output,
    /// Process stderr and spawn failures
    Error,
    /// Text typed by the user
    Input,
    /// Console notices (start/exit)
    Diagnostic,
    /// Commands written on behalf of the user
    Command,
}

/// A run of text with one color class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    pub text: String,
    pub class: ColorClass,
}

/// An edit of the input region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEdit<'a> {
    /// Insert text at the caret
    Insert(&'a str),
    /// Remove the char before the caret
    Backspace,
    /// Remove the char at the caret
    Delete,
}

/// History region, input region and command recall of one console
#[derive(Debug, Default)]
pub struct TerminalBuffer {
    history: Vec<Span>,
    /// Length of the history region in chars
    history_len: usize,
    input: String,
    commands: CommandHistory,
    /// Last submitted line; output repeating it is dropped until the next submit
    last_input: Option<String>,
}

fn trim_line_end(text: &str) -> &str {
    text.trim_end_matches(&['\r', '\n'][..])
}

/// Byte index of the char at `chars` (or the end)
fn byte_offset(text: &str, chars: usize) -> usize {
    text.char_indices().nth(chars).map_or(text.len(), |(i, _)| i)
}

impl TerminalBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total length in chars
    pub fn len(&self) -> usize {
        self.history_len + self.input.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.history_len == 0 && self.input.is_empty()
    }

    /// First offset of the editable region
    pub fn input_start(&self) -> usize {
        self.history_len
    }

    /// Current text of the input region
    pub fn input_text(&self) -> &str {
        &self.input
    }

    /// The read-only history region
    pub fn history_spans(&self) -> &[Span] {
        &self.history
    }

    /// Everything visible: history spans followed by the input text
    pub fn spans(&self) -> impl Iterator<Item = (&str, ColorClass)> {
        self.history
            .iter()
            .map(|span| (span.text.as_str(), span.class))
            .chain(
                Some((self.input.as_str(), ColorClass::Input)).filter(|(text, _)| !text.is_empty()),
            )
    }

    /// Plain text of the whole buffer
    pub fn text(&self) -> String {
        self.spans().map(|(text, _)| text).collect()
    }

    /// True when the next appended text starts a fresh line
    pub fn at_line_start(&self) -> bool {
        if !self.input.is_empty() {
            return false;
        }
        self.history
            .last()
            .map_or(true, |span| span.text.ends_with('\n'))
    }

    pub fn history(&self) -> &CommandHistory {
        &self.commands
    }

    pub fn last_input(&self) -> Option<&str> {
        self.last_input.as_deref()
    }

    fn push_history(&mut self, text: &str, class: ColorClass) {
        self.history_len += text.chars().count();
        match self.history.last_mut() {
            Some(last) if last.class == class => last.text.push_str(text),
            _ => self.history.push(Span {
                text: text.to_string(),
                class,
            }),
        }
    }

    /// Move pending input into the history region
    fn commit_input(&mut self) {
        if !self.input.is_empty() {
            let input = std::mem::take(&mut self.input);
            self.push_history(&input, ColorClass::Input);
        }
    }

    fn is_echo(&self, text: &str) -> bool {
        match self.last_input.as_deref() {
            Some(last) if !last.is_empty() => trim_line_end(text) == last,
            _ => false,
        }
    }

    /// Append output to the history region.
    ///
    /// The input region always ends up empty and trailing everything, pending
    /// input is committed first. Returns false when the chunk was dropped as
    /// an echo of the last submitted line, or was empty.
    pub fn append_output(&mut self, text: &str, class: ColorClass) -> bool {
        if text.is_empty() {
            return false;
        }
        if self.is_echo(text) {
            debug!("Dropping echo of {:?}", text);
            return false;
        }
        self.commit_input();
        self.push_history(text, class);
        true
    }

    /// Apply an edit at `caret`.
    ///
    /// Edits before `input_start` are refused. Returns the caret after the
    /// edit, or `None` when nothing changed.
    pub fn try_edit_input(&mut self, caret: usize, edit: InputEdit<'_>) -> Option<usize> {
        if caret < self.history_len || caret > self.len() {
            return None;
        }
        let offset = caret - self.history_len;
        let at = byte_offset(&self.input, offset);

        match edit {
            InputEdit::Insert(text) => {
                if text.is_empty() {
                    return None;
                }
                self.input.insert_str(at, text);
                Some(caret + text.chars().count())
            }
            InputEdit::Backspace => {
                if offset == 0 {
                    return None;
                }
                let before = byte_offset(&self.input, offset - 1);
                self.input.replace_range(before..at, "");
                Some(caret - 1)
            }
            InputEdit::Delete => {
                if at == self.input.len() {
                    return None;
                }
                let after = byte_offset(&self.input, offset + 1);
                self.input.replace_range(at..after, "");
                Some(caret)
            }
        }
    }

    /// Take the input region as a submitted line.
    ///
    /// The line (without trailing line separators) moves into the history
    /// region, is added to the command history and returned.
    pub fn submit_input(&mut self) -> String {
        let input = std::mem::take(&mut self.input);
        let line = trim_line_end(&input).to_string();
        self.push_history(&line, ColorClass::Input);
        self.push_history("\n", ColorClass::Input);
        self.remember(&line);
        line
    }

    /// Record a line sent to the process on the user's behalf.
    ///
    /// With `echo` the line is written into the history region in `class`.
    /// Returns the line without trailing line separators.
    pub fn record_input(&mut self, line: &str, class: ColorClass, echo: bool) -> String {
        let line = trim_line_end(line).to_string();
        if echo {
            self.commit_input();
            self.push_history(&line, class);
            self.push_history("\n", class);
        }
        self.remember(&line);
        line
    }

    fn remember(&mut self, line: &str) {
        self.commands.push(line);
        self.last_input = Some(line.to_string());
    }

    /// Replace the input with the previous command. Returns false if there is none.
    pub fn recall_previous(&mut self) -> bool {
        match self.commands.previous() {
            Some(command) => {
                self.input = command.to_string();
                true
            }
            None => false,
        }
    }

    /// Replace the input with the next command, or empty it past the newest one
    pub fn recall_next(&mut self) -> bool {
        match self.commands.next() {
            Some(command) => {
                self.input = command.to_string();
                true
            }
            None => false,
        }
    }

    /// Empty the input region
    pub fn clear_input_zone(&mut self) {
        self.input.clear();
    }

    /// Drop both regions. The command history is kept.
    pub fn clear(&mut self) {
        self.history.clear();
        self.history_len = 0;
        self.input.clear();
    }
}
