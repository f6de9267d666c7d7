//! Console renderer using crossterm
//!
//! Lays the buffer out into screen lines and draws the tail of it above a
//! one-row status bar.

use std::io::{self, Write};

use crossterm::{
    cursor::{Hide, MoveTo, Show},
    event::{DisableBracketedPaste, EnableBracketedPaste},
    execute, queue,
    style::{Attribute, Print, ResetColor, SetAttribute, SetBackgroundColor, SetForegroundColor},
    terminal::{
        self, Clear, ClearType, DisableLineWrap, EnableLineWrap, EnterAlternateScreen,
        LeaveAlternateScreen,
    },
};
use unicode_width::UnicodeWidthChar;

use crate::config::ColorScheme;
use crate::core::{ColorClass, ConsoleState, TerminalBuffer};

const TAB_WIDTH: usize = 8;

/// One screen row of styled text
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScreenLine {
    pub segments: Vec<(String, ColorClass)>,
    /// Display width in columns
    pub width: usize,
}

impl ScreenLine {
    fn push(&mut self, ch: char, width: usize, class: ColorClass) {
        match self.segments.last_mut() {
            Some((text, last)) if *last == class => text.push(ch),
            _ => self.segments.push((ch.to_string(), class)),
        }
        self.width += width;
    }

    /// Plain text of the row
    pub fn text(&self) -> String {
        self.segments.iter().map(|(text, _)| text.as_str()).collect()
    }
}

/// The buffer wrapped to a screen width
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub lines: Vec<ScreenLine>,
    /// Row and column of the caret
    pub caret: (usize, usize),
}

/// Wrap the buffer's spans to `cols` columns and locate the char offset `caret`.
///
/// `\n` ends a row, `\r` and other control characters are not drawn and tabs
/// expand to the next multiple of eight columns.
pub fn layout(buffer: &TerminalBuffer, caret: usize, cols: u16) -> Layout {
    let cols = usize::from(cols.max(1));
    let mut lines = vec![ScreenLine::default()];
    let mut caret_pos = None;
    let mut offset = 0;

    for (text, class) in buffer.spans() {
        for ch in text.chars() {
            if offset == caret {
                caret_pos = Some(cursor_of(&lines, cols));
            }
            offset += 1;

            if ch == '\n' {
                lines.push(ScreenLine::default());
                continue;
            }
            let (ch, count, width) = match ch {
                '\t' => (' ', TAB_WIDTH - lines_last(&lines).width % TAB_WIDTH, 1),
                c if c.is_control() => continue,
                c => (c, 1, c.width().unwrap_or(0).min(cols)),
            };
            for _ in 0..count {
                if lines_last(&lines).width + width > cols {
                    lines.push(ScreenLine::default());
                }
                if let Some(line) = lines.last_mut() {
                    line.push(ch, width, class);
                }
            }
        }
    }

    let caret = caret_pos.unwrap_or_else(|| cursor_of(&lines, cols));
    Layout { lines, caret }
}

fn lines_last(lines: &[ScreenLine]) -> &ScreenLine {
    // `layout` always keeps at least one row
    &lines[lines.len() - 1]
}

/// Where the next char would be drawn
fn cursor_of(lines: &[ScreenLine], cols: usize) -> (usize, usize) {
    let row = lines.len() - 1;
    let width = lines_last(lines).width;
    if width >= cols {
        (row + 1, 0)
    } else {
        (row, width)
    }
}

/// What the status bar shows
#[derive(Debug, Clone, Copy)]
pub struct Status<'a> {
    pub state: ConsoleState,
    pub command: Option<&'a str>,
    pub input_enabled: bool,
}

impl Status<'_> {
    fn text(&self) -> String {
        let state = match self.state {
            ConsoleState::Idle => "idle",
            ConsoleState::Running => "running",
            ConsoleState::Exiting => "exiting",
        };
        let mut text = format!(" [{}]", state);
        if let Some(command) = self.command {
            text.push(' ');
            text.push_str(command);
        }
        if !self.input_enabled {
            text.push_str(" (input locked)");
        }
        text.push_str("  ^K stop  ^R restart  ^L clear  ^Q quit");
        text
    }
}

/// Console renderer
pub struct Renderer {
    scheme: ColorScheme,
    /// Rows scrolled back from the bottom
    scroll_offset: usize,
    /// Row count of the last layout
    line_count: usize,
    initialized: bool,
}

impl Renderer {
    pub fn new(scheme: ColorScheme) -> Self {
        Self {
            scheme,
            scroll_offset: 0,
            line_count: 0,
            initialized: false,
        }
    }

    /// Initialize the terminal for rendering
    pub fn init(&mut self) -> io::Result<()> {
        terminal::enable_raw_mode()?;

        let mut stdout = io::stdout();
        execute!(
            stdout,
            EnterAlternateScreen,
            EnableBracketedPaste,
            DisableLineWrap,
            Clear(ClearType::All),
            MoveTo(0, 0)
        )?;
        self.initialized = true;
        Ok(())
    }

    /// Cleanup the terminal
    pub fn cleanup(&mut self) -> io::Result<()> {
        if !self.initialized {
            return Ok(());
        }
        self.initialized = false;

        let mut stdout = io::stdout();
        let _ = execute!(
            stdout,
            ResetColor,
            SetAttribute(Attribute::Reset),
            Show,
            EnableLineWrap,
            DisableBracketedPaste,
            LeaveAlternateScreen
        );
        let _ = stdout.flush();

        terminal::disable_raw_mode()
    }

    /// Scroll back by `rows`, stopping at the first row
    pub fn scroll_up(&mut self, rows: usize) {
        self.scroll_offset = (self.scroll_offset + rows).min(self.line_count.saturating_sub(1));
    }

    pub fn scroll_down(&mut self, rows: usize) {
        self.scroll_offset = self.scroll_offset.saturating_sub(rows);
    }

    pub fn scroll_to_bottom(&mut self) {
        self.scroll_offset = 0;
    }

    /// Draw the buffer and the status bar
    pub fn render(&mut self, buffer: &TerminalBuffer, caret: usize, status: Status<'_>) -> io::Result<()> {
        let (cols, rows) = Self::size()?;
        let text_rows = usize::from(rows.saturating_sub(1));
        let layout = layout(buffer, caret, cols);

        // The caret may sit one row past the last line
        self.line_count = layout.lines.len().max(layout.caret.0 + 1);
        self.scroll_offset = self.scroll_offset.min(self.line_count.saturating_sub(1));
        let end = self.line_count - self.scroll_offset;
        let start = end.saturating_sub(text_rows);

        let stdout = io::stdout();
        let mut stdout = io::BufWriter::with_capacity(65536, stdout.lock());

        // Begin synchronized update
        write!(stdout, "\x1b[?2026h")?;
        queue!(
            stdout,
            Hide,
            SetBackgroundColor(self.scheme.background.to_crossterm())
        )?;

        for (row, index) in (start..start + text_rows).enumerate() {
            queue!(stdout, MoveTo(0, row as u16), Clear(ClearType::UntilNewLine))?;
            let Some(line) = layout.lines.get(index).filter(|_| index < end) else {
                continue;
            };
            for (text, class) in &line.segments {
                queue!(
                    stdout,
                    SetForegroundColor(self.scheme.color_for(*class).to_crossterm()),
                    Print(text)
                )?;
            }
        }

        self.render_status_bar(&mut stdout, status, cols, rows)?;

        let (caret_row, caret_col) = layout.caret;
        if self.scroll_offset == 0 && caret_row >= start && caret_row < end {
            queue!(
                stdout,
                MoveTo(caret_col as u16, (caret_row - start) as u16),
                Show
            )?;
        }

        // End synchronized update
        write!(stdout, "\x1b[?2026l")?;
        stdout.flush()
    }

    fn render_status_bar<W: Write>(
        &self,
        stdout: &mut W,
        status: Status<'_>,
        cols: u16,
        rows: u16,
    ) -> io::Result<()> {
        let mut text = status.text();
        if self.scroll_offset > 0 {
            text.push_str(&format!("  [↑ {} lines]", self.scroll_offset));
        }

        let mut bar = String::new();
        let mut width = 0;
        for ch in text.chars() {
            let w = ch.width().unwrap_or(0);
            if width + w > usize::from(cols) {
                break;
            }
            bar.push(ch);
            width += w;
        }
        bar.push_str(&" ".repeat(usize::from(cols).saturating_sub(width)));

        queue!(
            stdout,
            MoveTo(0, rows.saturating_sub(1)),
            SetBackgroundColor(self.scheme.status_bar_bg.to_crossterm()),
            SetForegroundColor(self.scheme.status_bar_fg.to_crossterm()),
            Print(bar),
            ResetColor
        )
    }

    /// Get terminal size
    pub fn size() -> io::Result<(u16, u16)> {
        terminal::size()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        let _ = self.cleanup();
    }
}
