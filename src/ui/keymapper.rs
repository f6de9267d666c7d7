//! Key mapping for console input
//!
//! Converts key events to console actions.

use bitflags::bitflags;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

bitflags! {
    /// Modifier keys
    #[derive(Clone, Copy, Debug, Default, PartialEq)]
    pub struct Modifiers: u8 {
        const SHIFT = 0b0001;
        const CTRL  = 0b0010;
        const ALT   = 0b0100;
    }
}

impl From<KeyModifiers> for Modifiers {
    fn from(mods: KeyModifiers) -> Self {
        let mut result = Modifiers::empty();
        if mods.contains(KeyModifiers::SHIFT) {
            result |= Modifiers::SHIFT;
        }
        if mods.contains(KeyModifiers::CONTROL) {
            result |= Modifiers::CTRL;
        }
        if mods.contains(KeyModifiers::ALT) {
            result |= Modifiers::ALT;
        }
        result
    }
}

/// What a key press asks the console to do
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsoleAction {
    Insert(char),
    Backspace,
    Delete,
    CaretLeft,
    CaretRight,
    CaretHome,
    CaretEnd,
    /// Enter
    Submit,
    RecallPrevious,
    RecallNext,
    /// Empty the input line
    ClearLine,
    /// Clear the whole console
    ClearScreen,
    /// Copy the console text to the clipboard
    Copy,
    /// Insert the clipboard text at the caret
    Paste,
    ScrollUp,
    ScrollDown,
    StopProcess,
    RestartProcess,
    Quit,
}

/// Key mapper for converting key events to console actions
pub struct KeyMapper;

impl KeyMapper {
    /// Map a crossterm KeyEvent to a console action
    pub fn map(event: &KeyEvent) -> Option<ConsoleAction> {
        let mods = Modifiers::from(event.modifiers);

        match event.code {
            KeyCode::Char(ch) => Self::map_char(ch, mods),

            KeyCode::Enter => Some(ConsoleAction::Submit),
            KeyCode::Backspace => Some(ConsoleAction::Backspace),
            KeyCode::Delete => Some(ConsoleAction::Delete),
            KeyCode::Esc => Some(ConsoleAction::ClearLine),
            KeyCode::Tab => Some(ConsoleAction::Insert('\t')),

            // History recall, with or without Ctrl
            KeyCode::Up => Some(ConsoleAction::RecallPrevious),
            KeyCode::Down => Some(ConsoleAction::RecallNext),

            KeyCode::Left => Some(ConsoleAction::CaretLeft),
            KeyCode::Right => Some(ConsoleAction::CaretRight),
            KeyCode::Home => Some(ConsoleAction::CaretHome),
            KeyCode::End => Some(ConsoleAction::CaretEnd),
            KeyCode::PageUp => Some(ConsoleAction::ScrollUp),
            KeyCode::PageDown => Some(ConsoleAction::ScrollDown),

            _ => None,
        }
    }

    /// Map a character with modifiers
    fn map_char(ch: char, mods: Modifiers) -> Option<ConsoleAction> {
        if mods.contains(Modifiers::CTRL) && !mods.contains(Modifiers::ALT) {
            return match ch.to_ascii_lowercase() {
                'c' => Some(ConsoleAction::Copy),
                'v' => Some(ConsoleAction::Paste),
                'l' => Some(ConsoleAction::ClearScreen),
                'k' => Some(ConsoleAction::StopProcess),
                'r' => Some(ConsoleAction::RestartProcess),
                'q' => Some(ConsoleAction::Quit),
                _ => None,
            };
        }
        // AltGr arrives as Ctrl+Alt on Windows and produces plain characters
        Some(ConsoleAction::Insert(ch))
    }
}
