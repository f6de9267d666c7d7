//! pipeterm - an embeddable line-oriented console
//!
//! Runs one command-line process per console over plain pipes, streams its
//! stdout and stderr into a scrollback buffer, and sends the lines typed in
//! the buffer's input region to the process's stdin.
//!
//! # Example
//!
//! ```no_run
//! use pipeterm::core::{ConsoleController, InputEdit, LaunchSpec};
//!
//! let mut console = ConsoleController::new();
//! console.start_process(LaunchSpec::new("sh"));
//!
//! let caret = console.buffer().len();
//! console.edit_input(caret, InputEdit::Insert("echo hello"));
//! console.submit();
//!
//! loop {
//!     if console.pump() {
//!         println!("{}", console.buffer().text());
//!     }
//! #   break;
//! }
//! ```
//!
//! The buffer is not terminal emulation: escape sequences are kept as text and
//! output is only ever appended.

pub mod config;
pub mod core;
pub mod history;
pub mod ui;
