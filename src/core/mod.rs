//! Core console components.
//!
//! - **process**: child process wrapper, stdio reader threads, exit detection
//! - **buffer**: styled history region plus the editable input region
//! - **controller**: single dispatch context wiring the two together
//!
//! # Architecture
//!
//! ```text
//! ConsoleController
//! ├── ProcessSession (child process + stdout/stderr readers)
//! │     └── ProcessEvent channel ──► pump()
//! └── TerminalBuffer
//!     ├── history spans (read-only)
//!     ├── input region (editable)
//!     └── CommandHistory (recall)
//! ```

pub mod buffer;
pub mod controller;
pub mod process;

pub use buffer::{ColorClass, InputEdit, Span, TerminalBuffer};
pub use controller::{
    ConsoleController, ConsoleHandle, ConsoleListener, ConsoleState, KeepAlive, NoRestart,
    RestartPolicy,
};
pub use process::{
    ExitInfo, LaunchSpec, OutputEvent, OutputSource, ProcessError, ProcessEvent, ProcessSession,
    StartOutcome, LINE_ENDING,
};
