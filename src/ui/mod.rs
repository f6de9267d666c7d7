//! Terminal front end for a console.
//!
//! - **renderer**: Buffer layout and drawing with a status bar
//! - **keymapper**: Keyboard input to console actions

pub mod keymapper;
pub mod renderer;

pub use keymapper::{ConsoleAction, KeyMapper, Modifiers};
pub use renderer::{layout, Layout, Renderer, ScreenLine, Status};
