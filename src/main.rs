//! pipeterm - a line-oriented console for command-line programs
//!
//! Runs a program over plain pipes and shows its output in a scrollback view
//! with an editable input line below it. Lines are sent to the program's
//! stdin when Enter is pressed.
//!
//! # Quick Start
//!
//! ```text
//! pipeterm                         # Platform shell
//! pipeterm -c git -a "log -5"      # One-shot command
//! pipeterm -c python -a -i -d src  # Interactive interpreter in src/
//! ```
//!
//! # Keybindings
//!
//! | Key | Action |
//! |-----|--------|
//! | Enter | Send the input line |
//! | Up/Down | Recall previous/next command |
//! | Esc | Clear the input line |
//! | PageUp/PageDown | Scroll |
//! | Ctrl+C / Ctrl+V | Copy console text / paste |
//! | Ctrl+L | Clear the console |
//! | Ctrl+K | Stop the process |
//! | Ctrl+R | Restart the process |
//! | Ctrl+Q | Quit |

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crossterm::event::{self, Event, KeyEventKind};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use pipeterm::config::{config_dir, Config};
use pipeterm::core::{ConsoleController, InputEdit, KeepAlive, LaunchSpec};
use pipeterm::ui::{ConsoleAction, KeyMapper, Renderer, Status};

/// Command line options
#[derive(Debug, Default)]
struct Args {
    command: Option<String>,
    args: Option<String>,
    working_dir: Option<PathBuf>,
    no_restart: bool,
    diagnostics: bool,
    verbose: bool,
    save_config: bool,
}

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_version() {
    eprintln!("pipeterm {}", VERSION);
}

fn print_help() {
    eprintln!("pipeterm {} - A line-oriented console for command-line programs", VERSION);
    eprintln!();
    eprintln!("Usage: pipeterm [OPTIONS]");
    eprintln!();
    eprintln!("Process options:");
    eprintln!("  (default)             From config.toml or the platform shell");
    eprintln!("  -c, --command <CMD>   Program to run");
    eprintln!("  -a, --args <ARGS>     Argument string for the program");
    eprintln!("  -d, --dir <DIR>       Working directory");
    eprintln!("  --no-restart          Do not restart the program when it exits");
    eprintln!();
    eprintln!("Other options:");
    eprintln!("  --diagnostics         Show start/exit notices in the console");
    eprintln!("  --verbose             Debug logging");
    eprintln!("  --save-config         Write the effective settings to config.toml and exit");
    eprintln!("  -v, --version         Show version");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("Keys:");
    eprintln!("  Enter                 Send the input line");
    eprintln!("  Up/Down               Recall previous/next command");
    eprintln!("  Esc                   Clear the input line");
    eprintln!("  PageUp/PageDown       Scroll");
    eprintln!("  Ctrl+C, Ctrl+V        Copy console text, paste");
    eprintln!("  Ctrl+L                Clear the console");
    eprintln!("  Ctrl+K                Stop the process");
    eprintln!("  Ctrl+R                Restart the process");
    eprintln!("  Ctrl+Q                Quit");
    eprintln!();
    eprintln!("Configuration: ~/.pipeterm/config.toml");
    eprintln!("Log file:      ~/.pipeterm/pipeterm.log");
}

fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = env::args().collect();
    let mut parsed = Args::default();
    let mut i = 1;

    // Value of the option at `i`
    let value = |i: usize, name: &str| -> Result<String, String> {
        args.get(i)
            .cloned()
            .ok_or_else(|| format!("Missing value for {}", name))
    };

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                print_version();
                std::process::exit(0);
            }
            "-c" | "--command" => {
                i += 1;
                parsed.command = Some(value(i, "--command")?);
            }
            "-a" | "--args" => {
                i += 1;
                parsed.args = Some(value(i, "--args")?);
            }
            "-d" | "--dir" => {
                i += 1;
                parsed.working_dir = Some(PathBuf::from(value(i, "--dir")?));
            }
            "--no-restart" => parsed.no_restart = true,
            "--diagnostics" => parsed.diagnostics = true,
            "--verbose" => parsed.verbose = true,
            "--save-config" => parsed.save_config = true,
            arg => {
                return Err(format!("Unknown argument: {}. Use -h for help.", arg));
            }
        }
        i += 1;
    }

    Ok(parsed)
}

/// Log to `~/.pipeterm/pipeterm.log`; the terminal belongs to the console view
fn init_logging(verbose: bool) {
    let log_path = config_dir()
        .map(|dir| dir.join("pipeterm.log"))
        .unwrap_or_else(|| PathBuf::from("pipeterm.log"));

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok();

    if let Some(file) = log_file {
        let level = if verbose { "debug" } else { "info" };
        let filter =
            EnvFilter::try_from_env("PIPETERM_LOG").unwrap_or_else(|_| EnvFilter::new(level));
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

fn main() -> anyhow::Result<()> {
    let args = match parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            std::process::exit(1);
        }
    };

    init_logging(args.verbose);
    info!("pipeterm {} starting...", VERSION);

    run(args)
}

/// Command line values override the config file
fn merge(mut config: Config, args: Args) -> Config {
    if args.command.is_some() {
        config.command = args.command;
        // Arguments in the file belong to the file's command
        config.args = None;
        config.working_dir = None;
    }
    if args.args.is_some() {
        config.args = args.args;
    }
    if args.working_dir.is_some() {
        config.working_dir = args.working_dir;
    }
    if args.no_restart {
        config.auto_restart = false;
    }
    if args.diagnostics {
        config.show_diagnostics = true;
    }
    config
}

fn run(args: Args) -> anyhow::Result<()> {
    let save_config = args.save_config;
    let config = merge(Config::load(), args);
    if save_config {
        let path = config.save()?;
        info!("Saved configuration to {}", path.display());
        eprintln!("Saved configuration to {}", path.display());
        return Ok(());
    }
    let launch = config.launch_spec();
    info!("Launch: {}", launch.command_line());

    let mut console = ConsoleController::new();
    console.set_show_diagnostics(config.show_diagnostics);
    if config.auto_restart {
        console.set_restart_policy(KeepAlive::new(launch.clone()));
    }

    let mut renderer = Renderer::new(config.get_color_scheme());
    renderer.init()?;

    console.start_process(launch.clone());

    let mut app = App {
        console,
        launch,
        caret: 0,
        clipboard: None,
    };
    let result = app.run_main_loop(&mut renderer);

    app.console.stop_process();
    renderer.cleanup()?;
    info!("pipeterm exiting");
    result
}

/// Clipboard text as input: `\n` line breaks, no trailing break
fn paste_text(text: &str) -> String {
    text.replace("\r\n", "\n")
        .replace('\r', "\n")
        .trim_end_matches('\n')
        .to_string()
}

struct App {
    console: ConsoleController,
    launch: LaunchSpec,
    /// Caret as a char offset into the buffer
    caret: usize,
    clipboard: Option<arboard::Clipboard>,
}

impl App {
    /// Main event loop
    fn run_main_loop(&mut self, renderer: &mut Renderer) -> anyhow::Result<()> {
        let poll_timeout = Duration::from_millis(10);
        let mut needs_render = true;

        loop {
            if self.console.pump() {
                needs_render = true;
            }
            self.clamp_caret();

            if needs_render {
                let command = self.console.session().last_command().map(str::to_string);
                let status = Status {
                    state: self.console.state(),
                    command: command.as_deref(),
                    input_enabled: self.console.is_input_enabled(),
                };
                renderer.render(self.console.buffer(), self.caret, status)?;
                needs_render = false;
            }

            if !event::poll(poll_timeout)? {
                continue;
            }
            match event::read()? {
                Event::Key(key_event) => {
                    // Only process key press events
                    if key_event.kind != KeyEventKind::Press {
                        continue;
                    }
                    let Some(action) = KeyMapper::map(&key_event) else {
                        continue;
                    };
                    if action == ConsoleAction::Quit {
                        info!("Quit requested");
                        return Ok(());
                    }
                    self.apply(action, renderer);
                    needs_render = true;
                }
                Event::Paste(text) => {
                    self.insert(&text);
                    renderer.scroll_to_bottom();
                    needs_render = true;
                }
                Event::Resize(cols, rows) => {
                    info!("Resize: {}x{}", cols, rows);
                    needs_render = true;
                }
                _ => {}
            }
        }
    }

    /// Keep the caret inside the input region
    fn clamp_caret(&mut self) {
        let buffer = self.console.buffer();
        if self.caret < buffer.input_start() || self.caret > buffer.len() {
            self.caret = buffer.len();
        }
    }

    fn edit(&mut self, edit: InputEdit<'_>) {
        if let Some(caret) = self.console.edit_input(self.caret, edit) {
            self.caret = caret;
        }
    }

    fn insert(&mut self, text: &str) {
        self.edit(InputEdit::Insert(&paste_text(text)));
    }

    fn apply(&mut self, action: ConsoleAction, renderer: &mut Renderer) {
        let page = Renderer::size()
            .map(|(_, rows)| usize::from(rows.saturating_sub(2)).max(1))
            .unwrap_or(10);

        match action {
            ConsoleAction::ScrollUp => return renderer.scroll_up(page),
            ConsoleAction::ScrollDown => return renderer.scroll_down(page),
            ConsoleAction::Copy => return self.copy(),
            _ => renderer.scroll_to_bottom(),
        }

        let buffer = self.console.buffer();
        let (input_start, len) = (buffer.input_start(), buffer.len());

        match action {
            ConsoleAction::Insert(ch) => {
                let mut bytes = [0; 4];
                self.edit(InputEdit::Insert(ch.encode_utf8(&mut bytes)));
            }
            ConsoleAction::Backspace => self.edit(InputEdit::Backspace),
            ConsoleAction::Delete => self.edit(InputEdit::Delete),
            ConsoleAction::CaretLeft => self.caret = self.caret.saturating_sub(1).max(input_start),
            ConsoleAction::CaretRight => self.caret = (self.caret + 1).min(len),
            ConsoleAction::CaretHome => self.caret = input_start,
            ConsoleAction::CaretEnd => self.caret = len,
            ConsoleAction::Submit => {
                self.console.submit();
                self.caret = self.console.buffer().len();
            }
            ConsoleAction::RecallPrevious => {
                if self.console.recall_previous() {
                    self.caret = self.console.buffer().len();
                }
            }
            ConsoleAction::RecallNext => {
                if self.console.recall_next() {
                    self.caret = self.console.buffer().len();
                }
            }
            ConsoleAction::ClearLine => {
                if self.console.clear_input_zone() {
                    self.caret = self.console.buffer().len();
                }
            }
            ConsoleAction::ClearScreen => {
                self.console.clear();
                self.caret = 0;
            }
            ConsoleAction::Paste => self.paste(),
            ConsoleAction::StopProcess => self.console.stop_process(),
            ConsoleAction::RestartProcess => {
                self.console.stop_process();
                self.console.start_process(self.launch.clone());
            }
            ConsoleAction::ScrollUp
            | ConsoleAction::ScrollDown
            | ConsoleAction::Copy
            | ConsoleAction::Quit => {}
        }
    }

    fn clipboard(&mut self) -> Option<&mut arboard::Clipboard> {
        if self.clipboard.is_none() {
            match arboard::Clipboard::new() {
                Ok(clipboard) => self.clipboard = Some(clipboard),
                Err(e) => warn!("Clipboard unavailable: {}", e),
            }
        }
        self.clipboard.as_mut()
    }

    fn copy(&mut self) {
        let text = self.console.buffer().text();
        if let Some(clipboard) = self.clipboard() {
            if let Err(e) = clipboard.set_text(text) {
                warn!("Copy failed: {}", e);
            }
        }
    }

    fn paste(&mut self) {
        let text = match self.clipboard().map(|clipboard| clipboard.get_text()) {
            Some(Ok(text)) => text,
            Some(Err(e)) => {
                warn!("Paste failed: {}", e);
                return;
            }
            None => return,
        };
        self.insert(&text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_file() {
        let config = Config::from_toml(
            r#"
            command = "python"
            args = "-i"
            working_dir = "/srv"
            "#,
        )
        .unwrap();
        let args = Args {
            command: Some("git".to_string()),
            no_restart: true,
            ..Args::default()
        };

        let merged = merge(config, args);
        assert_eq!(merged.command.as_deref(), Some("git"));
        assert!(merged.args.is_none());
        assert!(merged.working_dir.is_none());
        assert!(!merged.auto_restart);
    }

    #[test]
    fn test_paste_text() {
        assert_eq!(paste_text("git status\r\n"), "git status");
        assert_eq!(paste_text("a\r\nb\rc"), "a\nb\nc");
        assert_eq!(paste_text("日本語"), "日本語");
    }

    #[test]
    fn test_merged_config_saves() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let args = Args {
            command: Some("git".to_string()),
            args: Some("log -5".to_string()),
            no_restart: true,
            save_config: true,
            ..Args::default()
        };

        merge(Config::default(), args).save_to(&path).unwrap();
        let saved = Config::load_from(&path);
        assert_eq!(saved.launch_spec().command_line(), "git log -5");
        assert!(!saved.auto_restart);
    }

    #[test]
    fn test_file_values_kept() {
        let config = Config::from_toml("command = \"python\"\nargs = \"-i\"").unwrap();
        let args = Args {
            working_dir: Some(PathBuf::from("/tmp")),
            diagnostics: true,
            ..Args::default()
        };

        let merged = merge(config, args);
        assert_eq!(merged.launch_spec().command_line(), "python -i");
        assert_eq!(merged.working_dir, Some(PathBuf::from("/tmp")));
        assert!(merged.show_diagnostics);
        assert!(merged.auto_restart);
    }
}
