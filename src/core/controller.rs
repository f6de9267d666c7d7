//! Console controller
//!
//! Owns one `ProcessSession` and one `TerminalBuffer` and is the only place
//! the buffer is mutated. Process events and commands from other threads are
//! queued on channels and applied on the thread that calls `pump`; calling
//! the controller's methods directly runs them inline.

use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::buffer::{ColorClass, InputEdit, TerminalBuffer};
use super::process::{ExitInfo, LaunchSpec, OutputEvent, ProcessEvent, ProcessSession, StartOutcome};

/// Lifecycle of the console's process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleState {
    Idle,
    Running,
    /// Kill requested, waiting for the OS to confirm
    Exiting,
}

/// Observer of console activity. All methods default to no-ops.
pub trait ConsoleListener {
    fn on_output(&mut self, _event: &OutputEvent) {}
    /// A line was written to the process
    fn on_input(&mut self, _line: &str) {}
    fn on_exit(&mut self, _exit: &ExitInfo) {}
    fn on_state_changed(&mut self, _state: ConsoleState) {}
}

/// Decides whether a process is started again after it exits
pub trait RestartPolicy {
    fn restart(&mut self, exit: &ExitInfo) -> Option<LaunchSpec>;
}

/// Never restart
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRestart;

impl RestartPolicy for NoRestart {
    fn restart(&mut self, _exit: &ExitInfo) -> Option<LaunchSpec> {
        None
    }
}

/// Keep a process alive: start `launch` again whenever a run ends on its own.
/// Runs ended by `stop_process` stay stopped.
#[derive(Debug, Clone)]
pub struct KeepAlive {
    pub launch: LaunchSpec,
}

impl KeepAlive {
    pub fn new(launch: LaunchSpec) -> Self {
        Self { launch }
    }
}

impl RestartPolicy for KeepAlive {
    fn restart(&mut self, exit: &ExitInfo) -> Option<LaunchSpec> {
        if exit.killed {
            None
        } else {
            Some(self.launch.clone())
        }
    }
}

/// Requests marshaled from other threads
#[derive(Debug, Clone)]
enum ConsoleCommand {
    Start(LaunchSpec),
    Stop,
    WriteInput {
        text: String,
        class: ColorClass,
        echo: bool,
    },
    Clear,
    SetInputEnabled(bool),
}

/// Cloneable, thread-safe handle to a controller.
///
/// Requests run on the controller's thread during its next `pump`. Each
/// method returns false once the controller is gone.
#[derive(Debug, Clone)]
pub struct ConsoleHandle {
    tx: Sender<ConsoleCommand>,
}

impl ConsoleHandle {
    fn send(&self, command: ConsoleCommand) -> bool {
        self.tx.send(command).is_ok()
    }

    pub fn start_process(&self, launch: LaunchSpec) -> bool {
        self.send(ConsoleCommand::Start(launch))
    }

    pub fn stop_process(&self) -> bool {
        self.send(ConsoleCommand::Stop)
    }

    pub fn write_input(&self, text: impl Into<String>, class: ColorClass, echo: bool) -> bool {
        self.send(ConsoleCommand::WriteInput {
            text: text.into(),
            class,
            echo,
        })
    }

    pub fn clear(&self) -> bool {
        self.send(ConsoleCommand::Clear)
    }

    pub fn set_input_enabled(&self, enabled: bool) -> bool {
        self.send(ConsoleCommand::SetInputEnabled(enabled))
    }
}

/// One console: process lifecycle, buffer and the policies between them
pub struct ConsoleController {
    session: ProcessSession,
    buffer: TerminalBuffer,
    state: ConsoleState,
    /// Caller gate, blocks keystrokes even while running
    input_enabled: bool,
    show_diagnostics: bool,
    listeners: Vec<Box<dyn ConsoleListener + Send>>,
    restart: Box<dyn RestartPolicy + Send>,
    commands_tx: Sender<ConsoleCommand>,
    commands_rx: Receiver<ConsoleCommand>,
    /// Buffer changed since the last `pump`
    dirty: bool,
}

impl Default for ConsoleController {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleController {
    pub fn new() -> Self {
        let (commands_tx, commands_rx) = mpsc::channel();
        Self {
            session: ProcessSession::new(),
            buffer: TerminalBuffer::new(),
            state: ConsoleState::Idle,
            input_enabled: true,
            show_diagnostics: false,
            listeners: Vec::new(),
            restart: Box::new(NoRestart),
            commands_tx,
            commands_rx,
            dirty: false,
        }
    }

    pub fn handle(&self) -> ConsoleHandle {
        ConsoleHandle {
            tx: self.commands_tx.clone(),
        }
    }

    pub fn add_listener(&mut self, listener: impl ConsoleListener + Send + 'static) {
        self.listeners.push(Box::new(listener));
    }

    pub fn set_restart_policy(&mut self, policy: impl RestartPolicy + Send + 'static) {
        self.restart = Box::new(policy);
    }

    pub fn set_show_diagnostics(&mut self, show: bool) {
        self.show_diagnostics = show;
    }

    pub fn state(&self) -> ConsoleState {
        self.state
    }

    pub fn buffer(&self) -> &TerminalBuffer {
        &self.buffer
    }

    pub fn session(&self) -> &ProcessSession {
        &self.session
    }

    pub fn is_process_running(&self) -> bool {
        self.session.is_process_running()
    }

    pub fn is_input_enabled(&self) -> bool {
        self.input_enabled
    }

    pub fn set_input_enabled(&mut self, enabled: bool) {
        self.input_enabled = enabled;
    }

    /// Keystrokes are accepted only while running and enabled
    pub fn accepts_input(&self) -> bool {
        self.state == ConsoleState::Running && self.input_enabled
    }

    fn set_state(&mut self, state: ConsoleState) {
        if self.state == state {
            return;
        }
        debug!("Console state {:?} -> {:?}", self.state, state);
        self.state = state;
        for listener in &mut self.listeners {
            listener.on_state_changed(state);
        }
    }

    fn diagnostic(&mut self, message: &str) {
        if !self.show_diagnostics {
            return;
        }
        let text = if self.buffer.at_line_start() {
            format!("{}\n", message)
        } else {
            format!("\n{}\n", message)
        };
        if self.buffer.append_output(&text, ColorClass::Diagnostic) {
            self.dirty = true;
        }
    }

    /// Start a process. Refused unless idle; a failed spawn leaves the console idle.
    pub fn start_process(&mut self, launch: LaunchSpec) -> bool {
        if self.state != ConsoleState::Idle {
            warn!("Start of {} refused, console is {:?}", launch.program, self.state);
            self.diagnostic(&format!(
                "Can't start {} - another process is running",
                launch.program
            ));
            return false;
        }

        match launch.args.as_deref().filter(|args| !args.trim().is_empty()) {
            Some(args) => self.diagnostic(&format!(
                "Preparing to run {} with arguments {}.",
                launch.program, args
            )),
            None => self.diagnostic(&format!("Preparing to run {}.", launch.program)),
        }

        match self.session.start(&launch) {
            StartOutcome::Started => {
                self.diagnostic(&format!("Started {}", launch.program));
                self.set_state(ConsoleState::Running);
                true
            }
            StartOutcome::AlreadyRunning => {
                self.diagnostic(&format!(
                    "Can't start {} - another process is running",
                    launch.program
                ));
                false
            }
            StartOutcome::Failed => {
                // Show the reason right away
                self.drain_process_events();
                false
            }
        }
    }

    /// Kill the process and wait for it. No-op unless running.
    ///
    /// Output that arrived before the kill and the exit itself are applied
    /// before this returns, leaving the console idle.
    pub fn stop_process(&mut self) {
        if self.state != ConsoleState::Running {
            return;
        }
        self.set_state(ConsoleState::Exiting);
        self.session.stop_process();
        self.drain_process_events();
        if self.state == ConsoleState::Exiting {
            self.set_state(ConsoleState::Idle);
        }
    }

    /// Send a line to the process on the user's behalf.
    ///
    /// With `echo` the line is shown in `class` first, for processes that do
    /// not echo their input. The line always goes to the command history.
    pub fn write_input(&mut self, text: &str, class: ColorClass, echo: bool) -> bool {
        if self.state != ConsoleState::Running {
            debug!("Input {:?} dropped, console is {:?}", text, self.state);
            self.diagnostic("No process is running");
            return false;
        }
        let line = self.buffer.record_input(text, class, echo);
        if echo {
            self.dirty = true;
        }
        self.forward(&line)
    }

    /// Enter: take the input region and send it to the process
    pub fn submit(&mut self) -> Option<String> {
        if !self.accepts_input() {
            return None;
        }
        let line = self.buffer.submit_input();
        self.dirty = true;
        self.forward(&line);
        Some(line)
    }

    fn forward(&mut self, line: &str) -> bool {
        match self.session.write_input(line) {
            Ok(true) => {
                for listener in &mut self.listeners {
                    listener.on_input(line);
                }
                true
            }
            Ok(false) => {
                self.diagnostic("No process is running");
                false
            }
            Err(e) => {
                error!("{}", e);
                if self
                    .buffer
                    .append_output(&format!("{}\n", e), ColorClass::Error)
                {
                    self.dirty = true;
                }
                false
            }
        }
    }

    /// Edit the input region at `caret`; see `TerminalBuffer::try_edit_input`
    pub fn edit_input(&mut self, caret: usize, edit: InputEdit<'_>) -> Option<usize> {
        if !self.accepts_input() {
            return None;
        }
        let caret = self.buffer.try_edit_input(caret, edit)?;
        self.dirty = true;
        Some(caret)
    }

    pub fn recall_previous(&mut self) -> bool {
        if !self.accepts_input() || !self.buffer.recall_previous() {
            return false;
        }
        self.dirty = true;
        true
    }

    pub fn recall_next(&mut self) -> bool {
        if !self.accepts_input() || !self.buffer.recall_next() {
            return false;
        }
        self.dirty = true;
        true
    }

    pub fn clear_input_zone(&mut self) -> bool {
        if !self.accepts_input() {
            return false;
        }
        self.buffer.clear_input_zone();
        self.dirty = true;
        true
    }

    /// Clear the screen. Command history and the process are untouched.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.dirty = true;
    }

    /// Apply queued commands and process events on this thread.
    ///
    /// Returns true when the buffer changed since the last call.
    pub fn pump(&mut self) -> bool {
        while let Ok(command) = self.commands_rx.try_recv() {
            self.execute(command);
        }
        self.drain_process_events();
        std::mem::take(&mut self.dirty)
    }

    /// Like `pump`, but waits up to `timeout` for the first process event
    pub fn pump_timeout(&mut self, timeout: Duration) -> bool {
        if let Some(event) = self.session.recv_timeout(timeout) {
            self.handle_process_event(event);
        }
        self.pump()
    }

    fn execute(&mut self, command: ConsoleCommand) {
        match command {
            ConsoleCommand::Start(launch) => {
                self.start_process(launch);
            }
            ConsoleCommand::Stop => self.stop_process(),
            ConsoleCommand::WriteInput { text, class, echo } => {
                self.write_input(&text, class, echo);
            }
            ConsoleCommand::Clear => self.clear(),
            ConsoleCommand::SetInputEnabled(enabled) => self.set_input_enabled(enabled),
        }
    }

    fn drain_process_events(&mut self) {
        while let Some(event) = self.session.try_recv() {
            self.handle_process_event(event);
        }
    }

    fn handle_process_event(&mut self, event: ProcessEvent) {
        match event {
            ProcessEvent::Output(output) => self.on_output(output),
            ProcessEvent::Exited(exit) => self.on_exited(exit),
        }
    }

    fn on_output(&mut self, output: OutputEvent) {
        let class = if output.source.is_error() {
            ColorClass::Error
        } else {
            ColorClass::Output
        };
        if self.buffer.append_output(&output.content, class) {
            self.dirty = true;
        }
        for listener in &mut self.listeners {
            listener.on_output(&output);
        }
    }

    fn on_exited(&mut self, exit: ExitInfo) {
        info!("{} exited (code {:?}, killed {})", exit.command, exit.code, exit.killed);
        // An exit drained by `stop_process` stays stopped, even one that raced the kill
        let stop_requested = self.state == ConsoleState::Exiting;
        self.diagnostic(&format!("{} exited.", exit.command));
        self.set_state(ConsoleState::Idle);
        for listener in &mut self.listeners {
            listener.on_exit(&exit);
        }

        if stop_requested {
            debug!("Not restarting {}, stop was requested", exit.command);
            return;
        }
        if let Some(launch) = self.restart.restart(&exit) {
            info!("Restarting {}", launch.command_line());
            self.start_process(launch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    const TIMEOUT: Duration = Duration::from_secs(10);

    /// Records listener callbacks as strings
    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    impl ConsoleListener for Recorder {
        fn on_output(&mut self, event: &OutputEvent) {
            self.0.lock().unwrap().push(format!("output:{}", event.content));
        }

        fn on_input(&mut self, line: &str) {
            self.0.lock().unwrap().push(format!("input:{}", line));
        }

        fn on_exit(&mut self, exit: &ExitInfo) {
            self.0
                .lock()
                .unwrap()
                .push(format!("exit:{:?}:{}", exit.code, exit.killed));
        }

        fn on_state_changed(&mut self, state: ConsoleState) {
            self.0.lock().unwrap().push(format!("state:{:?}", state));
        }
    }

    fn pump_until(console: &mut ConsoleController, done: impl Fn(&ConsoleController) -> bool) {
        let deadline = Instant::now() + TIMEOUT;
        while !done(console) {
            assert!(Instant::now() < deadline, "timed out waiting for the console");
            console.pump_timeout(Duration::from_millis(20));
        }
    }

    #[test]
    fn test_idle_console_ignores_input() {
        let mut console = ConsoleController::new();
        assert_eq!(console.state(), ConsoleState::Idle);
        assert!(!console.accepts_input());
        assert_eq!(console.edit_input(0, InputEdit::Insert("dir")), None);
        assert_eq!(console.submit(), None);
        assert!(!console.write_input("dir", ColorClass::Command, true));
        assert!(!console.recall_previous());

        console.stop_process();
        assert_eq!(console.state(), ConsoleState::Idle);
        assert!(!console.pump());
        assert!(console.buffer().is_empty());
        assert!(console.buffer().history().is_empty());
    }

    #[test]
    fn test_failed_start_stays_idle() {
        let mut console = ConsoleController::new();
        let recorder = Recorder::default();
        console.add_listener(recorder.clone());

        assert!(!console.start_process(LaunchSpec::new("/nonexistent/pipeterm-missing-binary")));
        assert_eq!(console.state(), ConsoleState::Idle);

        let spans = console.buffer().history_spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].class, ColorClass::Error);
        assert!(spans[0].text.contains("pipeterm-missing-binary"));
        assert!(console.pump());
        assert!(!recorder.events().iter().any(|e| e.starts_with("state:")));
    }

    #[test]
    fn test_diagnostics_for_failed_start() {
        let mut console = ConsoleController::new();
        console.set_show_diagnostics(true);
        console.start_process(LaunchSpec::new("/nonexistent/tool").with_args("--flag"));

        let spans = console.buffer().history_spans();
        assert_eq!(spans[0].class, ColorClass::Diagnostic);
        assert_eq!(
            spans[0].text,
            "Preparing to run /nonexistent/tool with arguments --flag.\n"
        );
        assert_eq!(spans[1].class, ColorClass::Error);
    }

    #[test]
    #[cfg(unix)]
    fn test_start_rejected_while_running() {
        let mut console = ConsoleController::new();
        console.set_show_diagnostics(true);
        assert!(console.start_process(LaunchSpec::new("sleep").with_args("30")));
        assert_eq!(console.state(), ConsoleState::Running);

        assert!(!console.start_process(LaunchSpec::new("cat")));
        assert_eq!(console.state(), ConsoleState::Running);
        assert!(console.is_process_running());
        assert_eq!(console.session().last_command(), Some("sleep 30"));
        assert!(console
            .buffer()
            .text()
            .contains("Can't start cat - another process is running\n"));

        console.stop_process();
        assert_eq!(console.state(), ConsoleState::Idle);
        assert!(!console.is_process_running());
        assert!(console.buffer().text().ends_with("sleep 30 exited.\n"));
    }

    #[test]
    #[cfg(unix)]
    fn test_natural_exit_notifies_and_locks_input() {
        let mut console = ConsoleController::new();
        let recorder = Recorder::default();
        console.add_listener(recorder.clone());

        assert!(console.start_process(LaunchSpec::new("sh").with_args("-c 'echo bye; exit 2'")));
        pump_until(&mut console, |c| c.state() == ConsoleState::Idle);

        assert!(!console.accepts_input());
        assert_eq!(console.buffer().text(), "bye\n");
        assert_eq!(
            recorder.events(),
            vec![
                "state:Running".to_string(),
                "output:bye\n".to_string(),
                "state:Idle".to_string(),
                "exit:Some(2):false".to_string(),
            ]
        );
    }

    #[test]
    #[cfg(unix)]
    fn test_stop_applies_exit_before_returning() {
        let mut console = ConsoleController::new();
        let recorder = Recorder::default();
        console.add_listener(recorder.clone());

        assert!(console.start_process(LaunchSpec::new("cat")));
        console.stop_process();

        assert_eq!(console.state(), ConsoleState::Idle);
        let events = recorder.events();
        assert!(events.contains(&"state:Exiting".to_string()));
        assert_eq!(events.last().map(String::as_str), Some("exit:None:true"));
    }

    #[test]
    #[cfg(unix)]
    fn test_keep_alive_restarts_until_stopped() {
        let mut console = ConsoleController::new();
        let recorder = Recorder::default();
        console.add_listener(recorder.clone());
        let launch = LaunchSpec::new("sh").with_args("-c 'echo up; read line'");
        console.set_restart_policy(KeepAlive::new(launch.clone()));

        assert!(console.start_process(launch));
        pump_until(&mut console, |c| c.buffer().text() == "up\n");

        // Ending the shell on its own brings it back
        assert!(console.write_input("", ColorClass::Input, false));
        pump_until(&mut console, |c| c.buffer().text() == "up\nup\n");
        assert_eq!(console.state(), ConsoleState::Running);

        console.stop_process();
        assert_eq!(console.state(), ConsoleState::Idle);
        assert!(!console.is_process_running());
        let exits: Vec<_> = recorder
            .events()
            .into_iter()
            .filter(|e| e.starts_with("exit:"))
            .collect();
        assert_eq!(exits, vec!["exit:Some(0):false", "exit:None:true"]);
    }

    #[test]
    #[cfg(unix)]
    fn test_stop_after_unpumped_exit_does_not_restart() {
        let mut console = ConsoleController::new();
        let recorder = Recorder::default();
        console.add_listener(recorder.clone());
        let launch = LaunchSpec::new("sh").with_args("-c 'exit 0'");
        console.set_restart_policy(KeepAlive::new(launch.clone()));
        assert!(console.start_process(launch));

        // The process ends on its own; its exit is queued but not pumped
        let deadline = Instant::now() + TIMEOUT;
        while console.is_process_running() {
            assert!(Instant::now() < deadline, "process did not exit");
            std::thread::sleep(Duration::from_millis(10));
        }

        console.stop_process();
        assert_eq!(console.state(), ConsoleState::Idle);
        assert!(!console.is_process_running());

        console.pump();
        assert_eq!(console.state(), ConsoleState::Idle);
        let exits: Vec<_> = recorder
            .events()
            .into_iter()
            .filter(|e| e.starts_with("exit:"))
            .collect();
        assert_eq!(exits, vec!["exit:Some(0):false"]);
    }

    #[test]
    #[cfg(unix)]
    fn test_input_gate_blocks_keystrokes() {
        let mut console = ConsoleController::new();
        assert!(console.start_process(LaunchSpec::new("cat")));

        console.set_input_enabled(false);
        assert_eq!(console.edit_input(0, InputEdit::Insert("x")), None);
        assert_eq!(console.submit(), None);
        assert!(!console.clear_input_zone());

        console.set_input_enabled(true);
        assert_eq!(console.edit_input(0, InputEdit::Insert("x")), Some(1));
        assert_eq!(console.buffer().input_text(), "x");
        console.stop_process();
    }

    #[test]
    #[cfg(unix)]
    fn test_echoed_command_is_shown_once() {
        let mut console = ConsoleController::new();
        let recorder = Recorder::default();
        console.add_listener(recorder.clone());
        assert!(console.start_process(LaunchSpec::new("cat")));

        assert!(console.write_input("git status\r\n", ColorClass::Command, true));
        // cat sends the line back, which is dropped as an echo
        pump_until(&mut console, |_| {
            recorder.events().contains(&"output:git status\n".to_string())
        });

        assert_eq!(console.buffer().text(), "git status\n");
        assert_eq!(console.buffer().history_spans()[0].class, ColorClass::Command);
        assert_eq!(console.buffer().history().entries(), ["git status"]);
        assert!(recorder.events().contains(&"input:git status".to_string()));
        console.stop_process();
    }

    #[test]
    #[cfg(unix)]
    fn test_handle_marshals_from_other_thread() {
        let mut console = ConsoleController::new();
        let handle = console.handle();

        std::thread::spawn(move || {
            handle.start_process(LaunchSpec::new("cat"));
            handle.write_input("ping", ColorClass::Command, true);
        })
        .join()
        .unwrap();

        // Nothing happens until the controller pumps
        assert_eq!(console.state(), ConsoleState::Idle);
        assert!(console.pump());
        assert_eq!(console.state(), ConsoleState::Running);
        assert_eq!(console.buffer().text(), "ping\n");

        let handle = console.handle();
        assert!(handle.stop_process());
        console.pump();
        assert_eq!(console.state(), ConsoleState::Idle);

        drop(console);
        assert!(!handle.clear());
    }
}
