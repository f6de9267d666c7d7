//! Child process session
//!
//! Spawns one command-line process with piped stdio, pumps its stdout and
//! stderr on reader threads and reports output chunks and the exit over a
//! channel owned by the session.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Line terminator appended to every line written to the child
#[cfg(windows)]
pub const LINE_ENDING: &str = "\r\n";
#[cfg(not(windows))]
pub const LINE_ENDING: &str = "\n";

const READ_BUFFER_SIZE: usize = 4096;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// How long a finished process's readers may take to drain the pipes
const READER_GRACE: Duration = Duration::from_millis(250);

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Invalid argument string: {0}")]
    Arguments(#[from] shell_words::ParseError),

    #[error("Failed to start {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to capture the standard streams of {0}")]
    MissingPipe(String),

    #[error("Failed to write to the process input: {0}")]
    Write(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, ProcessError>;

/// What to run: executable, raw argument string and working directory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Option<String>,
    pub working_dir: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: None,
            working_dir: None,
        }
    }

    pub fn with_args(mut self, args: impl Into<String>) -> Self {
        self.args = Some(args.into());
        self
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn args(&self) -> Option<&str> {
        self.args.as_deref().filter(|args| !args.trim().is_empty())
    }

    /// Command line used for labels and diagnostics
    pub fn command_line(&self) -> String {
        match self.args() {
            Some(args) => format!("{} {}", self.program, args.trim()),
            None => self.program.clone(),
        }
    }

    fn build_command(&self) -> Result<Command> {
        let mut cmd = Command::new(&self.program);
        if let Some(args) = self.args() {
            // Windows programs parse their own command line, so hand it over untouched
            #[cfg(windows)]
            {
                use std::os::windows::process::CommandExt;
                cmd.raw_arg(args);
            }
            #[cfg(not(windows))]
            {
                cmd.args(shell_words::split(args)?);
            }
        }
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        Ok(cmd)
    }
}

/// Stream a chunk of output was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSource {
    Stdout,
    Stderr,
}

impl OutputSource {
    pub fn is_error(self) -> bool {
        self == OutputSource::Stderr
    }
}

/// A chunk of decoded output. Not aligned to lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputEvent {
    pub source: OutputSource,
    pub content: String,
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    /// Command line of the run
    pub command: String,
    /// OS exit code, `None` when terminated by a signal or unknown
    pub code: Option<i32>,
    /// The run was ended by `stop_process`
    pub killed: bool,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Session events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// Output chunk from stdout or stderr
    Output(OutputEvent),
    /// The process has exited; sent once per run, after the output its
    /// readers drained
    Exited(ExitInfo),
}

/// Result of a start request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// Another process is still running; nothing changed
    AlreadyRunning,
    /// The spawn failed; the reason was sent as error output
    Failed,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Event gate of a single run.
///
/// Output passes only while the run is live. `finish` closes the gate and
/// queues the exit event; whichever of the exit watcher and `stop_process`
/// gets there first reports the exit.
struct RunGate {
    tx: Mutex<Option<Sender<ProcessEvent>>>,
    running: AtomicBool,
}

impl RunGate {
    fn new(tx: Sender<ProcessEvent>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            running: AtomicBool::new(true),
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn output(&self, source: OutputSource, content: String) -> bool {
        let guard = lock(&self.tx);
        match guard.as_ref() {
            Some(tx) => tx
                .send(ProcessEvent::Output(OutputEvent { source, content }))
                .is_ok(),
            None => false,
        }
    }

    fn finish(&self, info: ExitInfo) -> bool {
        let mut guard = lock(&self.tx);
        match guard.take() {
            Some(tx) => {
                // Exit is queued before the running flag drops
                let _ = tx.send(ProcessEvent::Exited(info));
                self.running.store(false, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }
}

/// Incremental UTF-8 decoding that keeps sequences split across reads intact
#[derive(Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        None => {
                            // Incomplete sequence at the end, wait for more bytes
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/// The live half of a session
struct ActiveProcess {
    child: Arc<Mutex<Child>>,
    stdin: Option<ChildStdin>,
    gate: Arc<RunGate>,
    command: String,
    pid: u32,
}

/// Owns at most one child process at a time and is reused across runs
pub struct ProcessSession {
    tx: Sender<ProcessEvent>,
    rx: Receiver<ProcessEvent>,
    active: Option<ActiveProcess>,
    last_command: Option<String>,
}

impl Default for ProcessSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSession {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            tx,
            rx,
            active: None,
            last_command: None,
        }
    }

    /// Check if a process is running
    pub fn is_process_running(&self) -> bool {
        self.active
            .as_ref()
            .map_or(false, |active| active.gate.is_running())
    }

    /// Command line of the last start attempt
    pub fn last_command(&self) -> Option<&str> {
        self.last_command.as_deref()
    }

    /// OS id of the running process
    pub fn pid(&self) -> Option<u32> {
        self.active
            .as_ref()
            .filter(|active| active.gate.is_running())
            .map(|active| active.pid)
    }

    /// Start a process unless one is already running.
    ///
    /// Spawn failures are reported as stderr output so the console stays usable.
    pub fn start(&mut self, launch: &LaunchSpec) -> StartOutcome {
        if self.is_process_running() {
            warn!(
                "Refusing to start {}: {} is still running",
                launch.program,
                self.last_command.as_deref().unwrap_or("a process")
            );
            return StartOutcome::AlreadyRunning;
        }
        // Whatever is left of a finished run goes away here
        self.active = None;

        let command = launch.command_line();
        self.last_command = Some(command.clone());

        match self.spawn(launch, command) {
            Ok(active) => {
                info!("Started {} (pid {})", active.command, active.pid);
                self.active = Some(active);
                StartOutcome::Started
            }
            Err(e) => {
                error!("{}", e);
                let _ = self.tx.send(ProcessEvent::Output(OutputEvent {
                    source: OutputSource::Stderr,
                    content: format!("{}{}", e, LINE_ENDING),
                }));
                StartOutcome::Failed
            }
        }
    }

    fn spawn(&self, launch: &LaunchSpec, command: String) -> Result<ActiveProcess> {
        let mut child = launch
            .build_command()?
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                command: command.clone(),
                source,
            })?;

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ProcessError::MissingPipe(command));
            }
        };
        let stdin = child.stdin.take();
        let pid = child.id();

        let gate = Arc::new(RunGate::new(self.tx.clone()));
        let readers = vec![
            spawn_reader(stdout, OutputSource::Stdout, gate.clone()),
            spawn_reader(stderr, OutputSource::Stderr, gate.clone()),
        ];
        let child = Arc::new(Mutex::new(child));
        spawn_exit_watcher(child.clone(), readers, gate.clone(), command.clone());

        Ok(ActiveProcess {
            child,
            stdin,
            gate,
            command,
            pid,
        })
    }

    /// Kill the running process and wait until the OS confirms it is gone.
    ///
    /// Nothing of the killed run is delivered after this returns except its
    /// exit event, which is already queued. No-op when idle.
    pub fn stop_process(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        if !active.gate.is_running() {
            return;
        }

        info!("Killing {} (pid {})", active.command, active.pid);
        let code = {
            let mut child = lock(&active.child);
            if let Err(e) = child.kill() {
                warn!("Failed to kill {}: {}", active.command, e);
            }
            match child.wait() {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!("Failed to wait for {}: {}", active.command, e);
                    None
                }
            }
        };
        active.stdin.take();
        active.gate.finish(ExitInfo {
            command: active.command.clone(),
            code,
            killed: true,
        });
    }

    /// Write a line plus the platform terminator to the process input.
    ///
    /// Returns `Ok(false)` when no process is running.
    pub fn write_input(&mut self, line: &str) -> Result<bool> {
        let Some(active) = self
            .active
            .as_mut()
            .filter(|active| active.gate.is_running())
        else {
            debug!("Input dropped, no process is running");
            return Ok(false);
        };
        let Some(stdin) = active.stdin.as_mut() else {
            return Ok(false);
        };

        stdin
            .write_all(line.as_bytes())
            .and_then(|_| stdin.write_all(LINE_ENDING.as_bytes()))
            .and_then(|_| stdin.flush())
            .map_err(ProcessError::Write)?;
        Ok(true)
    }

    /// Next queued event, if any
    pub fn try_recv(&self) -> Option<ProcessEvent> {
        self.rx.try_recv().ok()
    }

    /// Wait up to `timeout` for the next event
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ProcessEvent> {
        self.rx.recv_timeout(timeout).ok()
    }
}

impl Drop for ProcessSession {
    fn drop(&mut self) {
        self.stop_process();
    }
}

fn spawn_reader<R>(mut pipe: R, source: OutputSource, gate: Arc<RunGate>) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buffer = [0u8; READ_BUFFER_SIZE];
        let mut decoder = Utf8Decoder::default();

        loop {
            match pipe.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    let text = decoder.decode(&buffer[..n]);
                    if !text.is_empty() && !gate.output(source, text) {
                        // Run already finished, nobody listens anymore
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("{:?} read failed: {}", source, e);
                    break;
                }
            }
        }

        let rest = decoder.finish();
        if !rest.is_empty() {
            gate.output(source, rest);
        }
        debug!("{:?} reader finished", source);
    })
}

fn spawn_exit_watcher(
    child: Arc<Mutex<Child>>,
    readers: Vec<JoinHandle<()>>,
    gate: Arc<RunGate>,
    command: String,
) {
    thread::spawn(move || {
        let code = loop {
            if !gate.is_running() {
                // Stopped, stop_process reported the exit
                return;
            }
            let status = lock(&child).try_wait();
            match status {
                Ok(Some(status)) => break status.code(),
                Ok(None) => thread::sleep(EXIT_POLL_INTERVAL),
                Err(e) => {
                    warn!("Failed to poll {}: {}", command, e);
                    break None;
                }
            }
        };

        // Output written before the exit still has to reach the channel. A
        // grandchild holding the pipes open keeps a reader blocked, so the wait
        // is bounded and whatever such a reader gets later is dropped.
        let deadline = Instant::now() + READER_GRACE;
        while readers.iter().any(|reader| !reader.is_finished()) {
            if Instant::now() >= deadline {
                debug!("{} exited, its pipes are still open", command);
                break;
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }

        let info = ExitInfo {
            command,
            code,
            killed: false,
        };
        let label = format!("{} exited with code {:?}", info.command, info.code);
        if gate.finish(info) {
            info!("{}", label);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(10);

    /// Drain events until the run exits or the deadline passes
    fn collect_until_exit(session: &ProcessSession) -> (Vec<OutputEvent>, Option<ExitInfo>) {
        let deadline = Instant::now() + TIMEOUT;
        let mut output = Vec::new();
        while Instant::now() < deadline {
            match session.recv_timeout(Duration::from_millis(50)) {
                Some(ProcessEvent::Output(event)) => output.push(event),
                Some(ProcessEvent::Exited(info)) => return (output, Some(info)),
                None => {}
            }
        }
        (output, None)
    }

    fn joined(events: &[OutputEvent], source: OutputSource) -> String {
        events
            .iter()
            .filter(|e| e.source == source)
            .map(|e| e.content.as_str())
            .collect()
    }

    #[test]
    fn test_decoder_keeps_split_sequences() {
        let mut decoder = Utf8Decoder::default();
        let bytes = "héllo €".as_bytes();
        // Split inside 'é' and inside '€'
        let mut text = decoder.decode(&bytes[..2]);
        text.push_str(&decoder.decode(&bytes[2..8]));
        text.push_str(&decoder.decode(&bytes[8..]));
        text.push_str(&decoder.finish());
        assert_eq!(text, "héllo €");
    }

    #[test]
    fn test_decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{FFFD}b");
        // A dangling lead byte is flushed lossily at the end
        assert_eq!(decoder.decode(b"c\xe2"), "c");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }

    #[test]
    fn test_command_line() {
        let launch = LaunchSpec::new("git").with_args("  status --porcelain ");
        assert_eq!(launch.command_line(), "git status --porcelain");
        assert_eq!(LaunchSpec::new("cmd").with_args("  ").command_line(), "cmd");
    }

    #[test]
    fn test_stop_idle_session() {
        let mut session = ProcessSession::new();
        session.stop_process();
        assert!(!session.is_process_running());
        assert!(session.try_recv().is_none());
    }

    #[test]
    fn test_write_without_process_is_noop() {
        let mut session = ProcessSession::new();
        assert!(!session.write_input("dir").unwrap());
        assert!(session.try_recv().is_none());
    }

    #[test]
    fn test_spawn_failure_is_error_output() {
        let mut session = ProcessSession::new();
        let outcome = session.start(&LaunchSpec::new("/nonexistent/pipeterm-missing-binary"));
        assert_eq!(outcome, StartOutcome::Failed);
        assert!(!session.is_process_running());

        match session.try_recv() {
            Some(ProcessEvent::Output(event)) => {
                assert_eq!(event.source, OutputSource::Stderr);
                assert!(event.content.contains("pipeterm-missing-binary"));
            }
            other => panic!("expected error output, got {:?}", other),
        }
        assert_eq!(
            session.last_command(),
            Some("/nonexistent/pipeterm-missing-binary")
        );
    }

    #[test]
    #[cfg(unix)]
    fn test_start_rejected_while_running() {
        let mut session = ProcessSession::new();
        let launch = LaunchSpec::new("sleep").with_args("30");
        assert_eq!(session.start(&launch), StartOutcome::Started);
        let pid = session.pid();

        assert_eq!(
            session.start(&LaunchSpec::new("sh").with_args("-c 'echo nope'")),
            StartOutcome::AlreadyRunning
        );
        assert!(session.is_process_running());
        assert_eq!(session.pid(), pid);
        assert_eq!(session.last_command(), Some("sleep 30"));

        session.stop_process();
        let (_, exit) = collect_until_exit(&session);
        let exit = exit.expect("exit event");
        assert!(exit.killed);
        assert!(!session.is_process_running());
    }

    #[test]
    #[cfg(unix)]
    fn test_natural_exit_and_restart() {
        let mut session = ProcessSession::new();
        let launch = LaunchSpec::new("sh").with_args("-c 'echo out; echo err 1>&2; exit 3'");
        assert_eq!(session.start(&launch), StartOutcome::Started);

        let (output, exit) = collect_until_exit(&session);
        let exit = exit.expect("exit event");
        assert_eq!(exit.code, Some(3));
        assert!(!exit.killed);
        assert!(!exit.success());
        assert_eq!(joined(&output, OutputSource::Stdout), "out\n");
        assert_eq!(joined(&output, OutputSource::Stderr), "err\n");
        assert!(!session.is_process_running());

        // Same session, next run
        let launch = LaunchSpec::new("sh").with_args("-c 'echo again'");
        assert_eq!(session.start(&launch), StartOutcome::Started);
        let (output, exit) = collect_until_exit(&session);
        assert!(exit.expect("exit event").success());
        assert_eq!(joined(&output, OutputSource::Stdout), "again\n");
    }

    #[test]
    #[cfg(unix)]
    fn test_unparsable_arguments_are_error_output() {
        let mut session = ProcessSession::new();
        let outcome = session.start(&LaunchSpec::new("sh").with_args("'unterminated"));
        assert_eq!(outcome, StartOutcome::Failed);
        assert!(!session.is_process_running());

        match session.try_recv() {
            Some(ProcessEvent::Output(event)) => {
                assert_eq!(event.source, OutputSource::Stderr);
                assert!(event.content.starts_with("Invalid argument string"));
            }
            other => panic!("expected error output, got {:?}", other),
        }
        assert!(session.try_recv().is_none());
    }

    #[test]
    #[cfg(unix)]
    fn test_grandchild_holding_pipes_does_not_delay_exit() {
        let mut session = ProcessSession::new();
        let started = Instant::now();
        let launch = LaunchSpec::new("sh").with_args("-c 'sleep 4 & echo hi; exit 0'");
        assert_eq!(session.start(&launch), StartOutcome::Started);

        let (output, exit) = collect_until_exit(&session);
        assert!(exit.expect("exit event").success());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(joined(&output, OutputSource::Stdout), "hi\n");
        assert!(!session.is_process_running());

        // The orphaned sleep still holds the old pipes
        let launch = LaunchSpec::new("sh").with_args("-c 'echo next'");
        assert_eq!(session.start(&launch), StartOutcome::Started);
        let (output, exit) = collect_until_exit(&session);
        assert!(exit.is_some());
        assert_eq!(joined(&output, OutputSource::Stdout), "next\n");
    }

    #[test]
    #[cfg(unix)]
    fn test_write_input_reaches_process() {
        let mut session = ProcessSession::new();
        assert_eq!(session.start(&LaunchSpec::new("cat")), StartOutcome::Started);
        assert!(session.write_input("hello").unwrap());

        let deadline = Instant::now() + TIMEOUT;
        let mut echoed = String::new();
        while !echoed.contains("hello\n") && Instant::now() < deadline {
            if let Some(ProcessEvent::Output(event)) =
                session.recv_timeout(Duration::from_millis(50))
            {
                echoed.push_str(&event.content);
            }
        }
        assert_eq!(echoed, "hello\n");
        session.stop_process();
    }

    #[test]
    #[cfg(unix)]
    fn test_no_output_after_stop() {
        let mut session = ProcessSession::new();
        let launch =
            LaunchSpec::new("sh").with_args("-c 'while true; do echo tick; sleep 0.01; done'");
        assert_eq!(session.start(&launch), StartOutcome::Started);

        // Wait for the first tick
        let deadline = Instant::now() + TIMEOUT;
        loop {
            assert!(Instant::now() < deadline, "no output from the process");
            if let Some(ProcessEvent::Output(_)) = session.recv_timeout(Duration::from_millis(50))
            {
                break;
            }
        }

        session.stop_process();
        assert!(!session.is_process_running());

        // Whatever is queued ends with the exit event
        let mut last = None;
        while let Some(event) = session.try_recv() {
            last = Some(event);
        }
        match last {
            Some(ProcessEvent::Exited(info)) => assert!(info.killed),
            other => panic!("expected exit event last, got {:?}", other),
        }
        assert!(session.recv_timeout(Duration::from_millis(200)).is_none());
    }
}
