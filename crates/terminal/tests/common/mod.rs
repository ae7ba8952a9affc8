//! Shared test utilities for terminal integration tests.
//!
//! [`FakeSpawner`] starts a scripted shell on a plain thread. It echoes its
//! input like a tty in canonical mode, understands the exec wrapper and runs
//! a handful of commands:
//!
//! - `echo <text>`: prints `<text>`
//! - `(exit <n>)`: status `n`, no output
//! - `exit [n]`: the shell itself exits
//! - `fail`: prints `boom`, status 1
//! - `flood <n>`: prints `n` lines of 99 `x`
//! - `sleep <ms>`
//! - `hang`: never answers again
//!
//! Anything else prints a "command not found" line with status 127.

#![allow(dead_code)]

use anyhow::anyhow;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread;
use terminal::pty_handler::PauseGate;
use terminal::{
    ChannelSink, FlowTarget, PtySession, PtySpawner, SessionEvent, SessionId, ShellSpec,
    SpawnRequest, TermSize, Terminal, TerminalError, TerminalEvent, TerminalOptions,
};
use tokio::sync::mpsc;

pub use settings::Config;
pub use std::time::Duration;

/// Default timeout for async test operations
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Fake Shell
// ============================================================================

#[derive(Default)]
pub struct FakeSpawner {
    /// Split every emitted block into chunks of this size.
    chunk_size: Option<usize>,
    /// Draw a prompt before running a wrapped command, as dash does.
    prompt_before_begin: bool,
    spawns: Mutex<Vec<SpawnRequest>>,
    commands: Arc<Mutex<Vec<String>>>,
    saw_pause: Arc<AtomicBool>,
}

impl FakeSpawner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_chunk_size(chunk_size: usize) -> Arc<Self> {
        Arc::new(Self {
            chunk_size: Some(chunk_size.max(1)),
            ..Self::default()
        })
    }

    pub fn with_prompt_before_begin() -> Arc<Self> {
        Arc::new(Self {
            prompt_before_begin: true,
            ..Self::default()
        })
    }

    /// Shell paths in spawn order.
    pub fn spawned_shells(&self) -> Vec<String> {
        self.spawns
            .lock()
            .iter()
            .map(|request| request.shell.path.display().to_string())
            .collect()
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.lock().len()
    }

    /// Commands run so far, across all sessions.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    /// Whether a shell ever found its reader paused.
    pub fn saw_pause(&self) -> bool {
        self.saw_pause.load(Ordering::SeqCst)
    }
}

impl PtySpawner for FakeSpawner {
    fn spawn(
        &self,
        session_id: SessionId,
        request: &SpawnRequest,
        events: mpsc::Sender<SessionEvent>,
    ) -> anyhow::Result<Box<dyn PtySession>> {
        self.spawns.lock().push(request.clone());

        let gate = Arc::new(PauseGate::new());
        let (input, input_rx) = std_mpsc::channel();
        let shell = FakeShell {
            out: Output {
                session_id,
                events,
                gate: gate.clone(),
                chunk_size: self.chunk_size,
                saw_pause: self.saw_pause.clone(),
            },
            commands: self.commands.clone(),
            status: 0,
            hung: false,
            prompt_before_begin: self.prompt_before_begin,
        };
        thread::Builder::new()
            .name(format!("fake-shell-{session_id}"))
            .spawn(move || shell.run(input_rx))?;

        Ok(Box::new(FakeSession {
            id: session_id,
            shell: request.shell.clone(),
            input: Some(input),
            gate,
            size: request.size,
        }))
    }
}

/// Spawner whose shells never start.
pub struct FailingSpawner;

impl PtySpawner for FailingSpawner {
    fn spawn(
        &self,
        _session_id: SessionId,
        request: &SpawnRequest,
        _events: mpsc::Sender<SessionEvent>,
    ) -> anyhow::Result<Box<dyn PtySession>> {
        Err(anyhow!("{}: No such file or directory", request.shell.path.display()))
    }
}

struct FakeSession {
    id: SessionId,
    shell: ShellSpec,
    input: Option<std_mpsc::Sender<Vec<u8>>>,
    gate: Arc<PauseGate>,
    size: TermSize,
}

impl PtySession for FakeSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn shell(&self) -> &ShellSpec {
        &self.shell
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TerminalError> {
        match &self.input {
            Some(input) if input.send(data.to_vec()).is_ok() => Ok(()),
            _ => Err(TerminalError::Write {
                session_id: self.id,
                source: std::io::Error::from(std::io::ErrorKind::BrokenPipe),
            }),
        }
    }

    fn resize(&mut self, size: TermSize) -> Result<(), TerminalError> {
        self.size = size;
        Ok(())
    }

    fn flow_target(&self) -> Arc<dyn FlowTarget> {
        self.gate.clone()
    }

    fn kill(&mut self) {
        self.input = None;
        self.gate.close();
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.kill();
    }
}

struct Output {
    session_id: SessionId,
    events: mpsc::Sender<SessionEvent>,
    gate: Arc<PauseGate>,
    chunk_size: Option<usize>,
    saw_pause: Arc<AtomicBool>,
}

impl Output {
    fn emit(&self, text: &str) {
        let bytes = text.as_bytes();
        let size = self.chunk_size.unwrap_or(bytes.len()).max(1);
        for chunk in bytes.chunks(size) {
            if self.gate.is_paused() {
                self.saw_pause.store(true, Ordering::SeqCst);
            }
            if !self.gate.wait_until_open() {
                return;
            }
            let event = SessionEvent::Data {
                session_id: self.session_id,
                chunk: chunk.to_vec(),
            };
            if self.events.blocking_send(event).is_err() {
                return;
            }
        }
    }

    fn exit(&self, code: Option<i32>) {
        let _ = self.events.blocking_send(SessionEvent::Exit {
            session_id: self.session_id,
            code,
        });
    }
}

enum Step {
    Continue,
    Exit(i32),
}

struct FakeShell {
    out: Output,
    commands: Arc<Mutex<Vec<String>>>,
    status: i32,
    hung: bool,
    prompt_before_begin: bool,
}

impl FakeShell {
    fn run(mut self, input: std_mpsc::Receiver<Vec<u8>>) {
        self.out.emit("$ ");
        let mut pending: Vec<u8> = Vec::new();
        let code = 'session: loop {
            let Ok(data) = input.recv() else {
                break 'session None;
            };
            pending.extend(data);
            while let Some(end) = pending.iter().position(|&b| b == b'\n' || b == b'\r') {
                let raw: Vec<u8> = pending.drain(..=end).collect();
                let line = String::from_utf8_lossy(&raw[..raw.len() - 1]).into_owned();
                if self.hung {
                    continue;
                }
                self.out.emit(&format!("{line}\r\n"));
                if let Step::Exit(code) = self.line(&line) {
                    break 'session Some(code);
                }
            }
        };
        self.out.exit(code);
    }

    fn line(&mut self, line: &str) -> Step {
        if let Some(rest) = line.strip_prefix("printf '\\n%s\\n' '") {
            let Some((begin, command)) = rest.split_once("'; ") else {
                return Step::Continue;
            };
            if self.prompt_before_begin {
                self.out.emit("$ ");
            }
            self.out.emit(&format!("\r\n{begin}\r\n"));
            return self.command(command);
        }
        if line.contains("__pkgterm_ec=$?") {
            let done = line
                .split_once("printf '\\n%s%s%s\\n' '")
                .and_then(|(_, rest)| rest.split_once('\''))
                .map(|(done, _)| done.to_string())
                .unwrap_or_default();
            self.out
                .emit(&format!("$ \r\n{done}{}:END\r\n$ ", self.status));
            return Step::Continue;
        }
        let step = if line.trim().is_empty() {
            Step::Continue
        } else {
            self.command(line.trim())
        };
        if matches!(step, Step::Continue) && !self.hung {
            self.out.emit("$ ");
        }
        step
    }

    fn command(&mut self, command: &str) -> Step {
        self.commands.lock().push(command.to_string());
        let (name, arg) = command.split_once(' ').unwrap_or((command, ""));
        self.status = match name {
            "echo" => {
                self.out.emit(&format!("{arg}\r\n"));
                0
            }
            "exit" => return Step::Exit(arg.trim().parse().unwrap_or(0)),
            "fail" => {
                self.out.emit("boom\r\n");
                1
            }
            "flood" => {
                let lines: usize = arg.trim().parse().unwrap_or(0);
                let line = format!("{}\r\n", "x".repeat(99));
                self.out.emit(&line.repeat(lines));
                0
            }
            "sleep" => {
                thread::sleep(Duration::from_millis(arg.trim().parse().unwrap_or(0)));
                0
            }
            "hang" => {
                self.hung = true;
                0
            }
            _ => match command
                .strip_prefix("(exit ")
                .and_then(|rest| rest.strip_suffix(')'))
            {
                Some(code) => code.trim().parse().unwrap_or(1),
                None => {
                    self.out
                        .emit(&format!("fake: {name}: command not found\r\n"));
                    127
                }
            },
        };
        Step::Continue
    }
}

// ============================================================================
// Terminal Helpers
// ============================================================================

pub fn config() -> Config {
    Config {
        default_shell: "/bin/sh".to_string(),
        ..Config::default()
    }
}

pub fn options(config: Config, exec_timeout: Duration) -> TerminalOptions {
    TerminalOptions {
        exec_timeout,
        ..TerminalOptions::from_config(config)
    }
}

/// Terminal on `spawner` with a channel sink.
pub fn terminal_with(
    spawner: Arc<dyn PtySpawner>,
    options: TerminalOptions,
) -> (Terminal, mpsc::Receiver<TerminalEvent>) {
    let (sink, events) = ChannelSink::new(64);
    (Terminal::spawn(options, spawner, Arc::new(sink)), events)
}

pub fn fake_terminal() -> (Arc<FakeSpawner>, Terminal, mpsc::Receiver<TerminalEvent>) {
    let spawner = FakeSpawner::new();
    let (terminal, events) = terminal_with(spawner.clone(), options(config(), DEFAULT_TIMEOUT));
    (spawner, terminal, events)
}

/// Everything the sink received, as seen so far.
#[derive(Debug, Default)]
pub struct Transcript {
    pub text: String,
    pub exits: Vec<(SessionId, Option<i32>)>,
    pub data_sessions: Vec<SessionId>,
}

impl Transcript {
    pub fn record(&mut self, event: TerminalEvent) {
        match event {
            TerminalEvent::Data { session_id, chunk } => {
                self.text.push_str(&String::from_utf8_lossy(&chunk));
                if self.data_sessions.last() != Some(&session_id) {
                    self.data_sessions.push(session_id);
                }
            }
            TerminalEvent::Exit { session_id, code } => self.exits.push((session_id, code)),
        }
    }
}

/// Read events until `done` holds for the transcript or the timeout passes.
pub async fn read_until(
    events: &mut mpsc::Receiver<TerminalEvent>,
    transcript: &mut Transcript,
    done: impl Fn(&Transcript) -> bool,
) -> bool {
    let deadline = tokio::time::Instant::now() + DEFAULT_TIMEOUT;
    while !done(transcript) {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(event)) => transcript.record(event),
            Ok(None) | Err(_) => return false,
        }
    }
    true
}

/// Poll `condition` until it holds or the timeout passes.
pub async fn wait_for(condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + DEFAULT_TIMEOUT;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    true
}
