//! PTY process management.
//!
//! A session is one shell bound to a pseudo-terminal. Its output is read on a
//! dedicated thread and sent to the owning terminal as [`SessionEvent`]s; the
//! exit event is always the last event a session sends.

use crate::error::TerminalError;
use crate::flow_control::{FlowTarget, PauseReason};
use crate::shell::{build_environment, working_directory, ShellSpec};
use crate::types::{SessionId, TermSize};
use anyhow::{Context, Result};
use parking_lot::{Condvar, Mutex};
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty};
use settings::constants::pty::READ_BUFFER_SIZE;
use settings::Config;
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread;
use tokio::sync::mpsc;

/// Raw output or exit of a session, tagged with the session it came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    Data { session_id: SessionId, chunk: Vec<u8> },
    Exit { session_id: SessionId, code: Option<i32> },
}

impl SessionEvent {
    pub fn session_id(&self) -> SessionId {
        match self {
            Self::Data { session_id, .. } | Self::Exit { session_id, .. } => *session_id,
        }
    }
}

/// Everything needed to start a shell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpawnRequest {
    pub shell: ShellSpec,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub size: TermSize,
}

impl SpawnRequest {
    /// Request for `shell` with the sanitized environment from `config`.
    pub fn new(shell: ShellSpec, config: &Config, size: TermSize) -> Self {
        Self {
            env: build_environment(&shell, config),
            cwd: working_directory(config),
            shell,
            size,
        }
    }
}

/// A live shell process.
pub trait PtySession: Send {
    fn id(&self) -> SessionId;

    fn shell(&self) -> &ShellSpec;

    /// Queue bytes for the shell's input.
    fn write(&mut self, data: &[u8]) -> Result<(), TerminalError>;

    fn resize(&mut self, size: TermSize) -> Result<(), TerminalError>;

    /// Pause control for the session's reader.
    fn flow_target(&self) -> Arc<dyn FlowTarget>;

    /// Terminate the process. The exit event still follows.
    fn kill(&mut self);
}

/// Starts shells. Called off the async runtime since spawning blocks.
pub trait PtySpawner: Send + Sync {
    fn spawn(
        &self,
        session_id: SessionId,
        request: &SpawnRequest,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<Box<dyn PtySession>>;
}

#[derive(Debug, Default)]
struct GateState {
    backpressure: bool,
    consumer: bool,
    closed: bool,
}

impl GateState {
    fn paused(&self) -> bool {
        self.backpressure || self.consumer
    }
}

/// Holds a reader thread before its next read while any pause reason is set.
///
/// A held reader leaves output in the kernel buffer, which in turn blocks the
/// shell once that buffer is full.
#[derive(Debug, Default)]
pub struct PauseGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl PauseGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block while paused. Returns false once the gate is closed.
    pub fn wait_until_open(&self) -> bool {
        let mut state = self.state.lock();
        while state.paused() && !state.closed {
            self.changed.wait(&mut state);
        }
        !state.closed
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused()
    }

    /// Release any waiting reader for good.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.changed.notify_all();
    }

    fn set(&self, reason: PauseReason, paused: bool) {
        let mut state = self.state.lock();
        match reason {
            PauseReason::Backpressure => state.backpressure = paused,
            PauseReason::Consumer => state.consumer = paused,
        }
        if !state.paused() {
            self.changed.notify_all();
        }
    }
}

impl FlowTarget for PauseGate {
    fn pause(&self, reason: PauseReason) {
        self.set(reason, true);
    }

    fn resume(&self, reason: PauseReason) {
        self.set(reason, false);
    }
}

/// Spawns shells on the platform's native PTY.
#[derive(Clone, Copy, Debug, Default)]
pub struct NativePtySpawner;

impl PtySpawner for NativePtySpawner {
    fn spawn(
        &self,
        session_id: SessionId,
        request: &SpawnRequest,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<Box<dyn PtySession>> {
        Ok(Box::new(NativePtySession::spawn(session_id, request, events)?))
    }
}

/// A shell on a native PTY, with reader and writer threads.
///
/// Dropping the session kills the shell.
pub struct NativePtySession {
    id: SessionId,
    shell: ShellSpec,
    master: Box<dyn MasterPty + Send>,
    input: Option<std_mpsc::Sender<Vec<u8>>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    gate: Arc<PauseGate>,
    killed: bool,
}

impl NativePtySession {
    /// Spawn `request.shell` on a new native PTY.
    ///
    /// # Arguments
    /// * `session_id` - Id stamped on every event the session sends
    /// * `request` - Shell, environment, working directory and size
    /// * `events` - Receives output chunks, then exactly one exit event
    ///
    /// # Returns
    /// The running session on success, or an error if the PTY could not be
    /// opened, the shell could not be started, or its threads failed to start.
    ///
    /// # Environment
    /// The child sees only `request.env`; nothing is inherited implicitly. A
    /// `cwd` that is not an existing directory is ignored.
    pub fn spawn(
        session_id: SessionId,
        request: &SpawnRequest,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<Self> {
        let pair = native_pty_system()
            .openpty(request.size.to_pty_size())
            .context("Failed to open PTY")?;

        let mut cmd = CommandBuilder::new(&request.shell.path);
        cmd.args(&request.shell.args);
        cmd.env_clear();
        for (key, value) in &request.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = request.cwd.as_ref().filter(|dir| dir.is_dir()) {
            cmd.cwd(cwd);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("Failed to spawn {}", request.shell.path.display()))?;
        // The child holds its own copy; keeping ours would hide EOF after exit.
        drop(pair.slave);

        let killer = child.clone_killer();
        let mut writer = pair
            .master
            .take_writer()
            .context("Failed to get PTY writer")?;
        let mut reader = pair
            .master
            .try_clone_reader()
            .context("Failed to get PTY reader")?;

        let gate = Arc::new(PauseGate::new());
        let reader_gate = gate.clone();
        thread::Builder::new()
            .name(format!("pty-reader-{session_id}"))
            .spawn(move || {
                let mut buf = [0u8; READ_BUFFER_SIZE];
                while reader_gate.wait_until_open() {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            let event = SessionEvent::Data {
                                session_id,
                                chunk: buf[..n].to_vec(),
                            };
                            if events.blocking_send(event).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            // EIO is how Linux reports a hung-up PTY
                            tracing::debug!("PTY read for session {} ended: {}", session_id, e);
                            break;
                        }
                    }
                }
                let code = match child.wait() {
                    Ok(status) => i32::try_from(status.exit_code()).ok(),
                    Err(e) => {
                        tracing::debug!("Wait for session {}: {}", session_id, e);
                        None
                    }
                };
                let _ = events.blocking_send(SessionEvent::Exit { session_id, code });
            })
            .context("Failed to start PTY reader thread")?;

        let (input, input_rx) = std_mpsc::channel::<Vec<u8>>();
        thread::Builder::new()
            .name(format!("pty-writer-{session_id}"))
            .spawn(move || {
                for data in input_rx {
                    if let Err(e) = writer.write_all(&data).and_then(|()| writer.flush()) {
                        tracing::warn!("PTY write for session {} failed: {}", session_id, e);
                        break;
                    }
                }
            })
            .context("Failed to start PTY writer thread")?;

        tracing::info!(
            "Spawned {} for session {} ({}x{})",
            request.shell.path.display(),
            session_id,
            request.size.cols,
            request.size.rows
        );

        Ok(Self {
            id: session_id,
            shell: request.shell.clone(),
            master: pair.master,
            input: Some(input),
            killer,
            gate,
            killed: false,
        })
    }
}

impl PtySession for NativePtySession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn shell(&self) -> &ShellSpec {
        &self.shell
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TerminalError> {
        let sent = self
            .input
            .as_ref()
            .is_some_and(|input| input.send(data.to_vec()).is_ok());
        if sent {
            Ok(())
        } else {
            Err(TerminalError::Write {
                session_id: self.id,
                source: io::Error::new(io::ErrorKind::BrokenPipe, "PTY writer has stopped"),
            })
        }
    }

    fn resize(&mut self, size: TermSize) -> Result<(), TerminalError> {
        self.master
            .resize(size.to_pty_size())
            .map_err(|e| TerminalError::Resize {
                session_id: self.id,
                reason: format!("{e:#}"),
            })
    }

    fn flow_target(&self) -> Arc<dyn FlowTarget> {
        self.gate.clone()
    }

    fn kill(&mut self) {
        if self.killed {
            return;
        }
        self.killed = true;
        self.input = None;
        // a paused reader must still get to wait() and report the exit
        self.gate.close();
        if let Err(e) = self.killer.kill() {
            // ESRCH (no such process) is expected if already exited
            tracing::debug!("Kill session {}: {}", self.id, e);
        }
    }
}

impl Drop for NativePtySession {
    fn drop(&mut self) {
        self.kill();
        tracing::debug!("PTY session {} dropped", self.id);
    }
}
