//! Flat, id-keyed interface over several logical terminals.
//!
//! Hosts that address sessions by id rather than holding [`Terminal`]
//! handles go through here. Calls report plain success flags and log the
//! reason for a failure.

use crate::error::TerminalError;
use crate::lifecycle::{Terminal, TerminalOptions, TerminalSink};
use crate::pty_handler::PtySpawner;
use crate::types::{ExecResult, SessionId, TerminalId};
use collections::IndexMap;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Default)]
struct Terminals {
    by_id: IndexMap<TerminalId, Terminal>,
    active: Option<TerminalId>,
    next_id: u32,
}

impl Terminals {
    fn insert(&mut self, terminal: Terminal) -> TerminalId {
        self.next_id += 1;
        let id = TerminalId(self.next_id);
        self.by_id.insert(id, terminal);
        self.active = Some(id);
        tracing::debug!("Opened terminal {}", id);
        id
    }
}

pub struct TerminalRegistry {
    options: TerminalOptions,
    spawner: Arc<dyn PtySpawner>,
    sink: Arc<dyn TerminalSink>,
    terminals: Mutex<Terminals>,
}

impl TerminalRegistry {
    /// Create an empty registry.
    ///
    /// # Arguments
    /// * `options` - Options every terminal in the registry starts with
    /// * `spawner` - Shared by all terminals to start their shells
    /// * `sink` - Shared display sink; events carry the session id
    ///
    /// # Returns
    /// A registry with no terminals. `open_terminal`, or any call that needs
    /// an active terminal, creates one.
    pub fn new(
        options: TerminalOptions,
        spawner: Arc<dyn PtySpawner>,
        sink: Arc<dyn TerminalSink>,
    ) -> Self {
        Self {
            options,
            spawner,
            sink,
            terminals: Mutex::new(Terminals::default()),
        }
    }

    fn spawn_terminal(&self) -> Terminal {
        Terminal::spawn(self.options.clone(), self.spawner.clone(), self.sink.clone())
    }

    /// Add a terminal and make it the active one.
    pub fn open_terminal(&self) -> TerminalId {
        let terminal = self.spawn_terminal();
        self.terminals.lock().insert(terminal)
    }

    pub fn get(&self, id: TerminalId) -> Option<Terminal> {
        self.terminals.lock().by_id.get(&id).cloned()
    }

    pub fn active(&self) -> Option<Terminal> {
        let terminals = self.terminals.lock();
        terminals.active.and_then(|id| terminals.by_id.get(&id).cloned())
    }

    pub fn active_id(&self) -> Option<TerminalId> {
        self.terminals.lock().active
    }

    pub fn set_active(&self, id: TerminalId) -> bool {
        let mut terminals = self.terminals.lock();
        if !terminals.by_id.contains_key(&id) {
            return false;
        }
        terminals.active = Some(id);
        true
    }

    pub fn ids(&self) -> Vec<TerminalId> {
        self.terminals.lock().by_id.keys().copied().collect()
    }

    /// Shut a terminal down. The most recently opened remaining terminal
    /// becomes active if the removed one was.
    pub async fn remove(&self, id: TerminalId) -> bool {
        let removed = {
            let mut terminals = self.terminals.lock();
            let removed = terminals.by_id.shift_remove(&id);
            if terminals.active == Some(id) {
                terminals.active = terminals.by_id.keys().last().copied();
            }
            removed
        };
        match removed {
            Some(terminal) => {
                terminal.shutdown().await;
                true
            }
            None => false,
        }
    }

    fn active_or_open(&self) -> Terminal {
        let mut terminals = self.terminals.lock();
        if let Some(terminal) = terminals.active.and_then(|id| terminals.by_id.get(&id)) {
            return terminal.clone();
        }
        let terminal = self.spawn_terminal();
        terminals.insert(terminal.clone());
        terminal
    }

    /// Terminal currently hosting `session_id`.
    fn owner(&self, session_id: SessionId) -> Option<Terminal> {
        self.terminals
            .lock()
            .by_id
            .values()
            .find(|terminal| terminal.session_id() == Some(session_id))
            .cloned()
    }

    /// Start (or switch) the active terminal's session.
    pub async fn create_session(&self, shell: Option<&str>) -> Result<SessionId, TerminalError> {
        self.active_or_open().open(shell).await
    }

    pub async fn write(&self, session_id: SessionId, text: &str) -> bool {
        let result = match self.owner(session_id) {
            Some(terminal) => terminal.write(session_id, text.as_bytes()).await,
            None => Err(TerminalError::SessionNotFound(session_id)),
        };
        report("write", result)
    }

    pub async fn write_binary(&self, session_id: SessionId, encoded: &str) -> bool {
        let result = match self.owner(session_id) {
            Some(terminal) => terminal.write_binary(session_id, encoded).await,
            None => Err(TerminalError::SessionNotFound(session_id)),
        };
        report("write_binary", result)
    }

    pub async fn resize(&self, session_id: SessionId, cols: u16, rows: u16) -> bool {
        let result = match self.owner(session_id) {
            Some(terminal) => terminal.resize(session_id, cols, rows).await,
            None => Err(TerminalError::SessionNotFound(session_id)),
        };
        report("resize", result)
    }

    pub async fn set_flow_control(&self, session_id: SessionId, paused: bool) -> bool {
        let result = match self.owner(session_id) {
            Some(terminal) => terminal.set_flow_control(session_id, paused).await,
            None => Err(TerminalError::SessionNotFound(session_id)),
        };
        report("set_flow_control", result)
    }

    pub async fn close_session(&self, session_id: SessionId) -> bool {
        let result = match self.owner(session_id) {
            Some(terminal) => terminal.close(Some(session_id)).await,
            None => Err(TerminalError::SessionNotFound(session_id)),
        };
        report("close_session", result)
    }

    /// Run a command in the active terminal, opening one if needed.
    pub async fn enqueue_exec(&self, command: &str) -> ExecResult {
        self.active_or_open().exec(command).await
    }

    pub async fn shutdown(&self) {
        let terminals: Vec<Terminal> = {
            let mut terminals = self.terminals.lock();
            terminals.active = None;
            terminals.by_id.drain(..).map(|(_, terminal)| terminal).collect()
        };
        for terminal in terminals {
            terminal.shutdown().await;
        }
    }
}

fn report(operation: &str, result: Result<(), TerminalError>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("{} failed: {}", operation, e);
            false
        }
    }
}
