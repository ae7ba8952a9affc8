//! Logical terminals and the lifecycle of the sessions they host.
//!
//! Each [`Terminal`] is served by one actor task that owns the live session,
//! the exec queue and the decoder state. Callers talk to it through a command
//! channel, so a session is only ever touched from that task.
//!
//! ```text
//! NoSession -> Creating -> Ready -> Exited  -> (Enter or exec) -> Creating
//!                            \---> Closing -> NoSession
//! ```

use crate::error::TerminalError;
use crate::exec_queue::{ExecQueue, ExecRequest};
use crate::flow_control::{FlowController, PauseReason, Watermarks};
use crate::noise::{InteractiveFilter, NoiseFilter};
use crate::protocol::{encode, ExecDecoder, Markers};
use crate::pty_handler::{PtySession, PtySpawner, SessionEvent, SpawnRequest};
use crate::shell::ShellSpec;
use crate::types::{ExecResult, RequestId, SessionId, TermSize, TerminalEvent};
use async_trait::async_trait;
use base64::Engine as _;
use collections::FxHashMap;
use parking_lot::RwLock;
use settings::constants::pty::EVENT_CHANNEL_CAPACITY;
use settings::Config;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Sleep;

/// Receives display output. Deliveries for one session arrive in order and
/// each is awaited before the next, so a slow sink slows the session down.
#[async_trait]
pub trait TerminalSink: Send + Sync {
    async fn on_data(&self, session_id: SessionId, chunk: Vec<u8>);

    /// Last call for a session.
    async fn on_exit(&self, session_id: SessionId, code: Option<i32>);
}

/// Sink backed by a bounded channel of [`TerminalEvent`]s.
#[derive(Clone, Debug)]
pub struct ChannelSink {
    events: mpsc::Sender<TerminalEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TerminalEvent>) {
        let (events, rx) = mpsc::channel(capacity.max(1));
        (Self { events }, rx)
    }

    async fn send(&self, event: TerminalEvent) {
        if self.events.send(event).await.is_err() {
            tracing::trace!("Terminal event receiver dropped");
        }
    }
}

#[async_trait]
impl TerminalSink for ChannelSink {
    async fn on_data(&self, session_id: SessionId, chunk: Vec<u8>) {
        self.send(TerminalEvent::Data { session_id, chunk }).await;
    }

    async fn on_exit(&self, session_id: SessionId, code: Option<i32>) {
        self.send(TerminalEvent::Exit { session_id, code }).await;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    NoSession,
    Creating,
    Ready,
    /// The shell died on its own; the next Enter or exec starts a new one.
    Exited,
    Closing,
}

#[derive(Clone, Debug)]
pub struct TerminalOptions {
    pub config: Arc<Config>,
    /// Preferred shell; overrides `config.shell`.
    pub shell: Option<String>,
    pub exec_timeout: Duration,
    pub initial_size: TermSize,
}

impl TerminalOptions {
    pub fn from_config(config: Config) -> Self {
        Self {
            exec_timeout: config.exec_timeout(),
            config: Arc::new(config),
            shell: None,
            initial_size: TermSize::default(),
        }
    }
}

impl Default for TerminalOptions {
    fn default() -> Self {
        Self::from_config(Config::default())
    }
}

#[derive(Debug)]
struct Status {
    state: LifecycleState,
    session_id: Option<SessionId>,
    shell: Option<ShellSpec>,
}

type Reply<T> = oneshot::Sender<Result<T, TerminalError>>;

enum Command {
    Open {
        shell: Option<String>,
        reply: Reply<SessionId>,
    },
    Input {
        data: Vec<u8>,
        reply: Reply<()>,
    },
    Write {
        session_id: SessionId,
        data: Vec<u8>,
        reply: Reply<()>,
    },
    Resize {
        session_id: SessionId,
        size: TermSize,
        reply: Reply<()>,
    },
    SetFlowControl {
        session_id: SessionId,
        paused: bool,
        reply: Reply<()>,
    },
    Close {
        session_id: Option<SessionId>,
        reply: Reply<()>,
    },
    Exec {
        request: ExecRequest,
        reply: oneshot::Sender<ExecResult>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to one logical terminal. Cheap to clone; the terminal shuts down
/// when the last handle is dropped.
#[derive(Clone)]
pub struct Terminal {
    commands: mpsc::UnboundedSender<Command>,
    status: Arc<RwLock<Status>>,
}

impl std::fmt::Debug for Terminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Terminal")
            .field("status", &*self.status.read())
            .finish()
    }
}

impl Terminal {
    /// Start the terminal's actor on the current tokio runtime. No shell is
    /// started until one is needed.
    ///
    /// # Arguments
    /// * `options` - Config, preferred shell, exec timeout and initial size
    /// * `spawner` - Starts shells; [`crate::NativePtySpawner`] outside tests
    /// * `sink` - Receives display output and exits of every session
    ///
    /// # Returns
    /// A handle to the terminal. It must be called from within a tokio
    /// runtime, since the actor is spawned onto it.
    pub fn spawn(
        options: TerminalOptions,
        spawner: Arc<dyn PtySpawner>,
        sink: Arc<dyn TerminalSink>,
    ) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let status = Arc::new(RwLock::new(Status {
            state: LifecycleState::NoSession,
            session_id: None,
            shell: None,
        }));

        let actor = TerminalActor {
            size: options.initial_size,
            shell_choice: options.shell.clone(),
            options,
            spawner,
            sink,
            commands: commands_rx,
            events_tx,
            events,
            status: status.clone(),
            live: None,
            retiring: FxHashMap::default(),
            queue: ExecQueue::new(),
            deadline: None,
        };
        tokio::spawn(actor.run());

        Self { commands, status }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, TerminalError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| TerminalError::Closed)?;
        rx.await.map_err(|_| TerminalError::Closed)?
    }

    /// Make sure a session runs, switching shells if `shell` names a
    /// different one than the live session's.
    pub async fn open(&self, shell: Option<&str>) -> Result<SessionId, TerminalError> {
        let shell = shell.map(str::to_string);
        self.request(|reply| Command::Open { shell, reply }).await
    }

    /// Keystrokes from the user. Starts a session if there is none; after
    /// an exit, Enter starts a new one.
    pub async fn input(&self, data: impl Into<Vec<u8>>) -> Result<(), TerminalError> {
        let data = data.into();
        self.request(|reply| Command::Input { data, reply }).await
    }

    pub async fn write(
        &self,
        session_id: SessionId,
        data: impl Into<Vec<u8>>,
    ) -> Result<(), TerminalError> {
        let data = data.into();
        self.request(|reply| Command::Write {
            session_id,
            data,
            reply,
        })
        .await
    }

    /// Write base64-encoded input, for bytes that do not survive as text.
    pub async fn write_binary(
        &self,
        session_id: SessionId,
        encoded: &str,
    ) -> Result<(), TerminalError> {
        let data = base64::engine::general_purpose::STANDARD.decode(encoded.trim())?;
        self.write(session_id, data).await
    }

    /// Resize the session. Dimensions are clamped to the supported range and
    /// remembered for sessions started later.
    pub async fn resize(
        &self,
        session_id: SessionId,
        cols: u16,
        rows: u16,
    ) -> Result<(), TerminalError> {
        let size = TermSize::clamped(cols, rows);
        self.request(|reply| Command::Resize {
            session_id,
            size,
            reply,
        })
        .await
    }

    /// Pause or resume the session's output on behalf of the host.
    pub async fn set_flow_control(
        &self,
        session_id: SessionId,
        paused: bool,
    ) -> Result<(), TerminalError> {
        self.request(|reply| Command::SetFlowControl {
            session_id,
            paused,
            reply,
        })
        .await
    }

    /// Deliberately end a session. `None` closes whatever is live.
    pub async fn close(&self, session_id: Option<SessionId>) -> Result<(), TerminalError> {
        self.request(|reply| Command::Close { session_id, reply }).await
    }

    /// Run `command` in the shell and wait for its result.
    ///
    /// Requests run one at a time in the order they arrive. The exec timeout
    /// starts when the command is written to the shell, not while it waits
    /// in the queue. A timed-out request frees the queue for the next one;
    /// the shell is not interrupted.
    ///
    /// # Arguments
    /// * `command` - Shell command line, sent as typed
    ///
    /// # Returns
    /// The command's result. Failures (spawn, session exit, timeout, a
    /// non-zero status) are reported in the result, never as a panic.
    /// Dropping the future before the command is sent removes it from the
    /// queue.
    pub async fn exec(&self, command: impl Into<String>) -> ExecResult {
        let request = ExecRequest::new(command);
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Exec { request, reply }).is_err() {
            return ExecResult::failed(&TerminalError::Closed);
        }
        rx.await
            .unwrap_or_else(|_| ExecResult::failed(&TerminalError::Closed))
    }

    /// Stop the terminal, killing its session and failing pending requests.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.status.read().state
    }

    /// Id of the live session, if any.
    pub fn session_id(&self) -> Option<SessionId> {
        self.status.read().session_id
    }

    /// Shell of the live or most recent session.
    pub fn shell(&self) -> Option<ShellSpec> {
        self.status.read().shell.clone()
    }
}

/// When the active request gives up waiting for its done marker.
struct ExecDeadline {
    request_id: RequestId,
    sleep: Pin<Box<Sleep>>,
}

impl ExecDeadline {
    /// Resolves with the request id once `deadline` passes; never if unset.
    async fn expired(deadline: &mut Option<ExecDeadline>) -> RequestId {
        match deadline {
            Some(deadline) => {
                deadline.sleep.as_mut().await;
                deadline.request_id
            }
            None => std::future::pending().await,
        }
    }
}

struct LiveSession {
    pty: Box<dyn PtySession>,
    flow: Arc<FlowController>,
    noise: Arc<NoiseFilter>,
    interactive: InteractiveFilter,
}

struct TerminalActor {
    options: TerminalOptions,
    spawner: Arc<dyn PtySpawner>,
    sink: Arc<dyn TerminalSink>,
    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::Sender<SessionEvent>,
    events: mpsc::Receiver<SessionEvent>,
    status: Arc<RwLock<Status>>,
    shell_choice: Option<String>,
    size: TermSize,
    live: Option<LiveSession>,
    /// Deliberately closed sessions whose exit has not arrived yet.
    retiring: FxHashMap<SessionId, Arc<FlowController>>,
    queue: ExecQueue,
    deadline: Option<ExecDeadline>,
}

impl TerminalActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                // commands already sent are handled before newer output
                biased;
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        self.shutdown();
                        break;
                    };
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                // ahead of output so a flooding command cannot starve it
                request_id = ExecDeadline::expired(&mut self.deadline) => {
                    self.exec_timed_out(request_id).await;
                }
                Some(event) = self.events.recv() => self.handle_session_event(event).await,
            }
        }
        tracing::debug!("Terminal actor stopped");
    }

    fn set_state(&self, state: LifecycleState) {
        let mut status = self.status.write();
        if status.state != state {
            tracing::debug!("Terminal state {:?} -> {:?}", status.state, state);
        }
        status.state = state;
        status.session_id = self.live.as_ref().map(|live| live.pty.id());
        if let Some(live) = &self.live {
            status.shell = Some(live.pty.shell().clone());
        }
    }

    fn state(&self) -> LifecycleState {
        self.status.read().state
    }

    /// Returns false once the terminal should stop.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Open { shell, reply } => {
                let _ = reply.send(self.open(shell).await);
            }
            Command::Input { data, reply } => {
                let _ = reply.send(self.input(data).await);
            }
            Command::Write {
                session_id,
                data,
                reply,
            } => {
                let result = self
                    .live_mut(session_id)
                    .and_then(|live| live.pty.write(&data));
                let _ = reply.send(result);
            }
            Command::Resize {
                session_id,
                size,
                reply,
            } => {
                let result = self
                    .live_mut(session_id)
                    .and_then(|live| live.pty.resize(size));
                if result.is_ok() {
                    self.size = size;
                }
                let _ = reply.send(result);
            }
            Command::SetFlowControl {
                session_id,
                paused,
                reply,
            } => {
                let result = self.live_mut(session_id).map(|live| {
                    let target = live.pty.flow_target();
                    if paused {
                        target.pause(PauseReason::Consumer);
                    } else {
                        target.resume(PauseReason::Consumer);
                    }
                });
                let _ = reply.send(result);
            }
            Command::Close { session_id, reply } => {
                let result = match session_id {
                    Some(id) => self.live_mut(id).map(|_| ()),
                    None => Ok(()),
                };
                if result.is_ok() {
                    self.close_live(TerminalError::SessionClosed);
                }
                let _ = reply.send(result);
            }
            Command::Exec { request, reply } => {
                self.queue.enqueue(request, reply);
                self.dispatch_next().await;
            }
            Command::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn live_mut(&mut self, session_id: SessionId) -> Result<&mut LiveSession, TerminalError> {
        match self.live.as_mut() {
            Some(live) if live.pty.id() == session_id => Ok(live),
            _ => Err(TerminalError::SessionNotFound(session_id)),
        }
    }

    async fn open(&mut self, shell: Option<String>) -> Result<SessionId, TerminalError> {
        if let Some(choice) = shell {
            let wanted = ShellSpec::resolve(Some(&choice), &self.options.config);
            self.shell_choice = Some(choice);
            let switching = self
                .live
                .as_ref()
                .is_some_and(|live| live.pty.shell().path != wanted.path);
            if switching {
                tracing::info!("Switching shell to {}", wanted.path.display());
                self.close_live(TerminalError::SessionClosed);
            }
        }
        self.ensure_session().await
    }

    async fn input(&mut self, data: Vec<u8>) -> Result<(), TerminalError> {
        match self.state() {
            LifecycleState::Exited => {
                if data.iter().any(|&b| b == b'\r' || b == b'\n') {
                    self.ensure_session().await?;
                }
                Ok(())
            }
            _ => {
                self.ensure_session().await?;
                match self.live.as_mut() {
                    Some(live) => live.pty.write(&data),
                    None => Err(TerminalError::NoSession),
                }
            }
        }
    }

    /// Live session id, spawning a shell first if there is none.
    async fn ensure_session(&mut self) -> Result<SessionId, TerminalError> {
        if let Some(live) = &self.live {
            return Ok(live.pty.id());
        }
        self.set_state(LifecycleState::Creating);

        let config = self.options.config.clone();
        let shell = ShellSpec::resolve(self.shell_choice.as_deref(), &config);
        let request = SpawnRequest::new(shell.clone(), &config, self.size);
        let session_id = SessionId::new();
        let spawner = self.spawner.clone();
        let events = self.events_tx.clone();
        let spawned =
            tokio::task::spawn_blocking(move || spawner.spawn(session_id, &request, events)).await;

        let pty = match spawned {
            Ok(Ok(pty)) => pty,
            Ok(Err(e)) => {
                return Err(self.spawn_failed(session_id, &shell, format!("{e:#}")).await)
            }
            Err(e) => return Err(self.spawn_failed(session_id, &shell, e.to_string()).await),
        };

        let noise = Arc::new(NoiseFilter::new(
            shell.dialect,
            &config.noise_profile(&shell.name),
        ));
        let mut interactive = InteractiveFilter::new(noise.clone());
        interactive.suppress_next_prompt();
        let flow = Arc::new(FlowController::new(
            session_id,
            Watermarks::from(&config.flow),
            pty.flow_target(),
        ));
        tokio::spawn(flow.clone().run(self.sink.clone()));

        self.live = Some(LiveSession {
            pty,
            flow,
            noise,
            interactive,
        });
        self.set_state(LifecycleState::Ready);
        tracing::info!("Session {} ready ({})", session_id, shell.name);
        Ok(session_id)
    }

    /// Log the failure and tell the user on the display, which would
    /// otherwise stay blank.
    async fn spawn_failed(
        &mut self,
        session_id: SessionId,
        shell: &ShellSpec,
        reason: String,
    ) -> TerminalError {
        let notice = spawn_failure_notice(shell, &reason);
        let error = TerminalError::SessionSpawn {
            shell: shell.path.display().to_string(),
            reason,
        };
        tracing::error!("{}", error);
        self.set_state(LifecycleState::NoSession);
        self.sink.on_data(session_id, notice.into_bytes()).await;
        error
    }

    /// Start queued requests until one is in flight or the queue is empty.
    async fn dispatch_next(&mut self) {
        while let Some(request) = self.queue.pop_next() {
            if let Err(error) = self.ensure_session().await {
                self.queue
                    .resolve(request.request_id, ExecResult::failed(&error));
                self.queue.fail_all(&error);
                return;
            }
            let Some(live) = self.live.as_mut() else {
                return;
            };

            let markers = Markers::for_request(&request.request_id);
            let payload = encode(&request.command, &markers, live.pty.shell().dialect);
            match live.pty.write(payload.as_bytes()) {
                Ok(()) => {
                    tracing::debug!(
                        "Dispatched exec {} to session {}",
                        request.request_id,
                        live.pty.id()
                    );
                    let decoder = ExecDecoder::new(markers, live.noise.clone());
                    self.queue.activate(request.request_id, decoder);
                    self.deadline = Some(ExecDeadline {
                        request_id: request.request_id,
                        sleep: Box::pin(tokio::time::sleep(self.options.exec_timeout)),
                    });
                }
                Err(error) => {
                    tracing::warn!("Exec {} not sent: {}", request.request_id, error);
                    self.queue
                        .resolve(request.request_id, ExecResult::failed(&error));
                }
            }
        }
    }

    /// Give up on the active request and move on to the next one.
    ///
    /// The shell is left alone. Whatever the abandoned command prints later
    /// goes to the display, or is skipped by the next request while it waits
    /// for its begin marker.
    async fn exec_timed_out(&mut self, request_id: RequestId) {
        self.deadline = None;
        if self.queue.active_id() != Some(request_id) {
            return;
        }
        let error = TerminalError::ExecTimeout {
            timeout: self.options.exec_timeout,
        };
        tracing::warn!("Exec {} timed out: {}", request_id, error);
        self.queue.finish_active(ExecResult::failed(&error));
        self.dispatch_next().await;
    }

    async fn handle_session_event(&mut self, event: SessionEvent) {
        let session_id = event.session_id();
        let is_live = self
            .live
            .as_ref()
            .is_some_and(|live| live.pty.id() == session_id);

        match event {
            SessionEvent::Data { chunk, .. } if is_live => {
                tracing::trace!("Session {}: {} bytes", session_id, chunk.len());
                self.route_output(chunk).await;
            }
            SessionEvent::Exit { code, .. } if is_live => self.session_exited(code).await,
            SessionEvent::Exit { code, .. } => match self.retiring.remove(&session_id) {
                Some(flow) => flow.push_exit(code),
                None => tracing::trace!("Ignoring exit of stale session {}", session_id),
            },
            SessionEvent::Data { .. } => {
                tracing::trace!("Ignoring output of stale session {}", session_id);
            }
        }
    }

    /// Split live output between the active exec and the interactive display.
    async fn route_output(&mut self, chunk: Vec<u8>) {
        let Some(live) = self.live.as_mut() else {
            return;
        };

        let mut display = Vec::new();
        let mut completion = None;
        let interactive = match self.queue.active_mut() {
            Some(active) => {
                let feed = active.decoder.feed(&chunk);
                display = feed.display;
                completion = feed.completion;
                feed.remainder
            }
            None => chunk,
        };
        if completion.is_some() {
            live.interactive.suppress_next_prompt();
        }
        if !interactive.is_empty() {
            display.extend(live.interactive.filter(&interactive));
        }
        live.flow.push(display);

        if let Some(completion) = completion {
            self.deadline = None;
            let result = ExecResult::completed(completion.exit_code, completion.stdout);
            if let Some(request_id) = self.queue.finish_active(result) {
                tracing::debug!(
                    "Exec {} finished with code {}",
                    request_id,
                    completion.exit_code
                );
            }
            self.dispatch_next().await;
        }
    }

    /// The live shell went away without being asked to.
    async fn session_exited(&mut self, code: Option<i32>) {
        let Some(live) = self.live.take() else {
            return;
        };
        let session_id = live.pty.id();
        tracing::info!("Session {} exited with {:?}", session_id, code);

        live.flow.force_resume();
        live.flow.push(exit_notice(code).into_bytes());
        live.flow.push_exit(code);
        self.queue.fail_all(&TerminalError::SessionExited { code });
        self.set_state(LifecycleState::Exited);
    }

    /// Tear down the live session on purpose: no notice, pending requests
    /// fail with `error`.
    fn close_live(&mut self, error: TerminalError) {
        let Some(mut live) = self.live.take() else {
            return;
        };
        self.set_state(LifecycleState::Closing);
        let session_id = live.pty.id();
        tracing::info!("Closing session {}", session_id);

        self.queue.fail_all(&error);
        live.flow.force_resume();
        live.pty.kill();
        self.retiring.insert(session_id, live.flow.clone());
        self.set_state(LifecycleState::NoSession);
    }

    fn shutdown(&mut self) {
        self.close_live(TerminalError::Closed);
        self.queue.fail_all(&TerminalError::Closed);
        for (_, flow) in self.retiring.drain() {
            flow.close();
        }
    }
}

fn exit_notice(code: Option<i32>) -> String {
    let status = match code {
        Some(code) => format!("exited with code {code}"),
        None => "exited".to_string(),
    };
    format!("\r\n[Process {status}. Press Enter to start a new session.]\r\n")
}

fn spawn_failure_notice(shell: &ShellSpec, reason: &str) -> String {
    format!(
        "\r\n[Failed to start shell {}: {reason}]\r\n",
        shell.path.display()
    )
}
