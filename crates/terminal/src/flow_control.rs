//! Output flow control between a session and its display sink.
//!
//! Output is queued per session and handed to the sink one chunk at a time,
//! each delivery awaited before the next starts. When more than the high
//! watermark is waiting, the session's reader is paused. It resumes once the
//! backlog drains to the low watermark.

use crate::lifecycle::TerminalSink;
use crate::types::SessionId;
use parking_lot::Mutex;
use settings::FlowConfig;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

/// Why a session's reader is held.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PauseReason {
    /// Too much output is waiting for the sink.
    Backpressure,
    /// The host asked for a pause.
    Consumer,
}

/// Something whose output can be paused. Implemented by the session's read gate.
#[cfg_attr(test, mockall::automock)]
pub trait FlowTarget: Send + Sync {
    fn pause(&self, reason: PauseReason);
    fn resume(&self, reason: PauseReason);
}

/// Hysteresis thresholds in bytes. `low` is always below `high`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Watermarks {
    pub high: usize,
    pub low: usize,
}

impl Watermarks {
    pub fn new(high: usize, low: usize) -> Self {
        let high = high.max(1);
        Self {
            high,
            low: low.min(high - 1),
        }
    }
}

impl Default for Watermarks {
    fn default() -> Self {
        Self::from(&FlowConfig::default())
    }
}

impl From<&FlowConfig> for Watermarks {
    fn from(config: &FlowConfig) -> Self {
        Self::new(config.high_watermark, config.low_watermark)
    }
}

/// One item for the sink.
#[derive(Debug, PartialEq, Eq)]
pub enum Delivery {
    Data(Vec<u8>),
    Exit(Option<i32>),
}

#[derive(Debug, Default)]
struct FlowState {
    pending: VecDeque<Delivery>,
    /// Bytes queued or being delivered.
    pending_bytes: usize,
    paused: bool,
    exit_queued: bool,
    closed: bool,
}

pub struct FlowController {
    session_id: SessionId,
    watermarks: Watermarks,
    target: Arc<dyn FlowTarget>,
    state: Mutex<FlowState>,
    wake: Notify,
}

impl std::fmt::Debug for FlowController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowController")
            .field("session_id", &self.session_id)
            .field("watermarks", &self.watermarks)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl FlowController {
    pub fn new(session_id: SessionId, watermarks: Watermarks, target: Arc<dyn FlowTarget>) -> Self {
        Self {
            session_id,
            watermarks,
            target,
            state: Mutex::new(FlowState::default()),
            wake: Notify::new(),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Queue output for the sink, pausing the session above the high watermark.
    pub fn push(&self, chunk: Vec<u8>) {
        if chunk.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        if state.closed || state.exit_queued {
            return;
        }
        state.pending_bytes += chunk.len();
        state.pending.push_back(Delivery::Data(chunk));
        if !state.paused && state.pending_bytes > self.watermarks.high {
            state.paused = true;
            tracing::debug!(
                "Pausing session {}: {} bytes pending",
                self.session_id,
                state.pending_bytes
            );
            self.target.pause(PauseReason::Backpressure);
        }
        drop(state);
        self.wake.notify_one();
    }

    /// Queue the exit notification. Nothing is accepted after it.
    pub fn push_exit(&self, code: Option<i32>) {
        let mut state = self.state.lock();
        if state.closed || state.exit_queued {
            return;
        }
        state.exit_queued = true;
        state.pending.push_back(Delivery::Exit(code));
        drop(state);
        self.wake.notify_one();
    }

    /// Take the next item for the sink. Data stays counted until [`Self::complete`].
    pub fn next(&self) -> Option<Delivery> {
        self.state.lock().pending.pop_front()
    }

    /// A data delivery of `len` bytes finished.
    pub fn complete(&self, len: usize) {
        let mut state = self.state.lock();
        state.pending_bytes = state.pending_bytes.saturating_sub(len);
        if state.paused && state.pending_bytes <= self.watermarks.low {
            state.paused = false;
            tracing::debug!(
                "Resuming session {}: {} bytes pending",
                self.session_id,
                state.pending_bytes
            );
            self.target.resume(PauseReason::Backpressure);
        }
    }

    /// Lift a backpressure pause regardless of the backlog.
    pub fn force_resume(&self) {
        let mut state = self.state.lock();
        if state.paused {
            state.paused = false;
            self.target.resume(PauseReason::Backpressure);
        }
    }

    /// Drop everything queued and stop the pump.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.pending.clear();
        state.pending_bytes = 0;
        drop(state);
        self.force_resume();
        self.wake.notify_one();
    }

    pub fn pending_bytes(&self) -> usize {
        self.state.lock().pending_bytes
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Deliver queued output to `sink` until the exit has been delivered or
    /// the controller is closed.
    pub async fn run(self: Arc<Self>, sink: Arc<dyn TerminalSink>) {
        loop {
            let next = {
                let mut state = self.state.lock();
                if state.closed {
                    break;
                }
                state.pending.pop_front()
            };
            match next {
                Some(Delivery::Data(chunk)) => {
                    let len = chunk.len();
                    sink.on_data(self.session_id, chunk).await;
                    self.complete(len);
                }
                Some(Delivery::Exit(code)) => {
                    sink.on_exit(self.session_id, code).await;
                    break;
                }
                None => self.wake.notified().await,
            }
        }
        tracing::trace!("Flow pump for session {} finished", self.session_id);
    }
}
