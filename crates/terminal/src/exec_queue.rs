//! FIFO of exec requests for one terminal.
//!
//! The queue only does bookkeeping. The terminal actor decides when to
//! dispatch, so at most one request is ever active per session.

use crate::error::TerminalError;
use crate::protocol::ExecDecoder;
use crate::types::{ExecResult, RequestId};
use collections::FxHashMap;
use std::collections::VecDeque;
use tokio::sync::oneshot;

/// A command waiting to run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecRequest {
    pub request_id: RequestId,
    pub command: String,
}

impl ExecRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            request_id: RequestId::next(),
            command: command.into(),
        }
    }
}

/// The request whose wrapped command has been written to the shell.
#[derive(Debug)]
pub struct ActiveExec {
    pub request_id: RequestId,
    pub decoder: ExecDecoder,
}

#[derive(Debug, Default)]
pub struct ExecQueue {
    queued: VecDeque<ExecRequest>,
    waiters: FxHashMap<RequestId, oneshot::Sender<ExecResult>>,
    active: Option<ActiveExec>,
}

impl ExecQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a request; `reply` receives its result.
    pub fn enqueue(&mut self, request: ExecRequest, reply: oneshot::Sender<ExecResult>) {
        tracing::debug!(
            "Queued exec {} ({} ahead): {}",
            request.request_id,
            self.len(),
            util::truncate_for_log(&request.command, 80)
        );
        self.waiters.insert(request.request_id, reply);
        self.queued.push_back(request);
    }

    /// Next request to dispatch, or `None` while one is still active.
    ///
    /// Requests whose caller has stopped waiting are dropped, never sent.
    pub fn pop_next(&mut self) -> Option<ExecRequest> {
        if self.active.is_some() {
            return None;
        }
        while let Some(request) = self.queued.pop_front() {
            let abandoned = self
                .waiters
                .get(&request.request_id)
                .map_or(true, oneshot::Sender::is_closed);
            if !abandoned {
                return Some(request);
            }
            self.waiters.remove(&request.request_id);
            tracing::debug!("Dropped exec {}: caller stopped waiting", request.request_id);
        }
        None
    }

    pub fn activate(&mut self, request_id: RequestId, decoder: ExecDecoder) {
        if let Some(active) = &self.active {
            util::debug_panic!(
                "activating exec {} while {} is still active",
                request_id,
                active.request_id
            );
        }
        self.active = Some(ActiveExec {
            request_id,
            decoder,
        });
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_id(&self) -> Option<RequestId> {
        self.active.as_ref().map(|active| active.request_id)
    }

    pub fn active_mut(&mut self) -> Option<&mut ActiveExec> {
        self.active.as_mut()
    }

    /// Resolve the active request. Returns its id, if there was one.
    pub fn finish_active(&mut self, result: ExecResult) -> Option<RequestId> {
        let active = self.active.take()?;
        self.resolve(active.request_id, result);
        Some(active.request_id)
    }

    /// Hand `result` to the caller waiting on `request_id`.
    ///
    /// Returns false when nobody is waiting any more.
    pub fn resolve(&mut self, request_id: RequestId, result: ExecResult) -> bool {
        let Some(reply) = self.waiters.remove(&request_id) else {
            return false;
        };
        if reply.send(result).is_err() {
            tracing::debug!("Exec {} finished after its caller gave up", request_id);
            return false;
        }
        true
    }

    /// Fail the active request and everything queued behind it.
    ///
    /// Returns how many requests were failed.
    pub fn fail_all(&mut self, error: &TerminalError) -> usize {
        let result = ExecResult::failed(error);
        let mut failed = 0;
        if let Some(active) = self.active.take() {
            self.resolve(active.request_id, result.clone());
            failed += 1;
        }
        while let Some(request) = self.queued.pop_front() {
            self.resolve(request.request_id, result.clone());
            failed += 1;
        }
        if failed > 0 {
            tracing::warn!("Failed {} exec request(s): {}", failed, error);
        }
        failed
    }

    /// Requests not yet resolved, the active one included.
    pub fn len(&self) -> usize {
        self.queued.len() + usize::from(self.active.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
