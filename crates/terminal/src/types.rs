//! Terminal data types.
//!
//! Identifiers, geometry and the result record handed back to exec callers.
//! Kept free of behavior so they can be built in tests without a PTY.

use crate::error::TerminalError;
use once_cell::sync::Lazy;
use portable_pty::PtySize;
use serde::{Deserialize, Serialize};
use settings::constants::terminal::{MAX_COLS, MAX_ROWS, MIN_COLS, MIN_ROWS};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Identifies one live shell process. A re-created session gets a new id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a logical terminal, which outlives the sessions it hosts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TerminalId(pub u32);

impl fmt::Display for TerminalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "term-{}", self.0)
    }
}

/// Correlates an exec request with its markers and its waiting caller.
///
/// Rendered as `<process-start-ms hex>-<sequence>`, which only contains
/// characters that are safe inside single quotes and regexes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RequestId {
    epoch_ms: u64,
    seq: u64,
}

static PROCESS_EPOCH_MS: Lazy<u64> = Lazy::new(|| {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
});
static NEXT_REQUEST: AtomicU64 = AtomicU64::new(1);

impl RequestId {
    /// Draw a fresh id; never repeats within this process.
    pub fn next() -> Self {
        Self {
            epoch_ms: *PROCESS_EPOCH_MS,
            seq: NEXT_REQUEST.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}-{}", self.epoch_ms, self.seq)
    }
}

/// Terminal dimensions in rows and columns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TermSize {
    fn default() -> Self {
        Self {
            cols: settings::constants::terminal::DEFAULT_COLS,
            rows: settings::constants::terminal::DEFAULT_ROWS,
        }
    }
}

impl TermSize {
    /// Size with both dimensions clamped to the supported range.
    pub fn clamped(cols: u16, rows: u16) -> Self {
        Self {
            cols: cols.clamp(MIN_COLS, MAX_COLS),
            rows: rows.clamp(MIN_ROWS, MAX_ROWS),
        }
    }

    pub fn to_pty_size(self) -> PtySize {
        PtySize {
            rows: self.rows,
            cols: self.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// Outcome of one exec request.
///
/// `stderr` is always empty: a PTY merges both streams into `stdout`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecResult {
    /// Result for a command that ran to completion.
    pub fn completed(exit_code: i32, stdout: String) -> Self {
        Self {
            success: exit_code == 0,
            exit_code: Some(exit_code),
            stdout,
            stderr: String::new(),
            error: (exit_code != 0)
                .then(|| TerminalError::NonZeroExit { code: exit_code }.to_string()),
        }
    }

    /// Result for a request that never produced an exit code.
    pub fn failed(error: &TerminalError) -> Self {
        Self {
            success: false,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(error.to_string()),
        }
    }
}

/// Event delivered to the display side of a terminal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TerminalEvent {
    /// Output bytes, already stripped of protocol markers and noise.
    Data { session_id: SessionId, chunk: Vec<u8> },
    /// The session's process is gone. Sent once per session, after its data.
    Exit {
        session_id: SessionId,
        code: Option<i32>,
    },
}
