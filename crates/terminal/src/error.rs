//! Error taxonomy for sessions and exec requests.

use crate::types::SessionId;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("failed to start shell {shell}: {reason}")]
    SessionSpawn { shell: String, reason: String },

    #[error("terminal has no live session")]
    NoSession,

    #[error("no live session with id {0}")]
    SessionNotFound(SessionId),

    #[error("failed to write to session {session_id}: {source}")]
    Write {
        session_id: SessionId,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to resize session {session_id}: {reason}")]
    Resize { session_id: SessionId, reason: String },

    #[error("invalid base64 input: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("terminal session exited ({})", describe_exit(.code))]
    SessionExited { code: Option<i32> },

    #[error("terminal session was closed")]
    SessionClosed,

    #[error("no result after {timeout:?}; the shell may be stuck")]
    ExecTimeout { timeout: Duration },

    #[error("command exited with code {code}")]
    NonZeroExit { code: i32 },

    #[error("terminal has shut down")]
    Closed,
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "no exit code".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn exit_messages_include_code() {
        assert_eq!(
            TerminalError::SessionExited { code: Some(130) }.to_string(),
            "terminal session exited (code 130)"
        );
        assert_eq!(
            TerminalError::SessionExited { code: None }.to_string(),
            "terminal session exited (no exit code)"
        );
        assert_eq!(
            TerminalError::NonZeroExit { code: 7 }.to_string(),
            "command exited with code 7"
        );
    }

    #[test]
    fn timeout_message_reports_seconds() {
        let err = TerminalError::ExecTimeout {
            timeout: Duration::from_secs(1800),
        };
        assert_eq!(err.to_string(), "no result after 1800s; the shell may be stuck");
    }

    #[test]
    fn timeout_message_keeps_subsecond_precision() {
        let err = TerminalError::ExecTimeout {
            timeout: Duration::from_millis(200),
        };
        assert_eq!(err.to_string(), "no result after 200ms; the shell may be stuck");
    }

    #[test]
    fn write_error_keeps_io_source() {
        let err = TerminalError::Write {
            session_id: SessionId::new(),
            source: std::io::Error::from(std::io::ErrorKind::BrokenPipe),
        };
        assert!(std::error::Error::source(&err).is_some());
    }
}
