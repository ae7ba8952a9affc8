//! Terminal session core.
//!
//! Hosts interactive shells in pseudo-terminals and lets programmatic callers
//! run commands through those same shells, receiving structured results while
//! the output still streams to the display. This crate has no UI dependency:
//! a host feeds it input and drains [`TerminalEvent`]s (or implements
//! [`TerminalSink`]).

mod error;
pub mod exec_queue;
pub mod flow_control;
pub mod lifecycle;
pub mod noise;
pub mod protocol;
pub mod pty_handler;
pub mod registry;
pub mod shell;
pub mod types;

pub use error::TerminalError;
pub use exec_queue::{ExecQueue, ExecRequest};
pub use flow_control::{FlowController, FlowTarget, PauseReason, Watermarks};
pub use lifecycle::{ChannelSink, LifecycleState, Terminal, TerminalOptions, TerminalSink};
pub use noise::{InteractiveFilter, NoiseFilter};
pub use protocol::{ExecDecoder, Markers};
pub use pty_handler::{NativePtySpawner, PtySession, PtySpawner, SessionEvent, SpawnRequest};
pub use registry::TerminalRegistry;
pub use shell::{ShellDialect, ShellSpec};
pub use types::*;
