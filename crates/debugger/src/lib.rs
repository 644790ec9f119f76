//! Debug session engine
//!
//! Sits between a debug adapter protocol layer and a script engine's native
//! debugger: tracks breakpoints, turns engine halts into stop events and
//! exposes the paused call stack and variables through per-stop handles.
mod async_event;
mod async_session;
mod breakpoints;
mod channel;
mod commands;
pub mod engine;
mod error;
mod executor;
mod formatter;
mod handles;
mod internals;
mod session;
pub(crate) mod state;
mod types;
pub mod utils;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use async_event::AsyncEventReceiver;
pub use async_session::AsyncDebugSession;
pub use breakpoints::operator_hint;
pub use channel::{StopReceiver, StopSender, TakeError, stop_channel};
pub use error::DebugError;
pub use formatter::{FormattedValue, ValueFormatter};
pub use handles::VariableHandle;
pub use session::{DebugSession, ExecutionHandle};
pub use state::{RunState, SessionEvent};
pub use types::{
    AUTO_SCOPE_NAME, Breakpoint, BreakpointId, BreakpointKind, CommandBreakpoint, EvaluateResult,
    FrameScopes, GLOBAL_SCOPE_NAME, LOCAL_SCOPE_NAME, NO_FILE_SCRIPT_PATH, SCRIPT_SCOPE_NAME,
    SourceBreakpoint, StackFrame, StoppedEvent, Variable, VariableScope,
};
