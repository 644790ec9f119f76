use crate::{engine::EngineError, handles::VariableHandle, state::RunState};

/// Errors surfaced to the protocol layer by session operations.
///
/// Breakpoint registration problems are not errors: they come back as
/// unverified breakpoints with a message.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DebugError {
    /// A read or write was issued while the engine is not halted
    #[error("debugger is not stopped (current state: {state:?})")]
    NotStopped { state: RunState },

    /// The handle was issued during an earlier stop
    #[error("variable handle {handle} belongs to a previous stop, re-fetch the scopes")]
    StaleHandle { handle: VariableHandle },

    /// The handle was never issued during the current stop
    #[error("unknown variable handle {handle}")]
    UnknownHandle { handle: VariableHandle },

    #[error("no stack frame at index {index}")]
    UnknownFrame { index: usize },

    #[error("variable '{name}' does not exist in this scope")]
    VariableNotFound { name: String },

    /// The engine failed to evaluate an expression
    #[error("{0}")]
    Evaluation(String),

    /// The assigned value could not be converted to the variable's declared type
    #[error("cannot convert value for '{name}' to type [{type_name}]: {message}")]
    Coercion {
        name: String,
        type_name: String,
        message: String,
    },

    #[error("variables can only be set on scope containers")]
    SetVariableUnsupported,

    /// The operation is not valid in the current run state
    #[error("{operation} is not valid while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: RunState,
    },

    /// The session has been aborted or disconnected
    #[error("debug session has terminated")]
    Terminated,

    /// The engine thread exited unexpectedly
    #[error("script engine thread is no longer running")]
    EngineTerminated,

    #[error("timed out waiting for the script engine")]
    Timeout,

    #[error("request cancelled")]
    Cancelled,

    /// More containers were materialized in a single stop than a handle can address
    #[error("variable handle space exhausted")]
    HandleSpaceExhausted,

    /// Internal bookkeeping failed
    #[error("internal error: {0}")]
    Internal(String),
}

impl DebugError {
    /// Whether the session is still usable after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, DebugError::Terminated | DebugError::EngineTerminated)
    }
}

impl From<EngineError> for DebugError {
    fn from(value: EngineError) -> Self {
        DebugError::Evaluation(value.message)
    }
}
