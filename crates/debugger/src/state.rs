use serde::Serialize;

use crate::{engine::RunOutcome, types::StoppedEvent};

/// Current debugger mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RunState {
    /// The engine is not halted: a script is executing or the engine is idle
    Running,
    /// Halted at a breakpoint, step or break request
    Stopped,
    /// An abort was requested and the script has not finished yet
    Aborting,
    Terminated,
}

/// Lifecycle notifications published to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Stopped(StoppedEvent),
    Running,
    ExecutionCompleted(RunOutcome),
    Terminated,
}

impl SessionEvent {
    pub fn is_stopped(&self) -> bool {
        matches!(self, SessionEvent::Stopped(_))
    }
}
