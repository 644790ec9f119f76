//! Commands sent from client threads to the engine thread.
//!
//! The engine thread is the only place the engine is touched. Client threads
//! describe what they need as a [`Command`] and, where a result is expected,
//! wait on a oneshot channel carried inside the command.

use std::fmt;

use crate::engine::{EngineContext, ResumeAction, RunOutcome, ScriptSource};

/// Work to run against the engine on its own thread
pub(crate) type EngineJob = Box<dyn FnOnce(&mut dyn EngineContext) + Send>;

pub(crate) enum Command {
    /// Run a job against the engine at the next opportunity: immediately when
    /// idle or stopped, at the next safe point while a script runs
    Call(EngineJob),

    /// Start executing a script, reporting the outcome when it finishes
    Execute {
        script: ScriptSource,
        done: oneshot::Sender<RunOutcome>,
    },

    /// Leave the current stop
    Resume(ResumeAction),

    /// Abort anything running and exit the engine thread
    Shutdown,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Call(_) => f.write_str("Call"),
            Command::Execute { script, .. } => f
                .debug_struct("Execute")
                .field("script", script)
                .finish_non_exhaustive(),
            Command::Resume(action) => f.debug_tuple("Resume").field(action).finish(),
            Command::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// What the engine thread is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerState {
    /// Waiting for a script to execute
    Idle,

    /// A script is running
    Executing,

    /// A script is halted and the thread is servicing jobs
    Stopped,

    /// Shutting down
    Shutdown,
}
