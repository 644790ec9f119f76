use std::{path::PathBuf, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::{
    async_event::AsyncEventReceiver,
    channel::TakeError,
    error::DebugError,
    handles::VariableHandle,
    session::DebugSession,
    types::{
        Breakpoint, CommandBreakpoint, EvaluateResult, SourceBreakpoint, StackFrame, StoppedEvent,
        Variable, VariableScope,
    },
};

/// Async surface over [`DebugSession`] for tokio based protocol layers.
///
/// Every call runs on the blocking pool. Dropping the session cancels waits
/// that are still outstanding.
pub struct AsyncDebugSession {
    inner: Arc<DebugSession>,
    cancel_token: CancellationToken,
}

impl AsyncDebugSession {
    pub fn new(session: DebugSession) -> Self {
        Self {
            inner: Arc::new(session),
            cancel_token: CancellationToken::new(),
        }
    }

    /// The blocking session, for the non-blocking state changes
    /// (resume, break, abort)
    pub fn session(&self) -> &DebugSession {
        &self.inner
    }

    pub fn events(&self) -> AsyncEventReceiver {
        AsyncEventReceiver::forward(self.inner.events())
    }

    pub async fn set_line_breakpoints(
        &self,
        path: PathBuf,
        requested: Vec<SourceBreakpoint>,
    ) -> Result<Vec<Breakpoint>, DebugError> {
        self.blocking(move |session, cancel| {
            session.set_line_breakpoints(&path, &requested, cancel)
        })
        .await
    }

    pub async fn set_command_breakpoints(
        &self,
        requested: Vec<CommandBreakpoint>,
    ) -> Result<Vec<Breakpoint>, DebugError> {
        self.blocking(move |session, cancel| session.set_command_breakpoints(&requested, cancel))
            .await
    }

    pub async fn remove_all_breakpoints(&self) -> Result<(), DebugError> {
        self.blocking(|session, cancel| session.remove_all_breakpoints(cancel))
            .await
    }

    pub async fn get_stack_frames(&self) -> Result<Vec<StackFrame>, DebugError> {
        self.blocking(|session, _| session.get_stack_frames()).await
    }

    pub async fn get_variable_scopes(&self, frame: usize) -> Result<Vec<VariableScope>, DebugError> {
        self.blocking(move |session, _| session.get_variable_scopes(frame))
            .await
    }

    pub async fn get_variables(&self, handle: VariableHandle) -> Result<Vec<Variable>, DebugError> {
        self.blocking(move |session, cancel| session.get_variables(handle, cancel))
            .await
    }

    pub async fn set_variable(
        &self,
        handle: VariableHandle,
        name: String,
        expression: String,
    ) -> Result<String, DebugError> {
        self.blocking(move |session, cancel| {
            session.set_variable(handle, &name, &expression, cancel)
        })
        .await
    }

    pub async fn evaluate(
        &self,
        expression: String,
        frame: usize,
    ) -> Result<EvaluateResult, DebugError> {
        self.blocking(move |session, cancel| session.evaluate(&expression, frame, cancel))
            .await
    }

    /// Wait for the next stop event
    pub async fn next_stop(&self, timeout: Duration) -> Result<StoppedEvent, TakeError> {
        let stops = self.inner.stops();
        let cancel = self.cancel_token.child_token();
        tokio::task::spawn_blocking(move || stops.take(timeout, &cancel))
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "stop wait task failed");
                TakeError::Closed
            })?
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T, DebugError>
    where
        F: FnOnce(&DebugSession, &CancellationToken) -> Result<T, DebugError> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let cancel = self.cancel_token.child_token();
        tokio::task::spawn_blocking(move || f(&inner, &cancel))
            .await
            .map_err(|e| DebugError::Internal(format!("blocking task failed: {e}")))?
    }
}

impl Drop for AsyncDebugSession {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
