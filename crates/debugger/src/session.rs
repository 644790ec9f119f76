use std::{
    path::Path,
    sync::{Arc, Mutex, OnceLock},
    time::{Duration, Instant},
};

use config::Config;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    channel::{StopReceiver, TakeError, stop_channel},
    engine::{
        EngineContext, EngineStop, ResumeAction, RunOutcome, ScriptEngine, ScriptSource,
        Workspace,
    },
    error::DebugError,
    executor::{EngineObserver, Executor},
    formatter::ValueFormatter,
    handles::VariableHandle,
    internals::{SessionInternals, lock_recovering},
    state::{RunState, SessionEvent},
    types::{
        Breakpoint, CommandBreakpoint, EvaluateResult, SourceBreakpoint, StackFrame, StoppedEvent,
        Variable, VariableScope,
    },
};

const POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Engine callbacks routed into the shared session state
struct SessionHooks {
    internals: Arc<Mutex<SessionInternals>>,
}

impl EngineObserver for SessionHooks {
    fn on_stop(&self, cx: &mut dyn EngineContext, stop: EngineStop) -> bool {
        lock_recovering(&self.internals).on_stop(cx, stop)
    }

    fn on_complete(&self, outcome: &RunOutcome) {
        lock_recovering(&self.internals).on_complete(outcome);
    }

    fn on_exit(&self, panicked: bool) {
        let mut internals = lock_recovering(&self.internals);
        if panicked {
            internals.executing = false;
        }
        internals.terminate();
    }
}

/// A script execution in flight
#[derive(Debug)]
pub struct ExecutionHandle {
    done: oneshot::Receiver<RunOutcome>,
    outcome: OnceLock<RunOutcome>,
}

impl ExecutionHandle {
    fn new(done: oneshot::Receiver<RunOutcome>) -> Self {
        Self {
            done,
            outcome: OnceLock::new(),
        }
    }

    /// Wait for the execution to finish. Once finished, every call returns
    /// the same outcome.
    pub fn wait(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, DebugError> {
        if let Some(outcome) = self.outcome.get() {
            return Ok(outcome.clone());
        }
        let deadline = Instant::now() + timeout;
        loop {
            match self.done.recv_timeout(POLL_TIMEOUT) {
                Ok(outcome) => return Ok(self.outcome.get_or_init(|| outcome).clone()),
                Err(oneshot::RecvTimeoutError::Timeout) => {
                    if cancel.is_cancelled() {
                        return Err(DebugError::Cancelled);
                    }
                    if Instant::now() >= deadline {
                        return Err(DebugError::Timeout);
                    }
                }
                Err(oneshot::RecvTimeoutError::Disconnected) => {
                    return Err(DebugError::EngineTerminated);
                }
            }
        }
    }
}

/// Represents a debugging session against one script engine
pub struct DebugSession {
    internals: Arc<Mutex<SessionInternals>>,
    executor: Executor,
    stops: StopReceiver,
    events: crossbeam_channel::Receiver<SessionEvent>,
    request_timeout: Duration,
}

impl DebugSession {
    /// Start a session, moving the engine onto its own thread
    #[tracing::instrument(skip_all)]
    pub fn new(
        engine: impl ScriptEngine + 'static,
        workspace: Arc<dyn Workspace>,
        config: &Config,
    ) -> eyre::Result<Self> {
        tracing::debug!("creating new debug session");
        let (publisher, events) = crossbeam_channel::unbounded();
        let (stop_tx, stops) = stop_channel();

        let internals = Arc::new(Mutex::new(SessionInternals::new(
            ValueFormatter::new(&config.formatting),
            publisher,
            stop_tx,
            workspace,
        )));
        let hooks = Arc::new(SessionHooks {
            internals: Arc::clone(&internals),
        });
        let executor = Executor::spawn(Box::new(engine), hooks)?;

        Ok(Self {
            internals,
            executor,
            stops,
            events,
            request_timeout: config.session.request_timeout(),
        })
    }

    /// Lifecycle events of the session
    pub fn events(&self) -> crossbeam_channel::Receiver<SessionEvent> {
        self.events.clone()
    }

    /// The stop event queue. Each event is taken by exactly one consumer.
    pub fn stops(&self) -> StopReceiver {
        self.stops.clone()
    }

    /// Block until the next stop event
    pub fn wait_for_stop(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<StoppedEvent, TakeError> {
        self.stops.take(timeout, cancel)
    }

    pub fn run_state(&self) -> RunState {
        lock_recovering(&self.internals).run_state
    }

    /// Start executing a script. Only one execution may be in flight.
    #[tracing::instrument(skip(self))]
    pub fn execute(&self, script: ScriptSource) -> Result<ExecutionHandle, DebugError> {
        self.with_internals(|internals| {
            internals.ensure_live()?;
            if internals.executing {
                return Err(DebugError::InvalidState {
                    operation: "execute",
                    state: internals.run_state,
                });
            }
            let done = self.executor.execute(script)?;
            internals.executing = true;
            internals.set_state(RunState::Running);
            Ok(ExecutionHandle::new(done))
        })
    }

    /// Replace every line breakpoint in `path`
    #[tracing::instrument(skip(self, requested, cancel))]
    pub fn set_line_breakpoints(
        &self,
        path: impl AsRef<Path> + std::fmt::Debug,
        requested: &[SourceBreakpoint],
        cancel: &CancellationToken,
    ) -> Result<Vec<Breakpoint>, DebugError> {
        let path = path.as_ref().to_path_buf();
        let requested = requested.to_vec();
        self.with_engine(cancel, move |internals, cx| {
            Ok(internals
                .breakpoints
                .set_line_breakpoints(cx, &path, &requested))
        })
    }

    /// Replace the global set of command breakpoints
    #[tracing::instrument(skip(self, cancel))]
    pub fn set_command_breakpoints(
        &self,
        requested: &[CommandBreakpoint],
        cancel: &CancellationToken,
    ) -> Result<Vec<Breakpoint>, DebugError> {
        let requested = requested.to_vec();
        self.with_engine(cancel, move |internals, cx| {
            Ok(internals.breakpoints.set_command_breakpoints(cx, &requested))
        })
    }

    pub fn remove_all_breakpoints(&self, cancel: &CancellationToken) -> Result<(), DebugError> {
        self.with_engine(cancel, |internals, cx| {
            internals.breakpoints.remove_all(cx);
            Ok(())
        })
    }

    /// Every breakpoint the session has registered
    pub fn breakpoints(&self) -> Result<Vec<Breakpoint>, DebugError> {
        self.with_internals(|internals| Ok(internals.breakpoints.breakpoints()))
    }

    pub fn continue_execution(&self) -> Result<(), DebugError> {
        self.resume("continue", ResumeAction::Continue)
    }

    pub fn step_over(&self) -> Result<(), DebugError> {
        self.resume("step over", ResumeAction::StepOver)
    }

    pub fn step_in(&self) -> Result<(), DebugError> {
        self.resume("step in", ResumeAction::StepIn)
    }

    pub fn step_out(&self) -> Result<(), DebugError> {
        self.resume("step out", ResumeAction::StepOut)
    }

    /// Ask the running script to halt at the next safe point
    #[tracing::instrument(skip(self))]
    pub fn break_execution(&self) -> Result<(), DebugError> {
        self.with_internals(|internals| {
            internals.ensure_live()?;
            if internals.run_state != RunState::Running || !internals.executing {
                return Err(DebugError::InvalidState {
                    operation: "break",
                    state: internals.run_state,
                });
            }
            self.executor.interrupt().request_break();
            Ok(())
        })
    }

    /// Request termination of the running script.
    ///
    /// Returns once the request is queued; the execution handle reports
    /// completion.
    #[tracing::instrument(skip(self))]
    pub fn abort(&self) -> Result<(), DebugError> {
        self.with_internals(|internals| {
            internals.ensure_live()?;
            match internals.run_state {
                RunState::Stopped => {
                    internals.leave_stop(RunState::Aborting);
                    self.executor.resume(ResumeAction::Abort)
                }
                RunState::Running if internals.executing => {
                    internals.set_state(RunState::Aborting);
                    self.executor.interrupt().request_abort();
                    Ok(())
                }
                state => Err(DebugError::InvalidState {
                    operation: "abort",
                    state,
                }),
            }
        })
    }

    /// Abort anything running and stop the engine thread
    #[tracing::instrument(skip(self))]
    pub fn disconnect(&self) -> Result<(), DebugError> {
        self.with_internals(|internals| {
            if internals.run_state == RunState::Stopped {
                if let Err(e) = self.executor.resume(ResumeAction::Abort) {
                    tracing::debug!(error = %e, "engine already gone while disconnecting");
                }
            } else if internals.executing {
                self.executor.interrupt().request_abort();
            }
            internals.terminate();
            Ok(())
        })?;
        // outside the lock: the engine thread takes it while finishing
        self.executor.shutdown();
        Ok(())
    }

    pub fn get_stack_frames(&self) -> Result<Vec<StackFrame>, DebugError> {
        self.with_internals(|internals| internals.stack_frames())
    }

    pub fn get_variable_scopes(&self, frame: usize) -> Result<Vec<VariableScope>, DebugError> {
        self.with_internals(|internals| internals.variable_scopes(frame))
    }

    /// Children of a scope or expandable variable
    #[tracing::instrument(skip(self, cancel))]
    pub fn get_variables(
        &self,
        handle: VariableHandle,
        cancel: &CancellationToken,
    ) -> Result<Vec<Variable>, DebugError> {
        if let Some(cached) = self.with_internals(|internals| internals.cached_variables(handle))? {
            return Ok(cached);
        }
        self.with_engine(cancel, move |internals, cx| internals.expand(cx, handle))
    }

    /// Assign `expression` to `name` in the scope identified by `handle`,
    /// returning the new display value
    #[tracing::instrument(skip(self, cancel))]
    pub fn set_variable(
        &self,
        handle: VariableHandle,
        name: &str,
        expression: &str,
        cancel: &CancellationToken,
    ) -> Result<String, DebugError> {
        self.with_internals(|internals| internals.ensure_stopped())?;
        let name = name.to_string();
        let expression = expression.to_string();
        self.with_engine(cancel, move |internals, cx| {
            internals.set_variable(cx, handle, &name, &expression)
        })
    }

    /// Evaluate an expression in the local scope of a stack frame
    #[tracing::instrument(skip(self, cancel))]
    pub fn evaluate(
        &self,
        expression: &str,
        frame: usize,
        cancel: &CancellationToken,
    ) -> Result<EvaluateResult, DebugError> {
        self.with_internals(|internals| internals.ensure_stopped())?;
        let expression = expression.to_string();
        self.with_engine(cancel, move |internals, cx| {
            internals.evaluate(cx, &expression, frame)
        })
    }

    fn resume(&self, operation: &'static str, action: ResumeAction) -> Result<(), DebugError> {
        self.with_internals(|internals| {
            internals.ensure_live()?;
            if internals.run_state != RunState::Stopped {
                return Err(DebugError::InvalidState {
                    operation,
                    state: internals.run_state,
                });
            }
            tracing::debug!(?action, "resuming execution");
            internals.leave_stop(RunState::Running);
            self.executor.resume(action)
        })
    }

    /// Run `f` on the engine thread with the internals locked
    fn with_engine<F, T>(&self, cancel: &CancellationToken, f: F) -> Result<T, DebugError>
    where
        F: FnOnce(&mut SessionInternals, &mut dyn EngineContext) -> Result<T, DebugError>
            + Send
            + 'static,
        T: Send + 'static,
    {
        self.with_internals(|internals| internals.ensure_live())?;
        if !self.executor.is_alive() {
            return Err(DebugError::EngineTerminated);
        }
        let internals = Arc::clone(&self.internals);
        self.executor.call(
            move |cx| {
                let mut internals = internals
                    .lock()
                    .map_err(|e| DebugError::Internal(format!("session mutex poisoned: {e}")))?;
                f(&mut internals, cx)
            },
            self.request_timeout,
            cancel,
        )
    }

    #[tracing::instrument(skip_all, fields(lock_id = Uuid::new_v4().to_string()))]
    fn with_internals<F, T>(&self, f: F) -> Result<T, DebugError>
    where
        F: FnOnce(&mut SessionInternals) -> Result<T, DebugError>,
    {
        tracing::trace!(poisoned = %self.internals.is_poisoned(), "trying to lock internals");
        let mut internals = self
            .internals
            .lock()
            .map_err(|e| DebugError::Internal(format!("session mutex poisoned: {e}")))?;
        tracing::trace!("executing operation");
        let res = f(&mut internals);
        drop(internals);
        tracing::trace!("unlocked internals");
        res
    }
}

impl Drop for DebugSession {
    fn drop(&mut self) {
        tracing::debug!("dropping debug session");
        if let Err(e) = self.disconnect() {
            tracing::warn!(error = %e, "failed to disconnect debug session during drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{io::IsTerminal, path::PathBuf};

    use tracing_subscriber::EnvFilter;

    use super::*;
    use crate::{
        engine::{Interrupt, LocalWorkspace, StopHandler},
        testing::{ScriptedEngine, fixtures},
        types::SourceBreakpoint,
    };

    const WAIT: Duration = Duration::from_secs(10);

    #[ctor::ctor]
    fn init() {
        let in_ci = std::env::var("CI")
            .map(|val| val == "true")
            .unwrap_or(false);

        if std::io::stderr().is_terminal() || in_ci {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::from_default_env())
                .try_init();
        } else {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::from_default_env())
                .json()
                .try_init();
        }

        // error traces
        let _ = color_eyre::install();
    }

    /// Halts once `go` fires, regardless of any pending abort, then finishes
    /// normally. Reports how the session told it to resume.
    struct LateStopEngine {
        inner: ScriptedEngine,
        go: crossbeam_channel::Receiver<()>,
        resumed: crossbeam_channel::Sender<ResumeAction>,
    }

    impl ScriptEngine for LateStopEngine {
        fn context(&mut self) -> &mut dyn EngineContext {
            self.inner.context()
        }

        fn interrupt_handle(&self) -> Arc<dyn Interrupt> {
            self.inner.interrupt_handle()
        }

        fn run(&mut self, _script: &ScriptSource, handler: &mut dyn StopHandler) -> RunOutcome {
            if self.go.recv_timeout(WAIT).is_err() {
                return RunOutcome::Failed("never released".to_string());
            }
            let stop = EngineStop {
                script_path: Some(script()),
                line: 3,
                column: 1,
                breakpoints: Vec::new(),
                remote: false,
            };
            let action = handler.on_stop(self.inner.context(), stop);
            let _ = self.resumed.send(action);
            RunOutcome::Completed
        }
    }

    fn script() -> PathBuf {
        PathBuf::from("/work/DebugTest.ps1")
    }

    fn session_with(config: &Config) -> DebugSession {
        let engine = ScriptedEngine::new()
            .with_script(script(), fixtures::loop_program(3))
            .with_script("/work/Endless.ps1", fixtures::endless_program());
        DebugSession::new(engine, Arc::new(LocalWorkspace), config).unwrap()
    }

    #[test]
    fn snapshot_is_ready_when_the_stop_is_delivered() {
        let session = session_with(&Config::default());
        let cancel = CancellationToken::new();
        session
            .set_line_breakpoints(script(), &[SourceBreakpoint::at(6)], &cancel)
            .unwrap();
        let _execution = session.execute(ScriptSource::file(script())).unwrap();

        let stop = session.wait_for_stop(WAIT, &cancel).unwrap();
        assert_eq!(session.run_state(), RunState::Stopped);
        let frames = session.get_stack_frames().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].line, stop.line);
        assert!(session.get_variables(frames[0].scopes.auto, &cancel).is_ok());
    }

    #[test]
    fn execution_wait_times_out_while_running() {
        let session = session_with(&Config::default());
        let cancel = CancellationToken::new();
        let execution = session
            .execute(ScriptSource::file("/work/Endless.ps1"))
            .unwrap();

        assert_eq!(
            execution.wait(Duration::from_millis(30), &cancel),
            Err(DebugError::Timeout)
        );
        session.abort().unwrap();
        assert_eq!(execution.wait(WAIT, &cancel), Ok(RunOutcome::Aborted));
        assert_eq!(session.run_state(), RunState::Terminated);

        // the outcome is kept after the engine thread has gone
        assert_eq!(
            execution.wait(Duration::from_millis(30), &cancel),
            Ok(RunOutcome::Aborted)
        );
    }

    #[test]
    fn configured_literals_are_used_for_display() {
        let mut config = Config::default();
        config.formatting.true_literal = "True".to_string();
        config.formatting.null_literal = "<null>".to_string();
        let session = session_with(&config);
        let cancel = CancellationToken::new();
        session
            .set_line_breakpoints(script(), &[SourceBreakpoint::at(6)], &cancel)
            .unwrap();
        let _execution = session.execute(ScriptSource::file(script())).unwrap();
        session.wait_for_stop(WAIT, &cancel).unwrap();

        assert_eq!(session.evaluate("$i -eq 1", 0, &cancel).unwrap().value, "True");
        assert_eq!(session.evaluate("$nothing", 0, &cancel).unwrap().value, "<null>");
    }

    #[test]
    fn events_follow_the_lifecycle() {
        let session = session_with(&Config::default());
        let events = session.events();
        let cancel = CancellationToken::new();
        session
            .set_line_breakpoints(script(), &[SourceBreakpoint::at(6)], &cancel)
            .unwrap();
        let execution = session.execute(ScriptSource::file(script())).unwrap();
        session.wait_for_stop(WAIT, &cancel).unwrap();
        session.remove_all_breakpoints(&cancel).unwrap();
        session.continue_execution().unwrap();
        execution.wait(WAIT, &cancel).unwrap();
        session.disconnect().unwrap();

        let seen: Vec<_> = events.try_iter().collect();
        assert!(matches!(seen[0], SessionEvent::Stopped(_)));
        assert_eq!(
            &seen[1..],
            &[
                SessionEvent::Running,
                SessionEvent::ExecutionCompleted(RunOutcome::Completed),
                SessionEvent::Terminated,
            ]
        );
    }

    #[test]
    fn stop_raised_after_abort_is_not_held() {
        let (go_tx, go) = crossbeam_channel::bounded(1);
        let (resumed, resumed_rx) = crossbeam_channel::bounded(1);
        let engine = LateStopEngine {
            inner: ScriptedEngine::new(),
            go,
            resumed,
        };
        let session = DebugSession::new(engine, Arc::new(LocalWorkspace), &Config::default()).unwrap();
        let events = session.events();
        let cancel = CancellationToken::new();

        let execution = session.execute(ScriptSource::file(script())).unwrap();
        session.abort().unwrap();
        assert_eq!(session.run_state(), RunState::Aborting);
        go_tx.send(()).unwrap();

        assert_eq!(resumed_rx.recv_timeout(WAIT).unwrap(), ResumeAction::Abort);
        assert_eq!(execution.wait(WAIT, &cancel), Ok(RunOutcome::Completed));
        assert_eq!(session.run_state(), RunState::Terminated);
        assert!(session.stops().is_empty());
        assert!(
            !events
                .try_iter()
                .any(|event| matches!(event, SessionEvent::Stopped(_)))
        );
    }
}
