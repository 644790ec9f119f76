//! Harness shared by the debug session integration tests
use std::{collections::VecDeque, io::IsTerminal, path::Path, sync::Arc, time::Duration};

use config::Config;
use debugger::{
    DebugSession, ExecutionHandle, SessionEvent, StackFrame, StoppedEvent, Variable,
    VariableHandle,
    engine::{LocalWorkspace, RunOutcome, ScriptSource, Workspace},
    testing::ScriptedEngine,
};
use eyre::WrapErr;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Install logging and error reporting for a test binary
pub fn init() {
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

/// Wraps a session and buffers lifecycle events that a test has not asked for yet
pub struct SessionTestHarness {
    session: DebugSession,
    event_rx: crossbeam_channel::Receiver<SessionEvent>,
    event_buffer: VecDeque<SessionEvent>,
    cancel: CancellationToken,
}

impl SessionTestHarness {
    pub fn new(engine: ScriptedEngine) -> eyre::Result<Self> {
        Self::with_workspace(engine, Arc::new(LocalWorkspace))
    }

    pub fn with_workspace(
        engine: ScriptedEngine,
        workspace: Arc<dyn Workspace>,
    ) -> eyre::Result<Self> {
        let session = DebugSession::new(engine, workspace, &Config::default())
            .wrap_err("creating debug session")?;
        let event_rx = session.events();
        Ok(Self {
            session,
            event_rx,
            event_buffer: VecDeque::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn session(&self) -> &DebugSession {
        &self.session
    }

    pub fn cancel(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn run(&self, path: impl AsRef<Path>) -> eyre::Result<ExecutionHandle> {
        self.session
            .execute(ScriptSource::file(path.as_ref().to_path_buf()))
            .wrap_err("starting script")
    }

    pub fn run_with_args(
        &self,
        path: impl AsRef<Path>,
        args: &[&str],
    ) -> eyre::Result<ExecutionHandle> {
        self.session
            .execute(ScriptSource::file_with_args(
                path.as_ref(),
                args.iter().copied(),
            ))
            .wrap_err("starting script with arguments")
    }

    pub fn finish(&self, execution: &ExecutionHandle) -> eyre::Result<RunOutcome> {
        execution
            .wait(EVENT_TIMEOUT, &self.cancel)
            .wrap_err("waiting for script to finish")
    }

    pub fn wait_for_stop(&self) -> eyre::Result<StoppedEvent> {
        self.session
            .wait_for_stop(EVENT_TIMEOUT, &self.cancel)
            .wrap_err("waiting for stop event")
    }

    pub fn top_frame(&self) -> eyre::Result<StackFrame> {
        self.session
            .get_stack_frames()
            .wrap_err("fetching stack frames")?
            .into_iter()
            .next()
            .ok_or_else(|| eyre::eyre!("no stack frames while stopped"))
    }

    pub fn variables(&self, handle: VariableHandle) -> eyre::Result<Vec<Variable>> {
        self.session
            .get_variables(handle, &self.cancel)
            .wrap_err_with(|| format!("fetching variables of {handle}"))
    }

    pub fn variable(&self, handle: VariableHandle, name: &str) -> eyre::Result<Variable> {
        self.variables(handle)?
            .into_iter()
            .find(|v| v.name == name)
            .ok_or_else(|| eyre::eyre!("variable {name} not found"))
    }

    /// Wait for an event matching the predicate, buffering non-matching events
    #[tracing::instrument(skip(self, pred))]
    pub fn wait_for_event<F>(&mut self, message: &str, pred: F) -> SessionEvent
    where
        F: Fn(&SessionEvent) -> bool,
    {
        tracing::debug!("waiting for {message} event");
        let mut n = 0;

        loop {
            if let Some(pos) = self.event_buffer.iter().position(&pred) {
                if let Some(evt) = self.event_buffer.remove(pos) {
                    tracing::debug!(event = ?evt, "received expected event from buffer");
                    return evt;
                }
            }

            let evt = match self.event_rx.recv_timeout(EVENT_TIMEOUT) {
                Ok(evt) => evt,
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    panic!("timeout waiting for {message} event");
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    panic!("channel disconnected while waiting for {message} event");
                }
            };

            if n >= 1000 {
                panic!("did not receive {message} event after 1000 events");
            }

            if pred(&evt) {
                tracing::debug!(event = ?evt, "received expected event");
                return evt;
            }
            tracing::trace!(event = ?evt, "non-matching event, buffering for later");
            self.event_buffer.push_back(evt);
            n += 1;
        }
    }
}
