//! The single thread that owns the script engine.
//!
//! Client threads never touch the engine directly: they queue [`Command`]s and
//! wait on oneshot replies. While a script is halted the thread sits in a
//! nested loop inside [`StopHandler::on_stop`], running queued jobs until a
//! resume command arrives.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::TryRecvError;
use eyre::WrapErr;
use tokio_util::sync::CancellationToken;

use crate::{
    commands::{Command, EngineJob, WorkerState},
    engine::{
        EngineContext, EngineStop, Interrupt, ResumeAction, RunOutcome, ScriptEngine,
        ScriptSource, StopHandler,
    },
    error::DebugError,
};

const POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Receives engine notifications on the engine thread
pub(crate) trait EngineObserver: Send + Sync {
    /// The engine halted. Runs before any queued job is serviced for this stop.
    ///
    /// Returning `false` rejects the stop and the engine is told to abort.
    fn on_stop(&self, cx: &mut dyn EngineContext, stop: EngineStop) -> bool;

    /// A script execution finished
    fn on_complete(&self, outcome: &RunOutcome);

    /// The engine thread is exiting
    fn on_exit(&self, panicked: bool);
}

pub(crate) struct Executor {
    command_tx: crossbeam_channel::Sender<Command>,
    interrupt: Arc<dyn Interrupt>,
    alive: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Executor {
    pub(crate) fn spawn(
        engine: Box<dyn ScriptEngine>,
        observer: Arc<dyn EngineObserver>,
    ) -> eyre::Result<Self> {
        let (command_tx, command_rx) = crossbeam_channel::unbounded();
        let interrupt = engine.interrupt_handle();
        let alive = Arc::new(AtomicBool::new(true));

        let worker_interrupt = Arc::clone(&interrupt);
        let worker_alive = Arc::clone(&alive);
        let worker = thread::Builder::new()
            .name("script-engine".to_string())
            .spawn(move || {
                let _guard = ExitGuard {
                    observer: Arc::clone(&observer),
                    alive: worker_alive,
                };
                worker_loop(engine, observer, command_rx, worker_interrupt);
            })
            .wrap_err("spawning script engine thread")?;

        Ok(Self {
            command_tx,
            interrupt,
            alive,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub(crate) fn interrupt(&self) -> &dyn Interrupt {
        self.interrupt.as_ref()
    }

    /// Run `f` on the engine thread and wait for its result.
    ///
    /// Gives up on cancellation or after `timeout`. A job abandoned before it
    /// started never runs; one already running completes on the engine
    /// thread and its result is discarded.
    pub(crate) fn call<T, F>(
        &self,
        f: F,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<T, DebugError>
    where
        F: FnOnce(&mut dyn EngineContext) -> Result<T, DebugError> + Send + 'static,
        T: Send + 'static,
    {
        if !self.is_alive() {
            return Err(DebugError::EngineTerminated);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let abandoned = cancel.child_token();
        let job_abandoned = abandoned.clone();
        let job: EngineJob = Box::new(move |cx| {
            if job_abandoned.is_cancelled() {
                tracing::debug!("skipping abandoned engine job");
                return;
            }
            let _ = reply_tx.send(f(cx));
        });
        self.command_tx
            .send(Command::Call(job))
            .map_err(|_| DebugError::EngineTerminated)?;

        let deadline = Instant::now() + timeout;
        loop {
            match reply_rx.recv_timeout(POLL_TIMEOUT) {
                Ok(result) => return result,
                Err(oneshot::RecvTimeoutError::Timeout) => {
                    if cancel.is_cancelled() {
                        return Err(DebugError::Cancelled);
                    }
                    if Instant::now() >= deadline {
                        abandoned.cancel();
                        tracing::warn!(?timeout, "engine job timed out");
                        return Err(DebugError::Timeout);
                    }
                }
                Err(oneshot::RecvTimeoutError::Disconnected) => {
                    return Err(if cancel.is_cancelled() {
                        DebugError::Cancelled
                    } else {
                        DebugError::EngineTerminated
                    });
                }
            }
        }
    }

    pub(crate) fn execute(
        &self,
        script: ScriptSource,
    ) -> Result<oneshot::Receiver<RunOutcome>, DebugError> {
        let (done, done_rx) = oneshot::channel();
        self.command_tx
            .send(Command::Execute { script, done })
            .map_err(|_| DebugError::EngineTerminated)?;
        Ok(done_rx)
    }

    pub(crate) fn resume(&self, action: ResumeAction) -> Result<(), DebugError> {
        self.command_tx
            .send(Command::Resume(action))
            .map_err(|_| DebugError::EngineTerminated)
    }

    /// Stop the engine thread and wait for it to exit
    pub(crate) fn shutdown(&self) {
        let worker = match self.worker.lock() {
            Ok(mut worker) => worker.take(),
            Err(e) => {
                tracing::warn!(error = %e, "executor mutex poisoned");
                None
            }
        };
        let Some(worker) = worker else {
            return;
        };

        let _ = self.command_tx.send(Command::Shutdown);
        if worker.thread().id() == thread::current().id() {
            tracing::warn!("not joining engine thread from itself");
            return;
        }
        if worker.join().is_err() {
            tracing::warn!("script engine thread panicked");
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        tracing::debug!("dropping executor");
        self.shutdown();
    }
}

struct ExitGuard {
    observer: Arc<dyn EngineObserver>,
    alive: Arc<AtomicBool>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let panicked = thread::panicking();
        self.alive.store(false, Ordering::SeqCst);
        if panicked {
            tracing::error!("script engine thread panicked");
        } else {
            tracing::debug!("script engine thread exiting");
        }
        self.observer.on_exit(panicked);
    }
}

fn worker_loop(
    mut engine: Box<dyn ScriptEngine>,
    observer: Arc<dyn EngineObserver>,
    command_rx: crossbeam_channel::Receiver<Command>,
    interrupt: Arc<dyn Interrupt>,
) {
    let mut state = WorkerState::Idle;
    while state != WorkerState::Shutdown {
        let command = match command_rx.recv() {
            Ok(command) => command,
            Err(_) => {
                tracing::debug!("command channel closed");
                break;
            }
        };
        tracing::trace!(?command, ?state, "received command");

        match command {
            Command::Call(job) => job(engine.context()),
            Command::Execute { script, done } => {
                tracing::debug!(?script, "executing script");
                let mut handler = WorkerStopHandler {
                    observer: observer.as_ref(),
                    command_rx: &command_rx,
                    interrupt: interrupt.as_ref(),
                    state: WorkerState::Executing,
                };
                let outcome = engine.run(&script, &mut handler);
                tracing::debug!(?outcome, "script execution finished");
                state = match handler.state {
                    WorkerState::Shutdown => WorkerState::Shutdown,
                    _ => WorkerState::Idle,
                };
                observer.on_complete(&outcome);
                let _ = done.send(outcome);
            }
            Command::Resume(action) => {
                tracing::warn!(?action, "resume requested while no script is executing");
            }
            Command::Shutdown => state = WorkerState::Shutdown,
        }
    }
}

struct WorkerStopHandler<'a> {
    observer: &'a dyn EngineObserver,
    command_rx: &'a crossbeam_channel::Receiver<Command>,
    interrupt: &'a dyn Interrupt,
    state: WorkerState,
}

impl WorkerStopHandler<'_> {
    fn begin_shutdown(&mut self) {
        self.state = WorkerState::Shutdown;
        self.interrupt.request_abort();
    }
}

impl StopHandler for WorkerStopHandler<'_> {
    fn on_stop(&mut self, cx: &mut dyn EngineContext, stop: EngineStop) -> ResumeAction {
        if self.state == WorkerState::Shutdown {
            return ResumeAction::Abort;
        }

        if !self.observer.on_stop(cx, stop) {
            tracing::debug!("stop rejected, aborting");
            return ResumeAction::Abort;
        }
        self.state = WorkerState::Stopped;
        loop {
            match self.command_rx.recv() {
                Ok(Command::Call(job)) => job(cx),
                Ok(Command::Resume(action)) => {
                    tracing::debug!(?action, "resuming");
                    self.state = WorkerState::Executing;
                    return action;
                }
                Ok(Command::Execute { script, .. }) => {
                    tracing::warn!(?script, "cannot execute a script while stopped");
                }
                Ok(Command::Shutdown) | Err(_) => {
                    tracing::debug!("shutting down while stopped");
                    self.begin_shutdown();
                    return ResumeAction::Abort;
                }
            }
        }
    }

    fn on_safe_point(&mut self, cx: &mut dyn EngineContext) {
        if self.state == WorkerState::Shutdown {
            return;
        }
        loop {
            match self.command_rx.try_recv() {
                Ok(Command::Call(job)) => job(cx),
                Ok(Command::Resume(action)) => {
                    tracing::warn!(?action, "resume requested while running");
                }
                Ok(Command::Execute { script, .. }) => {
                    tracing::warn!(?script, "cannot execute a script while another is running");
                }
                Ok(Command::Shutdown) | Err(TryRecvError::Disconnected) => {
                    tracing::debug!("shutting down while running");
                    self.begin_shutdown();
                    return;
                }
                Err(TryRecvError::Empty) => return,
            }
        }
    }
}
