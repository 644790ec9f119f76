//! Mutable session state shared between client threads and the engine thread.
//!
//! The stop snapshot (frames and variable handles) is only rebuilt from
//! [`SessionInternals::on_stop`], which runs on the engine thread. Everything
//! else reads it.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::{
    breakpoints::BreakpointRegistry,
    channel::StopSender,
    engine::{
        EngineContext, EngineErrorKind, EngineStop, EngineValue, RunOutcome, ScopeRef, Workspace,
    },
    error::DebugError,
    formatter::ValueFormatter,
    handles::{ContainerKind, HandleTable, ScopeFilter, VariableContainer, VariableHandle},
    state::{RunState, SessionEvent},
    types::{
        AUTO_SCOPE_NAME, EvaluateResult, FrameScopes, GLOBAL_SCOPE_NAME, LOCAL_SCOPE_NAME,
        SCRIPT_SCOPE_NAME, StackFrame, StoppedEvent, Variable, VariableScope,
    },
    utils::client_script_path,
};

pub(crate) struct SessionInternals {
    pub(crate) run_state: RunState,
    /// A script execution is in flight
    pub(crate) executing: bool,
    pub(crate) breakpoints: BreakpointRegistry,

    frames: Vec<StackFrame>,
    handles: HandleTable,
    formatter: ValueFormatter,
    publisher: crossbeam_channel::Sender<SessionEvent>,
    stop_tx: Option<StopSender>,
    workspace: Arc<dyn Workspace>,
}

impl SessionInternals {
    pub(crate) fn new(
        formatter: ValueFormatter,
        publisher: crossbeam_channel::Sender<SessionEvent>,
        stop_tx: StopSender,
        workspace: Arc<dyn Workspace>,
    ) -> Self {
        Self {
            run_state: RunState::Running,
            executing: false,
            breakpoints: BreakpointRegistry::new(),
            frames: Vec::new(),
            handles: HandleTable::new(),
            formatter,
            publisher,
            stop_tx: Some(stop_tx),
            workspace,
        }
    }

    pub(crate) fn set_state(&mut self, state: RunState) {
        if self.run_state != state {
            tracing::debug!(from = ?self.run_state, to = ?state, "run state transition");
            self.run_state = state;
        }
    }

    pub(crate) fn publish(&self, event: SessionEvent) {
        // no subscribers is fine
        let _ = self.publisher.send(event);
    }

    /// Fail unless the engine is halted
    pub(crate) fn ensure_stopped(&self) -> Result<(), DebugError> {
        match self.run_state {
            RunState::Stopped => Ok(()),
            RunState::Terminated => Err(DebugError::Terminated),
            state => Err(DebugError::NotStopped { state }),
        }
    }

    pub(crate) fn ensure_live(&self) -> Result<(), DebugError> {
        match self.run_state {
            RunState::Terminated => Err(DebugError::Terminated),
            _ => Ok(()),
        }
    }

    /// Leave the current stop. The snapshot is discarded.
    pub(crate) fn leave_stop(&mut self, next: RunState) {
        self.frames.clear();
        self.set_state(next);
        self.publish(SessionEvent::Running);
    }

    /// Move to `Terminated` and close the stop channel. Idempotent.
    pub(crate) fn terminate(&mut self) {
        if self.run_state == RunState::Terminated {
            return;
        }
        self.frames.clear();
        self.handles.reset();
        self.set_state(RunState::Terminated);
        self.stop_tx = None;
        self.publish(SessionEvent::Terminated);
    }

    /// Record a stop and deliver it. Returns `false` when the session is
    /// aborting or terminated, in which case nothing is published and the
    /// engine should be told to abort.
    #[tracing::instrument(skip(self, cx))]
    pub(crate) fn on_stop(&mut self, cx: &mut dyn EngineContext, stop: EngineStop) -> bool {
        match self.run_state {
            RunState::Aborting | RunState::Terminated => {
                tracing::debug!(state = ?self.run_state, "not holding stop while shutting down");
                return false;
            }
            RunState::Running | RunState::Stopped => {}
        }

        let (script_path, remote_script_path) =
            client_script_path(self.workspace.as_ref(), stop.script_path.as_deref(), stop.remote);

        self.handles.reset();
        self.frames = match self.build_frames(cx, stop.remote) {
            Ok(frames) => frames,
            Err(e) => {
                tracing::warn!(error = %e, "could not build stack frames");
                Vec::new()
            }
        };

        let event = StoppedEvent {
            script_path,
            is_remote_session: stop.remote,
            remote_script_path,
            line: stop.line,
            column: stop.column,
            breakpoints: self.breakpoints.resolve_hits(&stop.breakpoints),
        };
        tracing::debug!(
            script_path = %event.script_path.display(),
            line = event.line,
            hits = event.breakpoints.len(),
            "debugger stopped"
        );

        self.set_state(RunState::Stopped);
        if let Some(stop_tx) = &self.stop_tx {
            if !stop_tx.push(event.clone()) {
                tracing::debug!("no stop event consumers left");
            }
        }
        self.publish(SessionEvent::Stopped(event));
        true
    }

    pub(crate) fn on_complete(&mut self, outcome: &RunOutcome) {
        self.executing = false;
        self.frames.clear();
        self.publish(SessionEvent::ExecutionCompleted(outcome.clone()));
        match (self.run_state, outcome) {
            (RunState::Terminated, _) => {}
            (RunState::Aborting, _) | (_, RunOutcome::Aborted) => self.terminate(),
            _ => self.set_state(RunState::Running),
        }
    }

    fn build_frames(
        &mut self,
        cx: &mut dyn EngineContext,
        remote: bool,
    ) -> Result<Vec<StackFrame>, DebugError> {
        let mut frames = Vec::new();
        for (index, frame) in cx.call_stack().into_iter().enumerate() {
            let (script_path, _) = client_script_path(
                self.workspace.as_ref(),
                frame.script_path.as_deref(),
                remote,
            );
            let local = ScopeRef::Local { frame: index };
            let scopes = FrameScopes {
                auto: self.handles.allocate(VariableContainer::scope(
                    AUTO_SCOPE_NAME,
                    local,
                    ScopeFilter::Auto,
                ))?,
                local: self.handles.allocate(VariableContainer::scope(
                    LOCAL_SCOPE_NAME,
                    local,
                    ScopeFilter::All,
                ))?,
                script: self.handles.allocate(VariableContainer::scope(
                    SCRIPT_SCOPE_NAME,
                    ScopeRef::Script { frame: index },
                    ScopeFilter::All,
                ))?,
                global: self.handles.allocate(VariableContainer::scope(
                    GLOBAL_SCOPE_NAME,
                    ScopeRef::Global,
                    ScopeFilter::All,
                ))?,
            };
            frames.push(StackFrame {
                index,
                function_name: frame.function_name,
                script_path,
                line: frame.line,
                column: frame.column,
                scopes,
            });
        }
        Ok(frames)
    }

    pub(crate) fn stack_frames(&self) -> Result<Vec<StackFrame>, DebugError> {
        self.ensure_stopped()?;
        Ok(self.frames.clone())
    }

    pub(crate) fn variable_scopes(&self, frame: usize) -> Result<Vec<VariableScope>, DebugError> {
        self.ensure_stopped()?;
        let scopes = self
            .frames
            .get(frame)
            .ok_or(DebugError::UnknownFrame { index: frame })?
            .scopes;
        Ok([
            (AUTO_SCOPE_NAME, scopes.auto),
            (LOCAL_SCOPE_NAME, scopes.local),
            (SCRIPT_SCOPE_NAME, scopes.script),
            (GLOBAL_SCOPE_NAME, scopes.global),
        ]
        .into_iter()
        .map(|(name, handle)| VariableScope {
            name: name.to_string(),
            handle,
        })
        .collect())
    }

    /// Children of a container if they have already been materialized
    pub(crate) fn cached_variables(
        &self,
        handle: VariableHandle,
    ) -> Result<Option<Vec<Variable>>, DebugError> {
        self.ensure_stopped()?;
        Ok(self.handles.resolve(handle)?.children.clone())
    }

    /// Materialize the children of a container. Engine thread only.
    pub(crate) fn expand(
        &mut self,
        cx: &mut dyn EngineContext,
        handle: VariableHandle,
    ) -> Result<Vec<Variable>, DebugError> {
        self.ensure_stopped()?;
        let container = self.handles.resolve(handle)?;
        if let Some(children) = &container.children {
            return Ok(children.clone());
        }
        let kind = container.kind.clone();
        let parent_scope = container.parent_scope;
        tracing::trace!(%handle, container = %container.name, "expanding container");

        let entries: Vec<(String, EngineValue, Option<String>)> = match kind {
            ContainerKind::Scope { scope, filter } => cx
                .variables(scope)?
                .into_iter()
                .filter(|v| filter == ScopeFilter::All || !v.automatic)
                .map(|v| (v.name, v.value, v.type_constraint))
                .collect(),
            ContainerKind::Value { value } => cx
                .children(value)?
                .into_iter()
                .map(|child| (self.formatter.child_name(&child.key), child.value, None))
                .collect(),
        };

        let mut variables = Vec::with_capacity(entries.len());
        for (name, value, declared_type) in entries {
            variables.push(self.make_variable(name, &value, declared_type, parent_scope)?);
        }
        tracing::trace!(%handle, count = variables.len(), "expanded container");
        self.handles.resolve_mut(handle)?.children = Some(variables.clone());
        Ok(variables)
    }

    /// Assign a new value to a variable in a scope container. Engine thread only.
    #[tracing::instrument(skip(self, cx))]
    pub(crate) fn set_variable(
        &mut self,
        cx: &mut dyn EngineContext,
        handle: VariableHandle,
        name: &str,
        expression: &str,
    ) -> Result<String, DebugError> {
        self.ensure_stopped()?;
        let scope = match self.handles.resolve(handle)?.kind {
            ContainerKind::Scope { scope, .. } => scope,
            ContainerKind::Value { .. } => return Err(DebugError::SetVariableUnsupported),
        };

        let existing = cx
            .lookup_variable(scope, name)?
            .ok_or_else(|| DebugError::VariableNotFound {
                name: name.to_string(),
            })?;
        let value = cx.evaluate(scope, expression)?;
        let value = match &existing.type_constraint {
            Some(type_name) => cx.coerce(value, type_name).map_err(|e| DebugError::Coercion {
                name: name.to_string(),
                type_name: type_name.clone(),
                message: e.message,
            })?,
            None => value,
        };
        cx.assign(scope, name, value).map_err(|e| match e.kind {
            EngineErrorKind::Conversion => DebugError::Coercion {
                name: name.to_string(),
                type_name: existing.type_constraint.clone().unwrap_or_default(),
                message: e.message,
            },
            _ => DebugError::Evaluation(e.message),
        })?;

        let updated = cx
            .lookup_variable(scope, name)?
            .ok_or_else(|| DebugError::VariableNotFound {
                name: name.to_string(),
            })?;
        // any cached child list may now be out of date
        self.handles.invalidate_children();
        let shown = self.formatter.format(&updated.value).display;
        tracing::debug!(value = %shown, "variable set");
        Ok(shown)
    }

    /// Evaluate an expression in a frame's local scope. Engine thread only.
    pub(crate) fn evaluate(
        &mut self,
        cx: &mut dyn EngineContext,
        expression: &str,
        frame: usize,
    ) -> Result<EvaluateResult, DebugError> {
        self.ensure_stopped()?;
        if frame >= self.frames.len() {
            return Err(DebugError::UnknownFrame { index: frame });
        }
        let scope = ScopeRef::Local { frame };
        let value = cx.evaluate(scope, expression)?;
        let variable = self.make_variable(expression.to_string(), &value, None, scope)?;
        Ok(EvaluateResult {
            value: variable.value,
            type_name: variable.type_name,
            is_expandable: variable.is_expandable,
            handle: variable.handle,
        })
    }

    fn make_variable(
        &mut self,
        name: String,
        value: &EngineValue,
        declared_type: Option<String>,
        parent_scope: ScopeRef,
    ) -> Result<Variable, DebugError> {
        let formatted = self.formatter.format(value);
        let handle = match (formatted.is_expandable, value.reference()) {
            (true, Some(reference)) => Some(self.handles.allocate(VariableContainer::value(
                name.clone(),
                reference,
                parent_scope,
            ))?),
            _ => None,
        };
        Ok(Variable {
            type_name: declared_type.or_else(|| value.type_name().map(str::to_string)),
            name,
            value: formatted.display,
            is_expandable: handle.is_some(),
            handle,
        })
    }
}

/// Lock the internals from the engine thread, where there is no caller to
/// report a poisoned lock to
pub(crate) fn lock_recovering(
    internals: &Mutex<SessionInternals>,
) -> MutexGuard<'_, SessionInternals> {
    internals.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("session internals poisoned, recovering");
        poisoned.into_inner()
    })
}
