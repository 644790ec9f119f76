//! The narrow contract the session uses to drive a script execution engine.
//!
//! The engine is owned by a single executor thread. Everything on
//! [`EngineContext`] is only ever called from that thread, so implementations
//! do not need to be thread safe beyond being [`Send`]. The one exception is
//! [`Interrupt`], which is handed out before the engine moves to its thread
//! and may be triggered from anywhere.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::Serialize;

/// Identifier the engine assigns to a registered breakpoint
pub type EngineBreakpointId = u32;

/// Opaque reference to an engine value whose children can be enumerated.
///
/// Only valid until the engine resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueRef(pub u64);

/// What the engine should execute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptSource {
    /// A script file on disk and the arguments it is invoked with
    File { path: PathBuf, args: Vec<String> },
    /// An ad-hoc command with no backing file
    Inline(String),
}

impl ScriptSource {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        ScriptSource::File {
            path: path.into(),
            args: Vec::new(),
        }
    }

    /// A script file invoked with arguments, one token per element
    pub fn file_with_args<S: Into<String>>(
        path: impl Into<PathBuf>,
        args: impl IntoIterator<Item = S>,
    ) -> Self {
        ScriptSource::File {
            path: path.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// How a script execution finished
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "outcome", content = "message")]
pub enum RunOutcome {
    Completed,
    Aborted,
    Failed(String),
}

/// How to continue after a stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeAction {
    Continue,
    StepOver,
    StepIn,
    StepOut,
    Abort,
}

/// Which breakpoints a clear or list operation applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakpointScope {
    /// Line breakpoints in one source file
    File(PathBuf),
    /// Command breakpoints, which are not tied to a file
    Commands,
}

/// Where a registered breakpoint lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakpointLocation {
    Line {
        path: PathBuf,
        line: u32,
        column: Option<u32>,
    },
    Command {
        name: String,
    },
}

/// A breakpoint as the engine holds it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineBreakpoint {
    pub id: EngineBreakpointId,
    pub location: BreakpointLocation,
    pub condition: Option<String>,
    pub hit_count: Option<u64>,
}

/// A variable scope the engine can enumerate and evaluate in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeRef {
    /// Variables local to a call stack frame (0 is the innermost frame)
    Local { frame: usize },
    /// Variables at the top level of the script that owns the frame
    Script { frame: usize },
    Global,
}

/// One frame of the paused call stack, innermost first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineFrame {
    pub function_name: String,
    /// `None` for frames running code with no backing file
    pub script_path: Option<PathBuf>,
    pub line: u32,
    pub column: u32,
}

/// The closed set of value shapes the formatter knows how to render
#[derive(Debug, Clone, PartialEq)]
pub enum EngineValue {
    Null,
    /// A typed null placeholder that must render distinctly from `Null`
    NullSentinel {
        type_tag: String,
    },
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Enum {
        type_name: String,
        name: String,
    },
    /// Ordered collection, children keyed by position
    Sequence {
        type_tag: String,
        len: usize,
        reference: ValueRef,
    },
    /// Key-value collection, children keyed by map key
    Mapping {
        type_tag: String,
        len: usize,
        reference: ValueRef,
    },
    /// Object with named public fields
    Record {
        type_name: String,
        fields: Vec<(String, EngineValue)>,
        reference: ValueRef,
    },
    /// Anything else: rendered through the engine's own display text
    Object {
        type_name: String,
        display: String,
        child_count: usize,
        reference: ValueRef,
    },
}

impl EngineValue {
    /// Name of the value's runtime type, if the engine reports one
    pub fn type_name(&self) -> Option<&str> {
        match self {
            EngineValue::Null => None,
            EngineValue::NullSentinel { type_tag } => Some(type_tag),
            EngineValue::Bool(_) => Some("bool"),
            EngineValue::Int(_) => Some("int"),
            EngineValue::Float(_) => Some("double"),
            EngineValue::String(_) => Some("string"),
            EngineValue::Enum { type_name, .. }
            | EngineValue::Record { type_name, .. }
            | EngineValue::Object { type_name, .. } => Some(type_name),
            EngineValue::Sequence { type_tag, .. } | EngineValue::Mapping { type_tag, .. } => {
                Some(type_tag)
            }
        }
    }

    /// Reference for enumerating children, for values that have one
    pub fn reference(&self) -> Option<ValueRef> {
        match self {
            EngineValue::Sequence { reference, .. }
            | EngineValue::Mapping { reference, .. }
            | EngineValue::Record { reference, .. }
            | EngineValue::Object { reference, .. } => Some(*reference),
            _ => None,
        }
    }
}

/// How a child relates to its parent value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildKey {
    Index(usize),
    Key(String),
    Field(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineChild {
    pub key: ChildKey,
    pub value: EngineValue,
}

/// A named variable in a scope
#[derive(Debug, Clone, PartialEq)]
pub struct EngineVariable {
    pub name: String,
    pub value: EngineValue,
    /// Declared type, for strongly typed variables
    pub type_constraint: Option<String>,
    /// Variables the engine defines itself, hidden from the auto scope
    pub automatic: bool,
}

/// Payload of an engine halt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStop {
    /// `None` when stopped in code with no backing file
    pub script_path: Option<PathBuf>,
    pub line: u32,
    pub column: u32,
    /// Breakpoints that triggered this stop, empty for breaks and steps
    pub breakpoints: Vec<EngineBreakpointId>,
    /// Set when the script runs in a remote session
    pub remote: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    /// The expression could not be parsed
    Parse,
    /// The expression parsed but failed at runtime
    Runtime,
    /// A value could not be converted to the requested type
    Conversion,
    NotFound,
}

/// Diagnostic reported by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn new(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for EngineError {}

/// Inspection and breakpoint surface of a live engine
pub trait EngineContext {
    fn set_line_breakpoint(
        &mut self,
        path: &Path,
        line: u32,
        column: Option<u32>,
        condition: Option<&str>,
        hit_count: Option<u64>,
    ) -> Result<EngineBreakpointId, EngineError>;

    fn set_command_breakpoint(
        &mut self,
        name: &str,
        condition: Option<&str>,
        hit_count: Option<u64>,
    ) -> Result<EngineBreakpointId, EngineError>;

    fn clear_breakpoints(&mut self, scope: &BreakpointScope);

    /// Registered breakpoints in the engine's own store order
    fn breakpoints(&self, scope: &BreakpointScope) -> Vec<EngineBreakpoint>;

    /// Current call stack, innermost frame first. Empty unless stopped.
    fn call_stack(&self) -> Vec<EngineFrame>;

    fn variables(&mut self, scope: ScopeRef) -> Result<Vec<EngineVariable>, EngineError>;

    fn lookup_variable(
        &mut self,
        scope: ScopeRef,
        name: &str,
    ) -> Result<Option<EngineVariable>, EngineError>;

    fn children(&mut self, value: ValueRef) -> Result<Vec<EngineChild>, EngineError>;

    fn evaluate(&mut self, scope: ScopeRef, expression: &str) -> Result<EngineValue, EngineError>;

    /// Convert a value to a declared type
    fn coerce(&mut self, value: EngineValue, type_name: &str) -> Result<EngineValue, EngineError>;

    fn assign(&mut self, scope: ScopeRef, name: &str, value: EngineValue)
    -> Result<(), EngineError>;
}

/// Cross-thread requests to a running engine
pub trait Interrupt: Send + Sync {
    /// Halt at the next safe point
    fn request_break(&self);

    /// Stop the running script; the run still completes normally afterwards
    fn request_abort(&self);
}

/// Callbacks the engine drives while running a script
pub trait StopHandler {
    /// The engine halted. Blocks until the caller decides how to continue.
    fn on_stop(&mut self, cx: &mut dyn EngineContext, stop: EngineStop) -> ResumeAction;

    /// Called between statements so queued work can run on the engine thread
    fn on_safe_point(&mut self, cx: &mut dyn EngineContext);
}

pub trait ScriptEngine: Send {
    fn context(&mut self) -> &mut dyn EngineContext;

    fn interrupt_handle(&self) -> Arc<dyn Interrupt>;

    fn run(&mut self, script: &ScriptSource, handler: &mut dyn StopHandler) -> RunOutcome;
}

/// Workspace collaborator used for remote-session debugging
pub trait Workspace: Send + Sync {
    /// Local copy of a remotely executing script, if one has been materialized
    fn resolve_local_shadow_path(&self, remote_path: &Path) -> Option<PathBuf>;
}

/// Workspace for sessions that never debug remote scripts
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalWorkspace;

impl Workspace for LocalWorkspace {
    fn resolve_local_shadow_path(&self, _remote_path: &Path) -> Option<PathBuf> {
        None
    }
}
