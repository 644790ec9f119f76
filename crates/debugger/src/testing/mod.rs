//! Testing utilities for the debug session.
//!
//! [`ScriptedEngine`] is a deterministic stand-in for a real script engine.
//! Programs are built from [`Stmt`]s rather than parsed from source, but
//! breakpoints, conditions, hit counts, stepping, scopes and typed variables
//! behave the way a session expects from a real engine.

mod expression;

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use crate::engine::{
    BreakpointLocation, BreakpointScope, ChildKey, EngineBreakpoint, EngineBreakpointId,
    EngineChild, EngineContext, EngineError, EngineErrorKind, EngineFrame, EngineStop,
    EngineValue, EngineVariable, Interrupt, ResumeAction, RunOutcome, ScopeRef, ScriptEngine,
    ScriptSource, StopHandler, ValueRef, Workspace,
};

use expression::{Env, Expr};

/// Command that makes the engine halt at the next statement
pub const WAIT_DEBUGGER_COMMAND: &str = "Wait-Debugger";

/// Command that panics the engine thread
pub const PANIC_COMMAND: &str = "Invoke-EnginePanic";

const TOP_LEVEL_FUNCTION: &str = "<ScriptBlock>";

/// A runtime value inside the scripted engine
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    NullString,
    Bool(bool),
    Int(i64),
    Str(String),
    Enum {
        type_name: String,
        name: String,
    },
    Array(Vec<Value>),
    Hashtable(Vec<(String, Value)>),
    Object {
        type_name: String,
        fields: Vec<(String, Value)>,
    },
    /// Displayed through its own text, children listed by name
    Opaque {
        type_name: String,
        display: String,
        children: Vec<(String, Value)>,
    },
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    pub fn hashtable<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Hashtable(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn object<K: Into<String>>(
        type_name: impl Into<String>,
        fields: impl IntoIterator<Item = (K, Value)>,
    ) -> Self {
        Value::Object {
            type_name: type_name.into(),
            fields: fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// A switch parameter, present or not
    pub fn switch(present: bool) -> Self {
        Value::Opaque {
            type_name: "SwitchParameter".to_string(),
            display: if present { "True" } else { "False" }.to_string(),
            children: vec![("IsPresent".to_string(), Value::Bool(present))],
        }
    }

    pub fn enumeration(type_name: impl Into<String>, name: impl Into<String>) -> Self {
        Value::Enum {
            type_name: type_name.into(),
            name: name.into(),
        }
    }
}

/// One statement of a scripted program
#[derive(Debug, Clone)]
pub enum Stmt {
    /// `$name = expr`
    Assign {
        line: u32,
        name: String,
        expr: String,
    },
    /// `[type]$name = expr`
    Declare {
        line: u32,
        name: String,
        type_name: String,
        expr: String,
    },
    /// `$name = <value>` for values the expression language cannot spell
    SetValue { line: u32, name: String, value: Value },
    /// Invoke a command by name
    Command { line: u32, name: String },
    /// `for ($var = from; $var -le to; $var++) { body }`
    For {
        line: u32,
        var: String,
        from: i64,
        to: i64,
        body: Vec<Stmt>,
    },
    /// `while ($true) { body }`
    Loop { line: u32, body: Vec<Stmt> },
    /// Call a function defined in the program, binding `args` as locals
    Call {
        line: u32,
        function: String,
        args: Vec<(String, String)>,
    },
}

impl Stmt {
    pub fn assign(line: u32, name: impl Into<String>, expr: impl Into<String>) -> Self {
        Stmt::Assign {
            line,
            name: name.into(),
            expr: expr.into(),
        }
    }

    pub fn declare(
        line: u32,
        name: impl Into<String>,
        type_name: impl Into<String>,
        expr: impl Into<String>,
    ) -> Self {
        Stmt::Declare {
            line,
            name: name.into(),
            type_name: type_name.into(),
            expr: expr.into(),
        }
    }

    pub fn value(line: u32, name: impl Into<String>, value: Value) -> Self {
        Stmt::SetValue {
            line,
            name: name.into(),
            value,
        }
    }

    pub fn command(line: u32, name: impl Into<String>) -> Self {
        Stmt::Command {
            line,
            name: name.into(),
        }
    }

    pub fn for_range(line: u32, var: impl Into<String>, from: i64, to: i64, body: Vec<Stmt>) -> Self {
        Stmt::For {
            line,
            var: var.into(),
            from,
            to,
            body,
        }
    }

    pub fn repeat(line: u32, body: Vec<Stmt>) -> Self {
        Stmt::Loop { line, body }
    }

    pub fn call<N: Into<String>, E: Into<String>>(
        line: u32,
        function: impl Into<String>,
        args: impl IntoIterator<Item = (N, E)>,
    ) -> Self {
        Stmt::Call {
            line,
            function: function.into(),
            args: args
                .into_iter()
                .map(|(n, e)| (n.into(), e.into()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
struct Param {
    name: String,
    switch: bool,
}

/// A script: declared parameters, top-level statements and named functions
#[derive(Debug, Clone, Default)]
pub struct Program {
    params: Vec<Param>,
    body: Vec<Stmt>,
    functions: HashMap<String, Vec<Stmt>>,
}

impl Program {
    pub fn new(body: Vec<Stmt>) -> Self {
        Self {
            params: Vec::new(),
            body,
            functions: HashMap::new(),
        }
    }

    pub fn with_function(mut self, name: impl Into<String>, body: Vec<Stmt>) -> Self {
        self.functions.insert(name.into(), body);
        self
    }

    /// Declare a script parameter, bound by name or position
    pub fn with_param(mut self, name: impl Into<String>) -> Self {
        self.params.push(Param {
            name: name.into(),
            switch: false,
        });
        self
    }

    /// Declare a switch parameter, only bound by name
    pub fn with_switch(mut self, name: impl Into<String>) -> Self {
        self.params.push(Param {
            name: name.into(),
            switch: true,
        });
        self
    }
}

#[derive(Debug, Default)]
struct Flags {
    break_requested: AtomicBool,
    abort_requested: AtomicBool,
}

impl Interrupt for Flags {
    fn request_break(&self) {
        self.break_requested.store(true, Ordering::SeqCst);
    }

    fn request_abort(&self) {
        self.abort_requested.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
struct Var {
    name: String,
    value: Value,
    type_constraint: Option<String>,
    automatic: bool,
}

impl Var {
    fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            type_constraint: None,
            automatic: false,
        }
    }

    fn automatic(name: impl Into<String>, value: Value) -> Self {
        Self {
            automatic: true,
            ..Self::new(name, value)
        }
    }
}

#[derive(Debug)]
struct Frame {
    function_name: String,
    path: Option<PathBuf>,
    line: u32,
    /// `None` for the top-level frame, whose locals are the script scope
    locals: Option<Vec<Var>>,
}

#[derive(Debug)]
struct BreakpointEntry {
    id: EngineBreakpointId,
    location: BreakpointLocation,
    condition: Option<(String, Expr)>,
    hit_count: Option<u64>,
    hits: u64,
}

impl BreakpointEntry {
    fn in_scope(&self, scope: &BreakpointScope) -> bool {
        match (&self.location, scope) {
            (BreakpointLocation::Line { path, .. }, BreakpointScope::File(file)) => path == file,
            (BreakpointLocation::Command { .. }, BreakpointScope::Commands) => true,
            _ => false,
        }
    }

    fn to_engine(&self) -> EngineBreakpoint {
        EngineBreakpoint {
            id: self.id,
            location: self.location.clone(),
            condition: self.condition.as_ref().map(|(text, _)| text.clone()),
            hit_count: self.hit_count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    None,
    Into,
    Over(usize),
    Out(usize),
}

/// Variables, call stack and breakpoints of the scripted engine
#[derive(Debug, Default)]
pub struct EngineState {
    globals: Vec<Var>,
    script_vars: Vec<Var>,
    /// Outermost first
    frames: Vec<Frame>,
    breakpoints: Vec<BreakpointEntry>,
    next_breakpoint_id: EngineBreakpointId,
    /// Values handed out by reference during the current stop
    arena: Vec<Value>,
    enums: HashMap<String, Vec<String>>,
}

fn not_found(message: impl Into<String>) -> EngineError {
    EngineError::new(EngineErrorKind::NotFound, message)
}

/// Strip a `$script:` or `$global:` qualifier
fn split_qualifier(name: &str) -> (Option<&str>, String) {
    let bare = name.trim_start_matches('$');
    match bare.split_once(':') {
        Some((qualifier, rest)) => (Some(qualifier), format!("${rest}")),
        None => (None, name.to_string()),
    }
}

fn find<'a>(vars: &'a [Var], name: &str) -> Option<&'a Var> {
    vars.iter().find(|v| v.name.eq_ignore_ascii_case(name))
}

impl EngineState {
    fn frame_slot(&self, frame: usize) -> Result<usize, EngineError> {
        self.frames
            .len()
            .checked_sub(frame + 1)
            .ok_or_else(|| not_found(format!("No stack frame at index {frame}.")))
    }

    fn scope_vars(&self, scope: ScopeRef) -> Result<&Vec<Var>, EngineError> {
        match scope {
            ScopeRef::Local { frame } => {
                let slot = self.frame_slot(frame)?;
                Ok(self.frames[slot].locals.as_ref().unwrap_or(&self.script_vars))
            }
            ScopeRef::Script { frame } => {
                self.frame_slot(frame)?;
                Ok(&self.script_vars)
            }
            ScopeRef::Global => Ok(&self.globals),
        }
    }

    fn scope_vars_mut(&mut self, scope: ScopeRef) -> Result<&mut Vec<Var>, EngineError> {
        match scope {
            ScopeRef::Local { frame } => {
                let slot = self.frame_slot(frame)?;
                if self.frames[slot].locals.is_some() {
                    self.frames[slot]
                        .locals
                        .as_mut()
                        .ok_or_else(|| not_found("Frame has no locals."))
                } else {
                    Ok(&mut self.script_vars)
                }
            }
            ScopeRef::Script { frame } => {
                self.frame_slot(frame)?;
                Ok(&mut self.script_vars)
            }
            ScopeRef::Global => Ok(&mut self.globals),
        }
    }

    /// Resolve a variable the way an expression sees it: innermost scope first
    fn lookup_chain(&self, scope: ScopeRef, name: &str) -> Option<Value> {
        let (qualifier, bare) = split_qualifier(name);
        let chain: Vec<&Vec<Var>> = match (qualifier, scope) {
            (Some(q), _) if q.eq_ignore_ascii_case("global") => vec![&self.globals],
            (Some(q), _) if q.eq_ignore_ascii_case("script") => {
                vec![&self.script_vars, &self.globals]
            }
            (_, ScopeRef::Global) => vec![&self.globals],
            (_, ScopeRef::Script { .. }) => vec![&self.script_vars, &self.globals],
            (_, ScopeRef::Local { .. }) => {
                let mut chain = Vec::with_capacity(3);
                if let Ok(locals) = self.scope_vars(scope) {
                    chain.push(locals);
                }
                chain.push(&self.script_vars);
                chain.push(&self.globals);
                chain
            }
        };
        chain
            .into_iter()
            .find_map(|vars| find(vars, &bare))
            .map(|v| v.value.clone())
    }

    fn keep(&mut self, value: &Value) -> ValueRef {
        self.arena.push(value.clone());
        ValueRef((self.arena.len() - 1) as u64)
    }

    fn describe(&mut self, value: &Value) -> EngineValue {
        match value {
            Value::Null => EngineValue::Null,
            Value::NullString => EngineValue::NullSentinel {
                type_tag: "NullString".to_string(),
            },
            Value::Bool(b) => EngineValue::Bool(*b),
            Value::Int(i) => EngineValue::Int(*i),
            Value::Str(s) => EngineValue::String(s.clone()),
            Value::Enum { type_name, name } => EngineValue::Enum {
                type_name: type_name.clone(),
                name: name.clone(),
            },
            Value::Array(items) => EngineValue::Sequence {
                type_tag: "Object[]".to_string(),
                len: items.len(),
                reference: self.keep(value),
            },
            Value::Hashtable(entries) => EngineValue::Mapping {
                type_tag: "Hashtable".to_string(),
                len: entries.len(),
                reference: self.keep(value),
            },
            Value::Object { type_name, fields } => {
                let reference = self.keep(value);
                let fields = fields
                    .iter()
                    .map(|(name, field)| (name.clone(), self.describe(field)))
                    .collect();
                EngineValue::Record {
                    type_name: type_name.clone(),
                    fields,
                    reference,
                }
            }
            Value::Opaque {
                type_name,
                display,
                children,
            } => EngineValue::Object {
                type_name: type_name.clone(),
                display: display.clone(),
                child_count: children.len(),
                reference: self.keep(value),
            },
        }
    }

    fn resolve(&self, value: EngineValue) -> Result<Value, EngineError> {
        Ok(match value {
            EngineValue::Null => Value::Null,
            EngineValue::NullSentinel { .. } => Value::NullString,
            EngineValue::Bool(b) => Value::Bool(b),
            EngineValue::Int(i) => Value::Int(i),
            EngineValue::Float(f) => Value::Int(f as i64),
            EngineValue::String(s) => Value::Str(s),
            EngineValue::Enum { type_name, name } => Value::Enum { type_name, name },
            EngineValue::Sequence { reference, .. }
            | EngineValue::Mapping { reference, .. }
            | EngineValue::Record { reference, .. }
            | EngineValue::Object { reference, .. } => self
                .arena
                .get(reference.0 as usize)
                .cloned()
                .ok_or_else(|| not_found("Value reference is no longer valid."))?,
        })
    }

    fn env(&self, scope: ScopeRef) -> ScopeEnv<'_> {
        ScopeEnv { state: self, scope }
    }

    fn evaluate_value(&self, scope: ScopeRef, source: &str) -> Result<Value, EngineError> {
        let expr = expression::parse(source)?;
        expression::evaluate(&expr, &self.env(scope))
    }

    /// Bind invocation arguments to declared parameters. Whatever binds to
    /// no parameter ends up in `$args`.
    fn bind_arguments(&self, params: &[Param], args: &[String]) -> Vec<Var> {
        let mut bound: Vec<Option<Value>> = vec![None; params.len()];
        let mut extra = Vec::new();
        let mut tokens = args.iter();
        while let Some(token) = tokens.next() {
            let named = token.strip_prefix('-').and_then(|flag| {
                params
                    .iter()
                    .position(|p| p.name.trim_start_matches('$').eq_ignore_ascii_case(flag))
            });
            match named {
                Some(i) if params[i].switch => bound[i] = Some(Value::switch(true)),
                Some(i) => {
                    bound[i] = Some(
                        tokens
                            .next()
                            .map(|value| self.argument_value(value))
                            .unwrap_or(Value::Null),
                    );
                }
                None => {
                    let value = self.argument_value(token);
                    match (0..params.len()).find(|&i| !params[i].switch && bound[i].is_none()) {
                        Some(i) => bound[i] = Some(value),
                        None => extra.push(value),
                    }
                }
            }
        }

        let mut vars: Vec<Var> = params
            .iter()
            .zip(bound)
            .map(|(param, value)| {
                let value = value.unwrap_or_else(|| match param.switch {
                    true => Value::switch(false),
                    false => Value::Null,
                });
                Var::new(param.name.clone(), value)
            })
            .collect();
        vars.push(Var::automatic("$args", Value::Array(extra)));
        vars
    }

    /// Arguments that are not valid expressions are bare words
    fn argument_value(&self, token: &str) -> Value {
        self.evaluate_value(ScopeRef::Global, token)
            .unwrap_or_else(|_| Value::str(token))
    }

    /// Store a value, converting it when the variable is declared with a type
    fn store(
        &mut self,
        scope: ScopeRef,
        name: &str,
        value: Value,
        declare: Option<&str>,
    ) -> Result<(), EngineError> {
        let type_constraint = match declare {
            Some(t) => Some(t.to_string()),
            None => find(self.scope_vars(scope)?, name).and_then(|v| v.type_constraint.clone()),
        };
        let value = match &type_constraint {
            Some(t) => expression::coerce(value, t, &self.env(scope))?,
            None => value,
        };

        let vars = self.scope_vars_mut(scope)?;
        match vars.iter_mut().find(|v| v.name.eq_ignore_ascii_case(name)) {
            Some(var) => {
                var.value = value;
                var.type_constraint = type_constraint;
            }
            None => vars.push(Var {
                type_constraint,
                ..Var::new(name, value)
            }),
        }
        Ok(())
    }

    /// Breakpoints that fire at this location, counting hits as it goes
    fn triggered_breakpoints(
        &mut self,
        path: Option<&Path>,
        line: u32,
        command: Option<&str>,
    ) -> Vec<EngineBreakpointId> {
        let candidates: Vec<usize> = self
            .breakpoints
            .iter()
            .enumerate()
            .filter(|(_, bp)| match &bp.location {
                BreakpointLocation::Line { path: p, line: l, .. } => {
                    Some(p.as_path()) == path && *l == line
                }
                BreakpointLocation::Command { name } => {
                    command.is_some_and(|c| c.eq_ignore_ascii_case(name))
                }
            })
            .map(|(i, _)| i)
            .collect();

        let mut hits = Vec::new();
        for i in candidates {
            let passes = match &self.breakpoints[i].condition {
                Some((text, expr)) => {
                    match expression::evaluate(expr, &self.env(ScopeRef::Local { frame: 0 })) {
                        Ok(value) => expression::truthy(&value),
                        Err(e) => {
                            tracing::debug!(condition = %text, error = %e, "breakpoint condition failed");
                            false
                        }
                    }
                }
                None => true,
            };
            if !passes {
                continue;
            }
            let bp = &mut self.breakpoints[i];
            bp.hits += 1;
            if bp.hit_count.is_some_and(|n| bp.hits != n) {
                continue;
            }
            hits.push(bp.id);
        }
        hits
    }

    fn add_breakpoint(
        &mut self,
        location: BreakpointLocation,
        condition: Option<&str>,
        hit_count: Option<u64>,
    ) -> Result<EngineBreakpointId, EngineError> {
        let condition = condition
            .map(|text| expression::parse(text).map(|expr| (text.to_string(), expr)))
            .transpose()?;
        self.next_breakpoint_id += 1;
        let id = self.next_breakpoint_id;
        self.breakpoints.push(BreakpointEntry {
            id,
            location,
            condition,
            hit_count,
            hits: 0,
        });
        Ok(id)
    }
}

struct ScopeEnv<'a> {
    state: &'a EngineState,
    scope: ScopeRef,
}

impl Env for ScopeEnv<'_> {
    fn variable(&self, name: &str) -> Option<Value> {
        self.state.lookup_chain(self.scope, name)
    }

    fn enum_names(&self, type_name: &str) -> Option<&[String]> {
        self.state.enums.get(type_name).map(Vec::as_slice)
    }
}

impl EngineContext for EngineState {
    fn set_line_breakpoint(
        &mut self,
        path: &Path,
        line: u32,
        column: Option<u32>,
        condition: Option<&str>,
        hit_count: Option<u64>,
    ) -> Result<EngineBreakpointId, EngineError> {
        self.add_breakpoint(
            BreakpointLocation::Line {
                path: path.to_path_buf(),
                line,
                column,
            },
            condition,
            hit_count,
        )
    }

    fn set_command_breakpoint(
        &mut self,
        name: &str,
        condition: Option<&str>,
        hit_count: Option<u64>,
    ) -> Result<EngineBreakpointId, EngineError> {
        self.add_breakpoint(
            BreakpointLocation::Command {
                name: name.to_string(),
            },
            condition,
            hit_count,
        )
    }

    fn clear_breakpoints(&mut self, scope: &BreakpointScope) {
        self.breakpoints.retain(|bp| !bp.in_scope(scope));
    }

    fn breakpoints(&self, scope: &BreakpointScope) -> Vec<EngineBreakpoint> {
        let mut listed: Vec<&BreakpointEntry> =
            self.breakpoints.iter().filter(|bp| bp.in_scope(scope)).collect();
        // line breakpoints are kept sorted by position, not by request
        listed.sort_by_key(|bp| match &bp.location {
            BreakpointLocation::Line { line, column, .. } => (*line, column.unwrap_or(0), bp.id),
            BreakpointLocation::Command { .. } => (0, 0, bp.id),
        });
        listed.into_iter().map(BreakpointEntry::to_engine).collect()
    }

    fn call_stack(&self) -> Vec<EngineFrame> {
        self.frames
            .iter()
            .rev()
            .map(|frame| EngineFrame {
                function_name: frame.function_name.clone(),
                script_path: frame.path.clone(),
                line: frame.line,
                column: 1,
            })
            .collect()
    }

    fn variables(&mut self, scope: ScopeRef) -> Result<Vec<EngineVariable>, EngineError> {
        let vars = self.scope_vars(scope)?.clone();
        Ok(vars
            .into_iter()
            .map(|var| EngineVariable {
                value: self.describe(&var.value),
                name: var.name,
                type_constraint: var.type_constraint,
                automatic: var.automatic,
            })
            .collect())
    }

    fn lookup_variable(
        &mut self,
        scope: ScopeRef,
        name: &str,
    ) -> Result<Option<EngineVariable>, EngineError> {
        let Some(var) = find(self.scope_vars(scope)?, name).cloned() else {
            return Ok(None);
        };
        Ok(Some(EngineVariable {
            value: self.describe(&var.value),
            name: var.name,
            type_constraint: var.type_constraint,
            automatic: var.automatic,
        }))
    }

    fn children(&mut self, value: ValueRef) -> Result<Vec<EngineChild>, EngineError> {
        let parent = self
            .arena
            .get(value.0 as usize)
            .cloned()
            .ok_or_else(|| not_found("Value reference is no longer valid."))?;
        let children: Vec<(ChildKey, Value)> = match parent {
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, v)| (ChildKey::Index(i), v))
                .collect(),
            Value::Hashtable(entries) => entries
                .into_iter()
                .map(|(k, v)| (ChildKey::Key(k), v))
                .collect(),
            Value::Object { fields, .. } => fields
                .into_iter()
                .map(|(k, v)| (ChildKey::Field(k), v))
                .collect(),
            Value::Opaque { children, .. } => children
                .into_iter()
                .map(|(k, v)| (ChildKey::Field(k), v))
                .collect(),
            _ => Vec::new(),
        };
        Ok(children
            .into_iter()
            .map(|(key, v)| EngineChild {
                key,
                value: self.describe(&v),
            })
            .collect())
    }

    fn evaluate(&mut self, scope: ScopeRef, expression: &str) -> Result<EngineValue, EngineError> {
        let value = self.evaluate_value(scope, expression)?;
        Ok(self.describe(&value))
    }

    fn coerce(&mut self, value: EngineValue, type_name: &str) -> Result<EngineValue, EngineError> {
        let value = self.resolve(value)?;
        let coerced = expression::coerce(value, type_name, &self.env(ScopeRef::Global))?;
        Ok(self.describe(&coerced))
    }

    fn assign(
        &mut self,
        scope: ScopeRef,
        name: &str,
        value: EngineValue,
    ) -> Result<(), EngineError> {
        let value = self.resolve(value)?;
        self.store(scope, name, value, None)
    }
}

enum Unwind {
    Abort,
    Fail(String),
}

impl From<EngineError> for Unwind {
    fn from(value: EngineError) -> Self {
        Unwind::Fail(value.message)
    }
}

/// One script execution in progress
struct Run<'a> {
    state: &'a mut EngineState,
    handler: &'a mut dyn StopHandler,
    flags: &'a Flags,
    program: Arc<Program>,
    path: Option<PathBuf>,
    remote: bool,
    step: Step,
}

impl Run<'_> {
    fn current_scope(&self) -> ScopeRef {
        ScopeRef::Local { frame: 0 }
    }

    fn block(&mut self, stmts: &[Stmt]) -> Result<(), Unwind> {
        stmts.iter().try_for_each(|stmt| self.stmt(stmt))
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<(), Unwind> {
        let scope = self.current_scope();
        match stmt {
            Stmt::Assign { line, name, expr } => {
                self.checkpoint(*line, None)?;
                let value = self.state.evaluate_value(scope, expr)?;
                self.state.store(scope, name, value, None)?;
            }
            Stmt::Declare {
                line,
                name,
                type_name,
                expr,
            } => {
                self.checkpoint(*line, None)?;
                let value = self.state.evaluate_value(scope, expr)?;
                self.state.store(scope, name, value, Some(type_name.as_str()))?;
            }
            Stmt::SetValue { line, name, value } => {
                self.checkpoint(*line, None)?;
                self.state.store(scope, name, value.clone(), None)?;
            }
            Stmt::Command { line, name } => {
                self.checkpoint(*line, Some(name))?;
                if name.eq_ignore_ascii_case(WAIT_DEBUGGER_COMMAND) {
                    self.flags.request_break();
                } else if name.eq_ignore_ascii_case(PANIC_COMMAND) {
                    panic!("script engine crashed");
                }
            }
            Stmt::For {
                line,
                var,
                from,
                to,
                body,
            } => {
                for i in *from..=*to {
                    self.checkpoint(*line, None)?;
                    self.state.store(scope, var, Value::Int(i), None)?;
                    self.block(body)?;
                }
            }
            Stmt::Loop { line, body } => loop {
                self.checkpoint(*line, None)?;
                self.block(body)?;
                thread::sleep(Duration::from_millis(1));
            },
            Stmt::Call {
                line,
                function,
                args,
            } => {
                self.checkpoint(*line, None)?;
                let program = Arc::clone(&self.program);
                let body = program.functions.get(function).ok_or_else(|| {
                    Unwind::Fail(format!(
                        "The term '{function}' is not recognized as a name of a cmdlet, function, script file, or executable program."
                    ))
                })?;
                let mut locals = vec![Var::automatic("$args", Value::Array(Vec::new()))];
                for (name, expr) in args {
                    locals.push(Var::new(name, self.state.evaluate_value(scope, expr)?));
                }

                self.state.frames.push(Frame {
                    function_name: function.clone(),
                    path: self.path.clone(),
                    line: *line,
                    locals: Some(locals),
                });
                let result = self.block(body);
                self.state.frames.pop();
                result?;
            }
        }
        Ok(())
    }

    /// Runs before every statement: services queued work, honours abort and
    /// break requests, and stops for breakpoints and steps
    fn checkpoint(&mut self, line: u32, command: Option<&str>) -> Result<(), Unwind> {
        self.handler.on_safe_point(&mut *self.state);
        if self.flags.abort_requested.swap(false, Ordering::SeqCst) {
            return Err(Unwind::Abort);
        }
        if let Some(frame) = self.state.frames.last_mut() {
            frame.line = line;
        }

        let hits = self
            .state
            .triggered_breakpoints(self.path.as_deref(), line, command);
        let depth = self.state.frames.len();
        let stepped = match self.step {
            Step::None => false,
            Step::Into => true,
            Step::Over(from) => depth <= from,
            Step::Out(from) => depth < from,
        };
        let broke = self.flags.break_requested.swap(false, Ordering::SeqCst);
        if hits.is_empty() && !stepped && !broke {
            return Ok(());
        }

        self.step = Step::None;
        self.state.arena.clear();
        let stop = EngineStop {
            script_path: self.path.clone(),
            line,
            column: 1,
            breakpoints: hits,
            remote: self.remote,
        };
        let action = self.handler.on_stop(&mut *self.state, stop);
        self.state.arena.clear();

        match action {
            ResumeAction::Continue => {}
            ResumeAction::StepIn => self.step = Step::Into,
            ResumeAction::StepOver => self.step = Step::Over(depth),
            ResumeAction::StepOut => self.step = Step::Out(depth),
            ResumeAction::Abort => return Err(Unwind::Abort),
        }
        Ok(())
    }
}

struct LoadedScript {
    program: Arc<Program>,
    remote: bool,
}

/// Deterministic engine for tests
pub struct ScriptedEngine {
    state: EngineState,
    scripts: HashMap<PathBuf, LoadedScript>,
    inline: HashMap<String, Arc<Program>>,
    flags: Arc<Flags>,
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedEngine {
    /// An engine with a few well-known globals defined
    pub fn new() -> Self {
        let mut engine = Self {
            state: EngineState::default(),
            scripts: HashMap::new(),
            inline: HashMap::new(),
            flags: Arc::new(Flags::default()),
        }
        .with_enum(
            "ActionPreference",
            [
                "SilentlyContinue",
                "Stop",
                "Continue",
                "Inquire",
                "Ignore",
                "Suspend",
                "Break",
            ],
        )
        .with_typed_global("$MaximumHistoryCount", "int", Value::Int(4096))
        .with_typed_global(
            "$VerbosePreference",
            "ActionPreference",
            Value::enumeration("ActionPreference", "SilentlyContinue"),
        );
        engine
            .state
            .globals
            .push(Var::automatic("$Error", Value::Array(Vec::new())));
        engine
    }

    pub fn with_script(mut self, path: impl Into<PathBuf>, program: Program) -> Self {
        self.scripts.insert(
            path.into(),
            LoadedScript {
                program: Arc::new(program),
                remote: false,
            },
        );
        self
    }

    /// A script that runs in a remote session; stops report its remote path
    pub fn with_remote_script(mut self, path: impl Into<PathBuf>, program: Program) -> Self {
        self.scripts.insert(
            path.into(),
            LoadedScript {
                program: Arc::new(program),
                remote: true,
            },
        );
        self
    }

    /// An ad-hoc command, run with [`ScriptSource::Inline`] and the same text
    pub fn with_inline(mut self, text: impl Into<String>, program: Program) -> Self {
        self.inline.insert(text.into(), Arc::new(program));
        self
    }

    pub fn with_global(mut self, name: impl Into<String>, value: Value) -> Self {
        self.state.globals.push(Var::new(name, value));
        self
    }

    pub fn with_typed_global(
        mut self,
        name: impl Into<String>,
        type_name: impl Into<String>,
        value: Value,
    ) -> Self {
        self.state.globals.push(Var {
            type_constraint: Some(type_name.into()),
            ..Var::new(name, value)
        });
        self
    }

    pub fn with_enum<S: Into<String>>(
        mut self,
        type_name: impl Into<String>,
        names: impl IntoIterator<Item = S>,
    ) -> Self {
        self.state
            .enums
            .insert(type_name.into(), names.into_iter().map(Into::into).collect());
        self
    }
}

impl ScriptEngine for ScriptedEngine {
    fn context(&mut self) -> &mut dyn EngineContext {
        &mut self.state
    }

    fn interrupt_handle(&self) -> Arc<dyn Interrupt> {
        self.flags.clone()
    }

    fn run(&mut self, script: &ScriptSource, handler: &mut dyn StopHandler) -> RunOutcome {
        let (program, path, remote, args) = match script {
            ScriptSource::File { path, args } => match self.scripts.get(path) {
                Some(loaded) => (
                    Arc::clone(&loaded.program),
                    Some(path.clone()),
                    loaded.remote,
                    args.as_slice(),
                ),
                None => {
                    return RunOutcome::Failed(format!(
                        "The term '{}' is not recognized as a name of a cmdlet, function, script file, or executable program.",
                        path.display()
                    ));
                }
            },
            ScriptSource::Inline(text) => match self.inline.get(text) {
                Some(program) => (Arc::clone(program), None, false, &[][..]),
                None => return RunOutcome::Failed(format!("Unknown command '{text}'.")),
            },
        };

        let mut script_vars = match path.as_deref().and_then(Path::parent) {
            Some(root) => vec![Var::automatic(
                "$PSScriptRoot",
                Value::str(root.display().to_string()),
            )],
            None => Vec::new(),
        };
        if path.is_some() {
            script_vars.extend(self.state.bind_arguments(&program.params, args));
        }
        self.state.script_vars = script_vars;
        self.state.frames = vec![Frame {
            function_name: TOP_LEVEL_FUNCTION.to_string(),
            path: path.clone(),
            line: 0,
            locals: None,
        }];

        let result = {
            let mut run = Run {
                state: &mut self.state,
                handler,
                flags: &self.flags,
                program: Arc::clone(&program),
                path,
                remote,
                step: Step::None,
            };
            run.block(&program.body)
        };

        // pending requests do not carry over to the next run
        self.flags.break_requested.store(false, Ordering::SeqCst);
        self.flags.abort_requested.store(false, Ordering::SeqCst);
        self.state.frames.clear();
        self.state.arena.clear();
        match result {
            Ok(()) => RunOutcome::Completed,
            Err(Unwind::Abort) => RunOutcome::Aborted,
            Err(Unwind::Fail(message)) => RunOutcome::Failed(message),
        }
    }
}

/// Workspace that maps remote script paths to local shadow copies
#[derive(Debug, Default, Clone)]
pub struct ShadowWorkspace {
    shadows: HashMap<PathBuf, PathBuf>,
}

impl ShadowWorkspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shadow(mut self, remote: impl Into<PathBuf>, local: impl Into<PathBuf>) -> Self {
        self.shadows.insert(remote.into(), local.into());
        self
    }
}

impl Workspace for ShadowWorkspace {
    fn resolve_local_shadow_path(&self, remote_path: &Path) -> Option<PathBuf> {
        self.shadows.get(remote_path).cloned()
    }
}

/// Scripts shared by the session tests
pub mod fixtures {
    use super::{Program, Stmt, Value};

    /// Line of the statement inside the loop that builds a string
    pub const LOOP_STRING_LINE: u32 = 6;
    /// Line of the statement inside the loop that doubles `$i`
    pub const LOOP_DOUBLE_LINE: u32 = 7;
    /// Line inside `Test-Variables` after every variable is set
    pub const VARIABLES_READY_LINE: u32 = 20;
    pub const VARIABLES_NEXT_LINE: u32 = 21;

    /// `$i` counts from 1 to `last`
    pub fn loop_program(last: i64) -> Program {
        Program::new(vec![
            Stmt::assign(1, "$str", "'start'"),
            Stmt::for_range(
                4,
                "$i",
                1,
                last,
                vec![
                    Stmt::assign(LOOP_STRING_LINE, "$str", "'Output ' + $i"),
                    Stmt::assign(LOOP_DOUBLE_LINE, "$x", "$i * 2"),
                ],
            ),
            Stmt::command(10, "Get-Date"),
        ])
    }

    /// Script-level variables plus a function with one local of every shape
    pub fn variables_program() -> Program {
        Program::new(vec![
            Stmt::assign(1, "$scriptInt", "42"),
            Stmt::declare(2, "$scriptBool", "bool", "$false"),
            Stmt::call(4, "Test-Variables", [("$Param1", "'Foo'")]),
        ])
        .with_function(
            "Test-Variables",
            vec![
                Stmt::assign(10, "$strVar", "'Hello'"),
                Stmt::declare(11, "$strVar2", "string", "'Hello2'"),
                Stmt::declare(12, "$intVar", "int", "7"),
                Stmt::value(
                    13,
                    "$arrVar",
                    Value::Array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
                ),
                Stmt::value(
                    14,
                    "$assocArrVar",
                    Value::hashtable([
                        ("firstChild", Value::str("Child")),
                        ("secondChild", Value::Int(42)),
                    ]),
                ),
                Stmt::value(15, "$emptyHash", Value::Hashtable(Vec::new())),
                Stmt::value(16, "$nullString", Value::NullString),
                Stmt::value(
                    17,
                    "$psCustomObjVar",
                    Value::object(
                        "PSCustomObject",
                        [("Name", Value::str("Paul")), ("Age", Value::Int(73))],
                    ),
                ),
                Stmt::value(
                    18,
                    "$enumVar",
                    Value::enumeration("ActionPreference", "Continue"),
                ),
                Stmt::value(19, "$Force", Value::switch(true)),
                Stmt::command(VARIABLES_READY_LINE, "Write-Output"),
                Stmt::command(VARIABLES_NEXT_LINE, "Write-Host"),
            ],
        )
    }

    /// Loops until aborted
    pub fn endless_program() -> Program {
        Program::new(vec![
            Stmt::assign(1, "$n", "0"),
            Stmt::repeat(2, vec![Stmt::assign(3, "$n", "$n + 1")]),
        ])
    }
}
