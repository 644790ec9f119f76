//! Client breakpoint sets and their reconciliation with the engine.
//!
//! Every set call replaces the whole set for its scope: the engine's
//! breakpoints for that file (or the command set) are cleared first, then
//! the requested ones are registered one by one.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use crate::{
    engine::{BreakpointLocation, BreakpointScope, EngineBreakpointId, EngineContext},
    types::{Breakpoint, BreakpointId, CommandBreakpoint, SourceBreakpoint},
    utils::normalise_path,
};

/// Relational operators from other languages and the script equivalents
const OPERATOR_HINTS: &[(&str, &str)] = &[
    ("==", "-eq"),
    ("!=", "-ne"),
    (">=", "-ge"),
    ("<=", "-le"),
    (">", "-gt"),
    ("<", "-lt"),
];

#[derive(Debug, Default)]
pub struct BreakpointRegistry {
    next_id: BreakpointId,
    files: HashMap<PathBuf, Vec<Breakpoint>>,
    commands: Vec<Breakpoint>,
    by_engine_id: HashMap<EngineBreakpointId, Breakpoint>,
}

impl BreakpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the line breakpoints of one file.
    ///
    /// Verified breakpoints come back in the engine's store order, followed by
    /// unverified ones in request order.
    #[tracing::instrument(skip(self, cx, requested), fields(count = requested.len()))]
    pub fn set_line_breakpoints(
        &mut self,
        cx: &mut dyn EngineContext,
        path: &Path,
        requested: &[SourceBreakpoint],
    ) -> Vec<Breakpoint> {
        let path = normalise_path(path).into_owned();
        let scope = BreakpointScope::File(path.clone());
        cx.clear_breakpoints(&scope);
        self.by_engine_id
            .retain(|_, bp| bp.source.as_deref() != Some(path.as_path()));

        let mut registered = HashMap::new();
        let mut rejected = Vec::new();
        for request in requested {
            let mut breakpoint = Breakpoint {
                id: None,
                verified: false,
                message: None,
                source: Some(path.clone()),
                line: Some(request.line),
                column: request.column,
                name: None,
                condition: non_empty(&request.condition),
                hit_condition: non_empty(&request.hit_condition),
            };

            let registration = validate(&breakpoint).and_then(|hit_count| {
                cx.set_line_breakpoint(
                    &path,
                    request.line,
                    request.column,
                    breakpoint.condition.as_deref(),
                    hit_count,
                )
                .map_err(|e| e.message)
            });
            match registration {
                Ok(engine_id) => {
                    breakpoint.verified = true;
                    registered.insert(engine_id, breakpoint);
                }
                Err(message) => {
                    tracing::debug!(line = request.line, %message, "line breakpoint rejected");
                    breakpoint.message = Some(message);
                    rejected.push(breakpoint);
                }
            }
        }

        let confirmed = self.confirm(cx, &scope, registered, rejected);
        self.files.insert(path, confirmed.clone());
        confirmed
    }

    /// Replace the global set of command breakpoints
    #[tracing::instrument(skip(self, cx, requested), fields(count = requested.len()))]
    pub fn set_command_breakpoints(
        &mut self,
        cx: &mut dyn EngineContext,
        requested: &[CommandBreakpoint],
    ) -> Vec<Breakpoint> {
        let scope = BreakpointScope::Commands;
        cx.clear_breakpoints(&scope);
        self.by_engine_id.retain(|_, bp| bp.name.is_none());

        let mut registered = HashMap::new();
        let mut rejected = Vec::new();
        for request in requested {
            let mut breakpoint = Breakpoint {
                id: None,
                verified: false,
                message: None,
                source: None,
                line: None,
                column: None,
                name: Some(request.name.clone()),
                condition: non_empty(&request.condition),
                hit_condition: non_empty(&request.hit_condition),
            };

            let registration = validate(&breakpoint).and_then(|hit_count| {
                cx.set_command_breakpoint(&request.name, breakpoint.condition.as_deref(), hit_count)
                    .map_err(|e| e.message)
            });
            match registration {
                Ok(engine_id) => {
                    breakpoint.verified = true;
                    registered.insert(engine_id, breakpoint);
                }
                Err(message) => {
                    tracing::debug!(name = %request.name, %message, "command breakpoint rejected");
                    breakpoint.message = Some(message);
                    rejected.push(breakpoint);
                }
            }
        }

        let confirmed = self.confirm(cx, &scope, registered, rejected);
        self.commands = confirmed.clone();
        confirmed
    }

    /// Clear every breakpoint this registry knows about from the engine
    pub fn remove_all(&mut self, cx: &mut dyn EngineContext) {
        for path in self.files.keys() {
            cx.clear_breakpoints(&BreakpointScope::File(path.clone()));
        }
        cx.clear_breakpoints(&BreakpointScope::Commands);
        self.files.clear();
        self.commands.clear();
        self.by_engine_id.clear();
        tracing::debug!("removed all breakpoints");
    }

    /// Every breakpoint currently registered, files first then commands
    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        let mut paths: Vec<_> = self.files.keys().collect();
        paths.sort();
        paths
            .into_iter()
            .flat_map(|path| self.files[path].iter().cloned())
            .chain(self.commands.iter().cloned())
            .collect()
    }

    /// Client breakpoints for the engine ids reported by a stop
    pub fn resolve_hits(&self, ids: &[EngineBreakpointId]) -> Vec<Breakpoint> {
        ids.iter()
            .filter_map(|id| self.by_engine_id.get(id).cloned())
            .collect()
    }

    fn confirm(
        &mut self,
        cx: &mut dyn EngineContext,
        scope: &BreakpointScope,
        mut registered: HashMap<EngineBreakpointId, Breakpoint>,
        rejected: Vec<Breakpoint>,
    ) -> Vec<Breakpoint> {
        let mut confirmed = Vec::with_capacity(registered.len() + rejected.len());
        for engine_bp in cx.breakpoints(scope) {
            let Some(mut breakpoint) = registered.remove(&engine_bp.id) else {
                continue;
            };
            // the engine may normalise what it stored
            if let BreakpointLocation::Line { line, column, .. } = engine_bp.location {
                breakpoint.line = Some(line);
                breakpoint.column = column;
            }
            self.next_id += 1;
            breakpoint.id = Some(self.next_id);
            self.by_engine_id.insert(engine_bp.id, breakpoint.clone());
            confirmed.push(breakpoint);
        }

        if !registered.is_empty() {
            tracing::warn!(
                missing = registered.len(),
                "engine did not list breakpoints it accepted"
            );
            for (engine_id, mut breakpoint) in registered {
                self.next_id += 1;
                breakpoint.id = Some(self.next_id);
                self.by_engine_id.insert(engine_id, breakpoint.clone());
                confirmed.push(breakpoint);
            }
        }

        confirmed.extend(rejected);
        confirmed
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Checks that do not need the engine. Returns the parsed hit count.
fn validate(breakpoint: &Breakpoint) -> Result<Option<u64>, String> {
    if let Some(condition) = &breakpoint.condition {
        if let Some(hint) = operator_hint(condition) {
            return Err(hint);
        }
    }
    breakpoint
        .hit_condition
        .as_deref()
        .map(parse_hit_count)
        .transpose()
}

fn parse_hit_count(text: &str) -> Result<u64, String> {
    match text.trim().parse::<u64>() {
        Ok(count) if count > 0 => Ok(count),
        _ => Err(format!(
            "Hit count '{text}' is not valid, it must be a positive integer."
        )),
    }
}

/// Suggest the script operator for a relational operator used outside of a
/// string literal
pub fn operator_hint(condition: &str) -> Option<String> {
    let mut quote: Option<char> = None;
    let mut rest = condition;
    while let Some(c) = rest.chars().next() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None => {
                if let Some((op, replacement)) =
                    OPERATOR_HINTS.iter().find(|(op, _)| rest.starts_with(op))
                {
                    return Some(format!("Use '{replacement}' instead of '{op}'."));
                }
            }
        }
        rest = &rest[c.len_utf8()..];
    }
    None
}
