//! Per-stop variable handles.
//!
//! A handle packs the stop generation into its upper bits and a per-stop index
//! into its lower bits, so a handle from an earlier stop can be told apart
//! from one that was never issued. The generation is a full `u32`, so it does
//! not repeat within the life of a session.

use std::fmt;

use serde::Serialize;

use crate::{
    engine::{ScopeRef, ValueRef},
    error::DebugError,
    types::Variable,
};

const INDEX_BITS: u32 = 20;
const INDEX_MASK: i64 = (1 << INDEX_BITS) - 1;

/// Opaque identifier for a variable container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct VariableHandle(i64);

impl VariableHandle {
    fn new(generation: u32, index: usize) -> Self {
        Self(((generation as i64) << INDEX_BITS) | index as i64)
    }

    fn generation(self) -> u32 {
        (self.0 >> INDEX_BITS) as u32
    }

    fn index(self) -> usize {
        (self.0 & INDEX_MASK) as usize
    }

    pub fn as_i64(self) -> i64 {
        self.0
    }
}

impl From<i64> for VariableHandle {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl fmt::Display for VariableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which variables of a scope a scope container lists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeFilter {
    /// Everything except engine-defined automatic variables
    Auto,
    All,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerKind {
    Scope { scope: ScopeRef, filter: ScopeFilter },
    Value { value: ValueRef },
}

/// A scope or an expandable value whose children can be requested lazily
#[derive(Debug, Clone)]
pub struct VariableContainer {
    pub name: String,
    pub kind: ContainerKind,
    /// Scope that assignments and evaluations under this container resolve in
    pub parent_scope: ScopeRef,
    /// Filled on first expansion
    pub children: Option<Vec<Variable>>,
}

impl VariableContainer {
    pub fn scope(name: impl Into<String>, scope: ScopeRef, filter: ScopeFilter) -> Self {
        Self {
            name: name.into(),
            kind: ContainerKind::Scope { scope, filter },
            parent_scope: scope,
            children: None,
        }
    }

    pub fn value(name: impl Into<String>, value: ValueRef, parent_scope: ScopeRef) -> Self {
        Self {
            name: name.into(),
            kind: ContainerKind::Value { value },
            parent_scope,
            children: None,
        }
    }
}

/// Maps handles to containers for the current stop
#[derive(Debug)]
pub struct HandleTable {
    generation: u32,
    containers: Vec<VariableContainer>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            generation: 1,
            containers: Vec::new(),
        }
    }

    /// Invalidate every handle and start a new generation
    pub fn reset(&mut self) {
        self.generation = self.generation.saturating_add(1);
        self.containers.clear();
        tracing::trace!(generation = self.generation, "reset variable handles");
    }

    pub fn allocate(&mut self, container: VariableContainer) -> Result<VariableHandle, DebugError> {
        let index = self.containers.len() + 1;
        if index as i64 > INDEX_MASK {
            return Err(DebugError::HandleSpaceExhausted);
        }
        self.containers.push(container);
        Ok(VariableHandle::new(self.generation, index))
    }

    pub fn resolve(&self, handle: VariableHandle) -> Result<&VariableContainer, DebugError> {
        let index = self.check(handle)?;
        Ok(&self.containers[index])
    }

    pub fn resolve_mut(
        &mut self,
        handle: VariableHandle,
    ) -> Result<&mut VariableContainer, DebugError> {
        let index = self.check(handle)?;
        Ok(&mut self.containers[index])
    }

    /// Drop cached children so the next expansion re-reads the engine
    pub fn invalidate_children(&mut self) {
        for container in &mut self.containers {
            container.children = None;
        }
    }

    fn check(&self, handle: VariableHandle) -> Result<usize, DebugError> {
        if handle.0 <= 0 {
            return Err(DebugError::UnknownHandle { handle });
        }
        if handle.generation() != self.generation {
            return Err(DebugError::StaleHandle { handle });
        }
        match handle.index() {
            0 => Err(DebugError::UnknownHandle { handle }),
            index if index <= self.containers.len() => Ok(index - 1),
            _ => Err(DebugError::UnknownHandle { handle }),
        }
    }
}
