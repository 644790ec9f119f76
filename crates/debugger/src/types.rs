use std::path::PathBuf;

use serde::Serialize;

use crate::handles::VariableHandle;

/// Script path reported for frames executing code with no backing file
pub const NO_FILE_SCRIPT_PATH: &str = "<No File>";

pub const AUTO_SCOPE_NAME: &str = "Auto";
pub const LOCAL_SCOPE_NAME: &str = "Local";
pub const SCRIPT_SCOPE_NAME: &str = "Script";
pub const GLOBAL_SCOPE_NAME: &str = "Global";

pub type BreakpointId = u64;

/// A line breakpoint requested by the client
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceBreakpoint {
    pub line: u32,
    pub column: Option<u32>,
    pub condition: Option<String>,
    pub hit_condition: Option<String>,
}

impl SourceBreakpoint {
    pub fn at(line: u32) -> Self {
        Self {
            line,
            ..Default::default()
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_hit_condition(mut self, hit_condition: impl Into<String>) -> Self {
        self.hit_condition = Some(hit_condition.into());
        self
    }
}

/// A command breakpoint requested by the client
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandBreakpoint {
    pub name: String,
    pub condition: Option<String>,
    pub hit_condition: Option<String>,
}

impl CommandBreakpoint {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BreakpointKind {
    Line,
    Command,
    Conditional,
    HitCount,
}

/// A requested or confirmed stop point
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Breakpoint {
    /// Assigned once the engine has confirmed the breakpoint
    pub id: Option<BreakpointId>,
    pub verified: bool,
    /// Human readable reason when not verified
    pub message: Option<String>,
    pub source: Option<PathBuf>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    /// Command name, for command breakpoints
    pub name: Option<String>,
    pub condition: Option<String>,
    pub hit_condition: Option<String>,
}

impl Breakpoint {
    pub fn kind(&self) -> BreakpointKind {
        if self.condition.is_some() {
            BreakpointKind::Conditional
        } else if self.hit_condition.is_some() {
            BreakpointKind::HitCount
        } else if self.name.is_some() {
            BreakpointKind::Command
        } else {
            BreakpointKind::Line
        }
    }
}

/// One debugger halt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoppedEvent {
    /// Local path of the script, the shadow copy for remote sessions
    pub script_path: PathBuf,
    pub is_remote_session: bool,
    /// Original path on the remote machine
    pub remote_script_path: Option<PathBuf>,
    pub line: u32,
    pub column: u32,
    /// Breakpoints that caused the halt, empty for manual breaks and steps
    pub breakpoints: Vec<Breakpoint>,
}

/// Handles of the scope containers attached to a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameScopes {
    pub auto: VariableHandle,
    pub local: VariableHandle,
    pub script: VariableHandle,
    pub global: VariableHandle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StackFrame {
    pub index: usize,
    pub function_name: String,
    pub script_path: PathBuf,
    pub line: u32,
    pub column: u32,
    pub scopes: FrameScopes,
}

impl StackFrame {
    pub fn auto_variables(&self) -> VariableHandle {
        self.scopes.auto
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableScope {
    pub name: String,
    pub handle: VariableHandle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub name: String,
    pub value: String,
    pub type_name: Option<String>,
    pub is_expandable: bool,
    /// Present when `is_expandable`
    pub handle: Option<VariableHandle>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResult {
    pub value: String,
    pub type_name: Option<String>,
    pub is_expandable: bool,
    pub handle: Option<VariableHandle>,
}
