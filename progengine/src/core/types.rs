//! Shared deterministic types for the program engine.
//!
//! These types define stable contracts between the composer, the mappers and
//! the lifecycle controller. They carry no I/O and serialize to a stable JSON
//! shape so they can cross the CLI and loader boundaries unchanged.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical fragment of a program a line number refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodeBlock {
    /// Main script body (`CR`).
    #[serde(rename = "CR")]
    MainBody,
    /// Trigger-condition expression (`TC`).
    #[serde(rename = "TC")]
    TriggerCondition,
}

impl CodeBlock {
    /// Short tag used in notifications and serialized errors.
    pub fn tag(self) -> &'static str {
        match self {
            CodeBlock::MainBody => "CR",
            CodeBlock::TriggerCondition => "TC",
        }
    }
}

impl fmt::Display for CodeBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Diagnostic as reported by the compiler, positioned in the composed unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDiagnostic {
    /// 0 when the compiler gives no position.
    #[serde(default)]
    pub line: i64,
    #[serde(default)]
    pub column: i64,
    pub message: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub warning: bool,
}

/// Error reported back to the program author, positioned in a logical fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramError {
    pub line: i64,
    pub column: i64,
    pub error_message: String,
    pub error_number: String,
    pub code_block: CodeBlock,
}

impl ProgramError {
    /// Error code used for failures that did not come from a compiler diagnostic.
    pub const SYNTHETIC_CODE: &'static str = "-1";

    /// Build a `-1` error at an unknown position in the main body.
    pub fn synthetic(message: impl Into<String>) -> Self {
        Self {
            line: 0,
            column: 0,
            error_message: message.into(),
            error_number: Self::SYNTHETIC_CODE.to_string(),
            code_block: CodeBlock::MainBody,
        }
    }
}

impl fmt::Display for ProgramError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{}: {} ({})",
            self.code_block, self.line, self.column, self.error_message, self.error_number
        )
    }
}

/// Outcome of a `setup` or `run` invocation on a bound program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodRunResult {
    pub return_value: bool,
    /// Opaque state produced by the program; the engine never inspects it.
    #[serde(default)]
    pub state: serde_json::Value,
}

impl MethodRunResult {
    pub fn new(return_value: bool) -> Self {
        Self {
            return_value,
            state: serde_json::Value::Null,
        }
    }
}

/// One frame of a script-side call stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    /// Fully-qualified declaring type of the frame's method, if known.
    #[serde(rename = "type", default)]
    pub declaring_type: Option<String>,
    /// Line in the composed unit.
    #[serde(default)]
    pub line: i64,
}

/// Failure raised by program code while a bound operation was running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptFault {
    pub message: String,
    /// Innermost frame first.
    #[serde(default)]
    pub frames: Vec<StackFrame>,
}

impl ScriptFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            frames: Vec::new(),
        }
    }
}

impl fmt::Display for ScriptFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ScriptFault {}

/// Count the lines of a program fragment the way the offset arithmetic expects.
///
/// Splits on `\n` only, so a trailing newline counts as an extra (empty) line.
pub fn fragment_line_count(source: &str) -> i64 {
    source.split('\n').count() as i64
}
