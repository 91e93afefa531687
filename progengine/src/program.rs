//! Program unit state shared with the automation system.
//!
//! The automation system owns [`ProgramBlock`]; the engine holds a
//! [`ProgramHandle`] and only touches the enabled flag, error fields and
//! activation timestamps.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::types::ProgramError;

/// Event property used to publish compiler warnings.
pub const COMPILER_WARNING: &str = "Runtime.Compiler.Warning";

/// Text stored in `script_errors` when a program cannot be loaded.
pub const NOT_COMPILED: &str = "Program is not compiled.";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgramBlock {
    /// Stable identity; also names the program's artifact.
    pub address: String,
    pub name: String,
    /// Main program body.
    pub script_source: String,
    /// Trigger condition, if the program has one.
    pub script_setup: Option<String>,
    pub is_enabled: bool,
    /// Set externally to force activation regardless of the trigger condition.
    pub will_run: bool,
    /// Human-readable error text from the last failed load.
    pub script_errors: String,
    pub last_compile_errors: Vec<ProgramError>,
    pub activation_time: Option<DateTime<Utc>>,
    pub trigger_time: Option<DateTime<Utc>>,
}

impl ProgramBlock {
    pub fn new(address: impl Into<String>, script_source: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            name: format!("program {address}"),
            address,
            script_source: script_source.into(),
            ..Self::default()
        }
    }

    pub fn with_trigger(mut self, script_setup: impl Into<String>) -> Self {
        self.script_setup = Some(script_setup.into());
        self
    }

    pub fn into_handle(self) -> ProgramHandle {
        ProgramHandle::new(self)
    }
}

/// Shared, lockable reference to a program owned by the automation system.
#[derive(Debug, Clone)]
pub struct ProgramHandle(Arc<Mutex<ProgramBlock>>);

impl ProgramHandle {
    pub fn new(block: ProgramBlock) -> Self {
        Self(Arc::new(Mutex::new(block)))
    }

    pub fn lock(&self) -> MutexGuard<'_, ProgramBlock> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Clone of the current state.
    pub fn snapshot(&self) -> ProgramBlock {
        self.lock().clone()
    }
}

/// Host event bus boundary.
pub trait ProgramEvents {
    fn raise(&self, address: &str, property: &str, value: &str);
}

/// Event sink that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogEvents;

impl ProgramEvents for LogEvents {
    fn raise(&self, address: &str, property: &str, value: &str) {
        warn!(address, property, value, "program event");
    }
}
