//! Test-only collaborators: scripted compiler, scripted loader, recording events.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow};

use crate::core::types::{MethodRunResult, RawDiagnostic, ScriptFault};
use crate::io::compiler::{CompileOutput, CompileRequest, Compiler};
use crate::io::config::EngineConfig;
use crate::io::environment::Environment;
use crate::io::loader::{BindRequest, BindingError, ScriptEntry, UnitLoader};
use crate::program::ProgramEvents;

/// Temporary programs directory with an initialized environment.
pub struct TestEnv {
    temp: tempfile::TempDir,
    env: Arc<Environment>,
}

impl TestEnv {
    pub fn new() -> Result<Self> {
        Self::with_config(|_| {})
    }

    /// Use `template` as the wrapper instead of the built-in one.
    pub fn with_template(template: &str) -> Result<Self> {
        Self::build(Some(template), |_| {})
    }

    /// Build with config tweaks applied on top of temp-dir defaults.
    pub fn with_config(tweak: impl FnOnce(&mut EngineConfig)) -> Result<Self> {
        Self::build(None, tweak)
    }

    fn build(template: Option<&str>, tweak: impl FnOnce(&mut EngineConfig)) -> Result<Self> {
        let temp = tempfile::tempdir()?;
        let mut cfg = EngineConfig {
            programs_dir: temp.path().join("programs"),
            shadow_dir: temp.path().join("shadow"),
            ..EngineConfig::default()
        };
        if let Some(text) = template {
            let path = temp.path().join("wrapper.tpl");
            fs::write(&path, text)?;
            cfg.template_path = Some(path);
        }
        tweak(&mut cfg);
        let env = Environment::init(cfg)?;
        Ok(Self { temp, env })
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn env(&self) -> Arc<Environment> {
        Arc::clone(&self.env)
    }

    pub fn artifact_path(&self, address: &str) -> Result<PathBuf> {
        self.env.store().stable_path(address)
    }
}

/// One queued compiler response.
#[derive(Debug, Clone, Default)]
pub struct ScriptedCompile {
    pub diagnostics: Vec<RawDiagnostic>,
    pub artifact: Option<Vec<u8>>,
    pub debug: Option<Vec<u8>>,
    pub tool_failure: Option<String>,
}

impl ScriptedCompile {
    pub fn artifact(bytes: Vec<u8>) -> Self {
        Self::artifact_with(bytes, Vec::new())
    }

    pub fn artifact_with(bytes: Vec<u8>, diagnostics: Vec<RawDiagnostic>) -> Self {
        Self {
            diagnostics,
            artifact: Some(bytes),
            ..Self::default()
        }
    }

    /// Diagnostics only; nothing is written.
    pub fn diagnostics(diagnostics: Vec<RawDiagnostic>) -> Self {
        Self {
            diagnostics,
            ..Self::default()
        }
    }

    pub fn tool_failure(message: &str) -> Self {
        Self {
            tool_failure: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn with_debug(mut self, bytes: Vec<u8>) -> Self {
        self.debug = Some(bytes);
        self
    }
}

/// Compiler that replays queued responses and records requests.
#[derive(Debug, Default)]
pub struct ScriptedCompiler {
    queue: Mutex<VecDeque<ScriptedCompile>>,
    requests: Mutex<Vec<CompileRequest>>,
}

impl ScriptedCompiler {
    pub fn new(compiles: Vec<ScriptedCompile>) -> Self {
        Self {
            queue: Mutex::new(compiles.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, compile: ScriptedCompile) {
        self.queue.lock().expect("compiler queue").push_back(compile);
    }

    pub fn requests(&self) -> Vec<CompileRequest> {
        self.requests.lock().expect("compiler requests").clone()
    }
}

impl Compiler for ScriptedCompiler {
    fn compile(&self, request: &CompileRequest) -> Result<CompileOutput> {
        self.requests
            .lock()
            .expect("compiler requests")
            .push(request.clone());
        let next = self
            .queue
            .lock()
            .expect("compiler queue")
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted compile left"))?;
        if let Some(message) = next.tool_failure {
            return Err(anyhow!(message));
        }
        if let Some(bytes) = &next.artifact {
            fs::write(&request.output_path, bytes)?;
        }
        if let Some(bytes) = &next.debug {
            let mut path = request.output_path.as_os_str().to_owned();
            path.push(".pdb");
            fs::write(PathBuf::from(path), bytes)?;
        }
        Ok(CompileOutput {
            diagnostics: next.diagnostics,
        })
    }
}

#[derive(Debug)]
struct LoaderScript {
    setup_returns: bool,
    run_fault: Option<ScriptFault>,
    reset_fault: Option<ScriptFault>,
    binding_failure: Option<String>,
    supports_reset: bool,
    binds: usize,
    /// Entries from bind number `1..=broken_through` report themselves unusable.
    broken_through: usize,
    calls: Vec<String>,
}

impl Default for LoaderScript {
    fn default() -> Self {
        Self {
            setup_returns: true,
            run_fault: None,
            reset_fault: None,
            binding_failure: None,
            supports_reset: true,
            binds: 0,
            broken_through: 0,
            calls: Vec::new(),
        }
    }
}

/// Loader whose entries answer from a shared script and record every call.
///
/// `run` returns `true` with state `{"options": .., "image": ..}` so results
/// depend on both the request and the loaded bytes.
#[derive(Debug, Clone, Default)]
pub struct ScriptedLoader {
    script: Arc<Mutex<LoaderScript>>,
}

impl ScriptedLoader {
    fn with_script<T>(&self, f: impl FnOnce(&mut LoaderScript) -> T) -> T {
        f(&mut self.script.lock().expect("loader script"))
    }

    pub fn setup_returns(&self, value: bool) {
        self.with_script(|s| s.setup_returns = value);
    }

    pub fn run_faults(&self, fault: ScriptFault) {
        self.with_script(|s| s.run_fault = Some(fault));
    }

    pub fn fail_binding(&self, message: &str) {
        self.with_script(|s| s.binding_failure = Some(message.to_string()));
    }

    pub fn reset_faults(&self, fault: ScriptFault) {
        self.with_script(|s| s.reset_fault = Some(fault));
    }

    /// Mark every entry bound so far as unusable; later binds are healthy.
    pub fn break_bound_entries(&self) {
        self.with_script(|s| s.broken_through = s.binds);
    }

    pub fn without_reset(&self) {
        self.with_script(|s| s.supports_reset = false);
    }

    pub fn binds(&self) -> usize {
        self.with_script(|s| s.binds)
    }

    pub fn calls(&self) -> Vec<String> {
        self.with_script(|s| s.calls.clone())
    }
}

impl UnitLoader for ScriptedLoader {
    fn bind(&self, request: &BindRequest<'_>) -> Result<Box<dyn ScriptEntry>, BindingError> {
        let number = self.with_script(|s| {
            if let Some(message) = &s.binding_failure {
                return Err(BindingError::Protocol(message.clone()));
            }
            s.binds += 1;
            Ok(s.binds)
        })?;
        Ok(Box::new(ScriptedEntry {
            script: Arc::clone(&self.script),
            image: String::from_utf8_lossy(&request.image.bytes).into_owned(),
            bind_number: number,
        }))
    }
}

struct ScriptedEntry {
    script: Arc<Mutex<LoaderScript>>,
    image: String,
    bind_number: usize,
}

impl ScriptedEntry {
    /// Record `call` and keep the script locked for the caller.
    fn record(&self, call: String) -> MutexGuard<'_, LoaderScript> {
        let mut script = self.script.lock().expect("loader script");
        script.calls.push(call);
        script
    }
}

impl ScriptEntry for ScriptedEntry {
    fn set_host(&mut self, host: &str, address: &str) -> Result<(), ScriptFault> {
        drop(self.record(format!("set_host {host} {address}")));
        Ok(())
    }

    fn setup(&mut self) -> Result<MethodRunResult, ScriptFault> {
        let script = self.record("setup".to_string());
        Ok(MethodRunResult::new(script.setup_returns))
    }

    fn run(&mut self, options: &str) -> Result<MethodRunResult, ScriptFault> {
        let script = self.record(format!("run {options}"));
        if let Some(fault) = &script.run_fault {
            return Err(fault.clone());
        }
        Ok(MethodRunResult {
            return_value: true,
            state: serde_json::json!({ "options": options, "image": self.image }),
        })
    }

    fn reset(&mut self) -> Result<(), ScriptFault> {
        let script = self.record("reset".to_string());
        match &script.reset_fault {
            Some(fault) => Err(fault.clone()),
            None => Ok(()),
        }
    }

    fn supports_reset(&self) -> bool {
        self.script.lock().expect("loader script").supports_reset
    }

    fn is_usable(&self) -> bool {
        self.bind_number > self.script.lock().expect("loader script").broken_through
    }
}

/// Event sink that keeps `(address, property, value)` triples.
#[derive(Debug, Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<(String, String, String)>>,
}

impl RecordingEvents {
    pub fn take(&self) -> Vec<(String, String, String)> {
        std::mem::take(&mut *self.events.lock().expect("events"))
    }
}

impl ProgramEvents for RecordingEvents {
    fn raise(&self, address: &str, property: &str, value: &str) {
        self.events.lock().expect("events").push((
            address.to_string(),
            property.to_string(),
            value.to_string(),
        ));
    }
}
