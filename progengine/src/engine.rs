//! Lifecycle controller for one program unit.
//!
//! [`ProgramEngine`] implements the program-level contract the scheduler
//! drives: `compile`, `load`, `unload`, `setup`, `run`, `reset` and
//! `formatted_error`. It composes the program's fragments, runs the
//! [`Compiler`], remaps diagnostics, commits artifacts through the store and
//! binds loaded units lazily through the [`UnitLoader`].
//!
//! State machine:
//!
//! ```text
//! Unloaded --load--> LoadedUnbound --setup/run (bind ok)--> LoadedBound
//!    ^                    |   ^                                 |
//!    +------unload--------+   +--- bind failed (stays) ---------+--unload--> Unloaded
//! ```

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use crate::contexts::Generation;
use crate::core::diagnostics::{LineOffsets, format_warning, map_diagnostics};
use crate::core::fault::format_fault;
use crate::core::types::{MethodRunResult, ProgramError, ScriptFault, fragment_line_count};
use crate::io::artifact_store::ArtifactImage;
use crate::io::compiler::{CompileRequest, Compiler};
use crate::io::environment::Environment;
use crate::io::loader::{BindRequest, ScriptEntry, UnitLoader, bind_entry};
use crate::program::{COMPILER_WARNING, LogEvents, NOT_COMPILED, ProgramEvents, ProgramHandle};

/// Observable lifecycle state of the execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Unloaded,
    /// Artifact read; binding not attempted yet or failed.
    LoadedUnbound,
    LoadedBound,
}

struct BoundContext {
    generation: Generation,
    entry: Box<dyn ScriptEntry>,
}

enum Slot {
    Unloaded,
    Loaded {
        image: ArtifactImage,
        context: Option<BoundContext>,
    },
}

pub struct ProgramEngine<C: Compiler, L: UnitLoader, E: ProgramEvents = LogEvents> {
    env: Arc<Environment>,
    program: ProgramHandle,
    compiler: C,
    loader: L,
    events: E,
    slot: Slot,
}

impl<C: Compiler, L: UnitLoader> ProgramEngine<C, L, LogEvents> {
    pub fn new(env: Arc<Environment>, program: ProgramHandle, compiler: C, loader: L) -> Self {
        Self::with_events(env, program, compiler, loader, LogEvents)
    }
}

impl<C: Compiler, L: UnitLoader, E: ProgramEvents> ProgramEngine<C, L, E> {
    pub fn with_events(
        env: Arc<Environment>,
        program: ProgramHandle,
        compiler: C,
        loader: L,
        events: E,
    ) -> Self {
        Self {
            env,
            program,
            compiler,
            loader,
            events,
            slot: Slot::Unloaded,
        }
    }

    pub fn program(&self) -> &ProgramHandle {
        &self.program
    }

    pub fn events(&self) -> &E {
        &self.events
    }

    pub fn compiler(&self) -> &C {
        &self.compiler
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    pub fn state(&self) -> UnitState {
        match &self.slot {
            Slot::Unloaded => UnitState::Unloaded,
            Slot::Loaded { context: None, .. } => UnitState::LoadedUnbound,
            Slot::Loaded {
                context: Some(_), ..
            } => UnitState::LoadedBound,
        }
    }

    /// Generation of the bound context, if any.
    pub fn generation(&self) -> Option<Generation> {
        match &self.slot {
            Slot::Loaded {
                context: Some(ctx), ..
            } => Some(ctx.generation),
            _ => None,
        }
    }

    fn address(&self) -> String {
        self.program.lock().address.clone()
    }

    /// Read the committed artifact into memory. Binding happens on first use.
    ///
    /// A context that is already loaded is torn down first.
    #[instrument(skip(self), fields(address = %self.address()))]
    pub fn load(&mut self) -> bool {
        if !matches!(self.slot, Slot::Unloaded) {
            debug!("reloading, tearing down current context");
            self.teardown();
        }
        let address = self.address();
        let store = self.env.store();
        match store.read(&address) {
            Ok(image) => {
                debug!(bytes = image.bytes.len(), debug = image.debug.is_some(), "artifact loaded");
                self.slot = Slot::Loaded {
                    image,
                    context: None,
                };
                true
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "failed to load artifact");
                let mut program = self.program.lock();
                if program.script_errors.is_empty() {
                    program.script_errors = if store.exists(&address) {
                        format!("{err:#}")
                    } else {
                        NOT_COMPILED.to_string()
                    };
                }
                false
            }
        }
    }

    /// Reset the unit, clear its timestamps and tear down its context.
    ///
    /// Never fails: reset faults and teardown problems are logged and dropped.
    #[instrument(skip(self), fields(address = %self.address()))]
    pub fn unload(&mut self) {
        if let Err(fault) = self.reset() {
            warn!(err = %fault, "reset failed during unload");
        }
        {
            let mut program = self.program.lock();
            program.activation_time = None;
            program.trigger_time = None;
        }
        self.teardown();
    }

    fn teardown(&mut self) {
        let slot = std::mem::replace(&mut self.slot, Slot::Unloaded);
        if let Slot::Loaded {
            context: Some(ctx), ..
        } = slot
        {
            let address = self.address();
            self.env.registry().close(&address, ctx.generation);
            debug!(generation = ctx.generation, "context torn down");
        }
    }

    /// Bind the loaded unit if needed. `None` means nothing can be invoked.
    fn ensure_bound(&mut self) -> Option<&mut BoundContext> {
        let address = self.address();
        let Slot::Loaded { image, context } = &mut self.slot else {
            return None;
        };
        let registry = self.env.registry();

        if let Some(ctx) = context.as_ref() {
            if !registry.is_live(&address, ctx.generation) {
                warn!(address = %address, generation = ctx.generation, "dropping stale context");
                *context = None;
            } else if !ctx.entry.is_usable() {
                warn!(address = %address, generation = ctx.generation, "dropping unusable context");
                registry.close(&address, ctx.generation);
                *context = None;
            }
        }
        if context.is_none() {
            let generation = match registry.open(&address) {
                Ok(generation) => generation,
                Err(err) => {
                    error!(address = %address, err = %err, "cannot open execution context");
                    return None;
                }
            };
            let cfg = self.env.config();
            let request = BindRequest {
                address: &address,
                generation,
                image: &*image,
                entry_type: &cfg.entry_type,
                host: &cfg.host.endpoint,
            };
            match bind_entry(&self.loader, &request) {
                Ok(entry) => {
                    info!(address = %address, generation, "program unit bound");
                    *context = Some(BoundContext { generation, entry });
                }
                Err(err) => {
                    registry.close(&address, generation);
                    error!(address = %address, err = %err, detail = ?err, "failed to bind program unit");
                    return None;
                }
            }
        }
        context.as_mut()
    }

    /// Invoke `setup`. The outcome is forced to `true` while `will_run` is set.
    #[instrument(skip(self), fields(address = %self.address()))]
    pub fn setup(&mut self) -> Result<Option<MethodRunResult>, ScriptFault> {
        let Some(ctx) = self.ensure_bound() else {
            return Ok(None);
        };
        let mut result = ctx.entry.setup()?;
        let mut program = self.program.lock();
        result.return_value = result.return_value || program.will_run;
        if result.return_value {
            program.activation_time = Some(Utc::now());
        }
        Ok(Some(result))
    }

    /// Invoke `run` and return the program's result unmodified.
    #[instrument(skip(self, options), fields(address = %self.address()))]
    pub fn run(&mut self, options: &str) -> Result<Option<MethodRunResult>, ScriptFault> {
        let Some(ctx) = self.ensure_bound() else {
            return Ok(None);
        };
        let result = ctx.entry.run(options);
        self.program.lock().trigger_time = Some(Utc::now());
        result.map(Some)
    }

    /// Invoke `reset` on a bound unit that supports it; otherwise do nothing.
    pub fn reset(&mut self) -> Result<(), ScriptFault> {
        match &mut self.slot {
            Slot::Loaded {
                context: Some(ctx), ..
            } if ctx.entry.supports_reset() => ctx.entry.reset(),
            _ => Ok(()),
        }
    }

    /// Compile the program and commit the artifact when there are no errors.
    ///
    /// The program stays disabled for the whole compile and is re-enabled only
    /// after a successful commit, and only if it was enabled before. On errors
    /// the previously committed artifact is left as it was. A loaded context
    /// keeps running its in-memory image until the next `load`.
    #[instrument(skip(self), fields(address = %self.address()))]
    pub fn compile(&mut self) -> Vec<ProgramError> {
        let (address, was_enabled, source, trigger) = {
            let mut program = self.program.lock();
            let was_enabled = program.is_enabled;
            program.script_errors.clear();
            program.is_enabled = false;
            (
                program.address.clone(),
                was_enabled,
                program.script_source.clone(),
                program.script_setup.clone(),
            )
        };

        let store = self.env.store();
        if let Err(err) = store.clean_staging(&address) {
            warn!(err = %format!("{err:#}"), "failed to clean staging area");
        }
        let staged = match store.ensure_dirs().and_then(|()| store.staging_path(&address)) {
            Ok(path) => path,
            Err(err) => return self.fail_compile(vec![ProgramError::synthetic(format!("{err:#}"))]),
        };

        let composition = self.env.template().compose(&source, trigger.as_deref());
        let offsets = LineOffsets {
            main_offset: composition.main_offset,
            trigger_offset: composition.trigger_offset,
            main_line_count: composition.main_line_count,
        };
        let request = CompileRequest {
            address: address.clone(),
            source: composition.text,
            trigger_source: trigger,
            output_path: staged.clone(),
            references: self.env.config().compiler.references.clone(),
        };

        let errors = match self.compiler.compile(&request) {
            Ok(output) => {
                let mapped = map_diagnostics(&output.diagnostics, &offsets);
                for warning in &mapped.warnings {
                    self.events
                        .raise(&address, COMPILER_WARNING, &format_warning(warning));
                }
                mapped.errors
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "compiler invocation failed");
                vec![ProgramError::synthetic(format!("{err:#}"))]
            }
        };

        if !errors.is_empty() {
            if let Err(err) = store.discard(&staged) {
                warn!(err = %format!("{err:#}"), "failed to discard staged artifact");
            }
            return self.fail_compile(errors);
        }

        if let Err(err) = store.commit(&staged, &address) {
            error!(err = %format!("{err:#}"), "failed to commit artifact");
            if let Err(err) = store.discard(&staged) {
                warn!(err = %format!("{err:#}"), "failed to discard staged artifact");
            }
            return self.fail_compile(vec![ProgramError::synthetic(format!(
                "commit artifact: {err:#}"
            ))]);
        }

        let mut program = self.program.lock();
        program.last_compile_errors.clear();
        if was_enabled {
            program.is_enabled = true;
        }
        info!(was_enabled, "program compiled");
        Vec::new()
    }

    fn fail_compile(&self, errors: Vec<ProgramError>) -> Vec<ProgramError> {
        info!(errors = errors.len(), "program failed to compile");
        self.program.lock().last_compile_errors = errors.clone();
        errors
    }

    /// Map a fault raised by `setup` (trigger block) or `run` back to the source.
    pub fn formatted_error(&self, fault: &ScriptFault, is_trigger_block: bool) -> ProgramError {
        let main_line_count = fragment_line_count(&self.program.lock().script_source);
        let template = self.env.template();
        let offsets = LineOffsets {
            main_offset: template.main_offset(),
            trigger_offset: template.trigger_offset(),
            main_line_count,
        };
        format_fault(fault, &self.env.config().entry_type, &offsets, is_trigger_block)
    }
}

impl<C: Compiler, L: UnitLoader, E: ProgramEvents> Drop for ProgramEngine<C, L, E> {
    fn drop(&mut self) {
        if !matches!(self.slot, Slot::Unloaded) {
            self.unload();
        }
    }
}
