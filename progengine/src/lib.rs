//! Compile, load and drive automation programs.
//!
//! A program is authored as two fragments: a main body and an optional
//! trigger condition. The engine wraps both in a fixed template, compiles the
//! result with an external compiler, commits the artifact atomically, loads it
//! into an isolated execution context and drives its `setup`/`run`/`reset`
//! lifecycle. Compile diagnostics and runtime faults are mapped back to lines
//! of the fragment they came from.
//!
//! - **[`core`]**: Pure, deterministic logic (composition, line mapping).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (config, compiler process, artifact
//!   storage, unit loading). Behind traits so tests can script them.
//!
//! [`engine`] coordinates both to implement the program-level contract.

pub mod contexts;
pub mod core;
pub mod engine;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod program;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
