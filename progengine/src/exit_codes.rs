//! Stable exit codes for `progengine` commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid input, configuration, or an engine failure unrelated to the program.
pub const INVALID: i32 = 1;
/// `compile` reported at least one error.
pub const COMPILE_FAILED: i32 = 2;
/// The program raised a fault during `setup` or `run`.
pub const RUNTIME_FAULT: i32 = 3;
/// The program could not be loaded or bound, so nothing executed.
pub const NOT_EXECUTED: i32 = 4;
