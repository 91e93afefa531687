//! Development-time tracing for the engine and its binary.
//!
//! Output goes to stderr and is controlled by `RUST_LOG`. Compile errors and
//! runtime faults reported to program authors travel as `ProgramError`
//! values, never through this channel.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber. Defaults to `warn` when `RUST_LOG` is unset.
///
/// # Example
/// ```bash
/// RUST_LOG=progengine=debug progengine run --address 7 --main main.script
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
