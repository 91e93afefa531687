//! Side-effecting adapters: configuration, tools, storage and loading.

pub mod artifact_store;
pub mod compiler;
pub mod config;
pub mod environment;
pub mod loader;
pub mod process;
