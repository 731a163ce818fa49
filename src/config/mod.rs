//! Relay Configuration Module
//!
//! Provides the pipeline configuration loaded from TOML files, replacing
//! hardcoded batching, transport and retry constants with operator-tunable
//! values.
//!
//! ## Loading Order
//!
//! 1. `RELAY_CONFIG` environment variable (path to TOML file)
//! 2. `relay.toml` in the current working directory
//! 3. Built-in defaults (see [`defaults`])
//!
//! The loaded config is handed to `PipelineBuilder` and owned by the
//! pipeline; there is no process-wide config singleton.

mod relay_config;
pub mod defaults;

pub use relay_config::*;
