//! Configuration management for the sandboxd server
//!
//! Configuration is read once at startup from TOML; every section
//! falls back to defaults when absent.

mod defaults;
mod loader;
mod schema;

pub use defaults::DEFAULT_CONFIG_TOML;
pub use loader::ConfigLoader;
pub use schema::*;
