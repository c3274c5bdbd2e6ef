//! Configuration system for the Tether session layer.
//!
//! Provides TOML-based configuration with:
//! - API endpoint settings (`[api]`), including runtime base-URL discovery
//! - Session timing (`[session]`, `[activity]`)
//! - Request policy (`[retry]`, `[cache]`)
//! - Durable storage location (`[storage]`)
//! - Config file layering (XDG user config + project-local overrides)

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{ConfigSource, LoadedConfig, load_config, save_config, user_config_path};
pub use error::{ConfigError, Result};
pub use types::*;
