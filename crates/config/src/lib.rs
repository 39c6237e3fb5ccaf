//! Configuration for a ferry server: schema, file loading and startup
//! validation.

pub mod duration;
pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    loader::{config_dir, find_config_file, find_config_file_in, load_config, to_toml},
    schema::{RegistryConfig, ServerConfig, SessionConfig},
    validate::ConfigError,
};
