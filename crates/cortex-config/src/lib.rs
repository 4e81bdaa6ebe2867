//! Configuration system for the cortex knowledge store.
//!
//! Provides TOML-based configuration with:
//! - `[brain]` store settings (database path, write retries, working memory size)
//! - `[embedding]` collaborator settings (model tag, vector dimensions)
//! - `[search]` unified search weights and recency half-life
//! - `[links]` causal-link creation policy for new atoms
//!
//! Config files are layered (user config dir, then project-local `cortex.toml`);
//! later layers replace whole sections of earlier ones.

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    ConfigSource, LoadedConfig, data_dir, load_config, load_config_file,
    load_config_with_options, resolve_database_path, save_config, user_config_dir,
    user_config_path,
};
pub use error::{ConfigError, Result};
pub use types::*;
