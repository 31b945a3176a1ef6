//! Configuration for the node agent.
//!
//! A [`NodeConfig`] is the typed aggregate threaded through constructors;
//! there are no configuration globals. [`ConfigFile`] persists it as an
//! INI file at `~/.nodewarden/config.ini`, falling back to defaults when
//! the file is missing.

mod file;
mod settings;

pub use file::{config_directory, config_file_path, ConfigFile, ConfigFileError};
pub use settings::{
    NodeConfig, DEFAULT_BIND_ADDRESS, DEFAULT_CACHE_TARGET_BYTES, DEFAULT_KILL_FORCE_MILLIS,
    DEFAULT_KILL_GRACE_MILLIS, DEFAULT_LOCAL_DIR,
};
