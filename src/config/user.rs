//! User configuration location.
//!
//! User config location: $XDG_CONFIG_HOME/dapwire/dapwire.toml
//! Fallback: the platform config directory (`dirs::config_dir`).

use std::path::PathBuf;

pub const CONFIG_DIR_NAME: &str = "dapwire";
pub const CONFIG_FILE_NAME: &str = "dapwire.toml";

/// Returns the path to the user configuration file.
///
/// The path is determined by:
/// 1. If $XDG_CONFIG_HOME is set and non-empty: $XDG_CONFIG_HOME/dapwire/dapwire.toml
/// 2. Otherwise: `<platform config dir>/dapwire/dapwire.toml`
///
/// Returns None if no config directory can be determined.
pub fn user_config_path() -> Option<PathBuf> {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .or_else(dirs::config_dir)?;
    Some(base.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}
