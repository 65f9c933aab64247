//! Configuration loading.
//!
//! Settings are resolved from the first source that exists:
//! 1. an explicit path (`--config`)
//! 2. the user config file (see [`user_config_path`])
//! 3. built-in defaults
//!
//! An explicit path that does not exist is an error; a missing user config
//! is not.

mod settings;
mod shutdown_grace;
mod user;

pub use settings::EngineSettings;
pub use shutdown_grace::ShutdownGrace;
pub use user::{CONFIG_DIR_NAME, CONFIG_FILE_NAME, user_config_path};

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to parse settings: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Settings together with the file they came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedSettings {
    pub settings: EngineSettings,
    /// `None` when built-in defaults were used.
    pub source: Option<PathBuf>,
}

/// Read and validate a settings file.
pub fn load_settings_file(path: &Path) -> ConfigResult<EngineSettings> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    EngineSettings::from_toml(&text).map_err(|err| match err {
        ConfigError::Toml(source) => ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        },
        other => other,
    })
}

/// Resolve settings following the documented precedence.
pub fn load_settings(explicit: Option<&Path>) -> ConfigResult<LoadedSettings> {
    if let Some(path) = explicit {
        let settings = load_settings_file(path)?;
        return Ok(LoadedSettings {
            settings,
            source: Some(path.to_path_buf()),
        });
    }

    if let Some(path) = user_config_path()
        && path.is_file()
    {
        let settings = load_settings_file(&path)?;
        return Ok(LoadedSettings {
            settings,
            source: Some(path),
        });
    }

    Ok(LoadedSettings {
        settings: EngineSettings::default(),
        source: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn explicit_path_is_loaded() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let path = dir.path().join("custom.toml");
        fs::write(&path, "concurrency = 2\n").expect("failed to write config");

        let loaded = load_settings(Some(&path)).unwrap();
        assert_eq!(loaded.settings.concurrency, Some(2));
        assert_eq!(loaded.source.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn missing_explicit_path_is_an_error() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let err = load_settings(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn parse_errors_name_the_file() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let path = dir.path().join("broken.toml");
        fs::write(&path, "concurrency = [").expect("failed to write config");

        let err = load_settings_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("broken.toml"));
    }

    #[test]
    #[serial(xdg_env)]
    fn user_config_is_used_when_present() {
        let original = env::var_os("XDG_CONFIG_HOME");
        let dir = TempDir::new().expect("failed to create temp dir");
        let config_dir = dir.path().join(CONFIG_DIR_NAME);
        fs::create_dir_all(&config_dir).expect("failed to create config dir");
        fs::write(config_dir.join(CONFIG_FILE_NAME), "supersede_serial = false\n")
            .expect("failed to write config");

        // SAFETY: #[serial(xdg_env)] prevents concurrent modification of XDG_CONFIG_HOME
        unsafe {
            env::set_var("XDG_CONFIG_HOME", dir.path());
        }
        let loaded = load_settings(None);
        // SAFETY: Same as above - restoring original env state
        unsafe {
            match original {
                Some(val) => env::set_var("XDG_CONFIG_HOME", val),
                None => env::remove_var("XDG_CONFIG_HOME"),
            }
        }

        let loaded = loaded.unwrap();
        assert!(!loaded.settings.supersede_serial);
        assert!(loaded.source.is_some());
    }

    #[test]
    #[serial(xdg_env)]
    fn defaults_when_no_user_config() {
        let original = env::var_os("XDG_CONFIG_HOME");
        let dir = TempDir::new().expect("failed to create temp dir");

        // SAFETY: #[serial(xdg_env)] prevents concurrent modification of XDG_CONFIG_HOME
        unsafe {
            env::set_var("XDG_CONFIG_HOME", dir.path());
        }
        let loaded = load_settings(None);
        // SAFETY: Same as above - restoring original env state
        unsafe {
            match original {
                Some(val) => env::set_var("XDG_CONFIG_HOME", val),
                None => env::remove_var("XDG_CONFIG_HOME"),
            }
        }

        let loaded = loaded.unwrap();
        assert_eq!(loaded.settings, EngineSettings::default());
        assert!(loaded.source.is_none());
    }
}
