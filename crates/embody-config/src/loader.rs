//! Layered loading.
//!
//! 1. Parse the embedded `defaults.toml`
//! 2. Merge the config file (explicit path, or `~/.embody/config.toml` if
//!    it exists)
//! 3. Apply `EMBODY_*` environment overrides
//! 4. Deserialize and validate

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::env::{apply_env_overrides, collect_env_vars};
use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;
use crate::validate;

/// Embedded default configuration.
const DEFAULTS_TOML: &str = include_str!("defaults.toml");

/// Maximum allowed config file size (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1_048_576;

impl Config {
    /// Load with the process environment.
    ///
    /// An explicit `path` must exist; without one the user config file is
    /// used when present.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if a file is unreadable or malformed, an
    /// override cannot be coerced, or the result fails validation.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        load_with_env(path, &collect_env_vars())
    }

    /// Parse a TOML document layered over the defaults, without touching
    /// the filesystem or environment.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the document is malformed or invalid.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let overlay = parse(content, "<inline>")?;
        let mut merged = defaults()?;
        deep_merge(&mut merged, &overlay);
        finish(merged)
    }
}

/// Load with an explicit set of environment variables.
///
/// # Errors
///
/// Same as [`Config::load`].
pub fn load_with_env<S: ::std::hash::BuildHasher>(
    path: Option<&Path>,
    env_vars: &HashMap<String, String, S>,
) -> ConfigResult<Config> {
    let mut merged = defaults()?;

    let overlay = match path {
        Some(path) => Some((read_file(path)?, path.to_path_buf())),
        None => match default_config_path() {
            Some(user_path) => try_load_file(&user_path)?.map(|v| (v, user_path)),
            None => None,
        },
    };
    if let Some((overlay, path)) = overlay {
        deep_merge(&mut merged, &overlay);
        info!(path = %path.display(), "loaded config file");
    }

    let applied = apply_env_overrides(&mut merged, env_vars)?;
    if applied > 0 {
        debug!(count = applied, "applied environment overrides");
    }

    finish(merged)
}

/// `~/.embody/config.toml`, if a home directory is known.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|dirs| dirs.home_dir().join(".embody").join("config.toml"))
}

fn defaults() -> ConfigResult<toml::Value> {
    parse(DEFAULTS_TOML, "<embedded defaults>")
}

fn finish(merged: toml::Value) -> ConfigResult<Config> {
    let config: Config =
        merged
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::ParseError {
                path: "<merged config>".to_owned(),
                source: e,
            })?;
    validate::validate(&config)?;
    Ok(config)
}

fn parse(content: &str, origin: &str) -> ConfigResult<toml::Value> {
    toml::from_str(content).map_err(|e| ConfigError::ParseError {
        path: origin.to_owned(),
        source: e,
    })
}

fn read_file(path: &Path) -> ConfigResult<toml::Value> {
    try_load_file(path)?.ok_or_else(|| ConfigError::ReadError {
        path: path.display().to_string(),
        source: std::io::Error::from(std::io::ErrorKind::NotFound),
    })
}

/// Load a file, returning `None` if it doesn't exist.
fn try_load_file(path: &Path) -> ConfigResult<Option<toml::Value>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "config file not found, skipping");
            return Ok(None);
        },
        Err(e) => {
            return Err(ConfigError::ReadError {
                path: path.display().to_string(),
                source: e,
            });
        },
    };

    if content.len() as u64 > MAX_CONFIG_FILE_SIZE {
        return Err(ConfigError::ValidationError {
            field: path.display().to_string(),
            message: format!(
                "config file is {} bytes, exceeding the {MAX_CONFIG_FILE_SIZE} byte limit",
                content.len()
            ),
        });
    }

    parse(&content, &path.display().to_string()).map(Some)
}

/// Recursively merge `overlay` into `base`. Tables merge per field;
/// scalars and arrays replace.
fn deep_merge(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                if let Some(base_val) = base_table.get_mut(key) {
                    deep_merge(base_val, overlay_val);
                } else {
                    base_table.insert(key.clone(), overlay_val.clone());
                }
            }
        },
        (base, overlay) => {
            *base = overlay.clone();
        },
    }
}
