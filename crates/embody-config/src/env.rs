//! `EMBODY_*` environment overrides.
//!
//! Environment variables win over every file layer. A value is coerced to
//! the type of the value it replaces; fields absent from the tree are set
//! as strings.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{ConfigError, ConfigResult};

/// Mapping from environment variable name to config field path.
struct EnvMapping {
    var_name: &'static str,
    field_path: &'static str,
}

const ENV_MAPPINGS: &[EnvMapping] = &[
    EnvMapping {
        var_name: "EMBODY_AGENT_ID",
        field_path: "service.agent_id",
    },
    EnvMapping {
        var_name: "EMBODY_KEY_PATH",
        field_path: "service.key_path",
    },
    EnvMapping {
        var_name: "EMBODY_CLOCK_SKEW_MS",
        field_path: "protocol.clock_skew_ms",
    },
    EnvMapping {
        var_name: "EMBODY_REPLAY_WINDOW_MS",
        field_path: "protocol.replay_window_ms",
    },
    EnvMapping {
        var_name: "EMBODY_REPLAY_CAPACITY",
        field_path: "protocol.replay_capacity",
    },
    EnvMapping {
        var_name: "EMBODY_VIOLATION_THRESHOLD",
        field_path: "sessions.violation_threshold",
    },
    EnvMapping {
        var_name: "EMBODY_SWEEP_INTERVAL_SECS",
        field_path: "sessions.sweep_interval_secs",
    },
    EnvMapping {
        var_name: "EMBODY_AUDIT_BACKEND",
        field_path: "audit.backend",
    },
    EnvMapping {
        var_name: "EMBODY_AUDIT_PATH",
        field_path: "audit.path",
    },
    EnvMapping {
        var_name: "EMBODY_LOG_LEVEL",
        field_path: "logging.level",
    },
    EnvMapping {
        var_name: "EMBODY_LOG_FORMAT",
        field_path: "logging.format",
    },
];

/// Snapshot the `EMBODY_*` variables of the current process.
#[must_use]
pub fn collect_env_vars() -> HashMap<String, String> {
    std::env::vars()
        .filter(|(k, _)| k.starts_with("EMBODY_"))
        .collect()
}

/// Apply every mapped variable present in `env_vars` to `merged`.
/// Returns the number applied.
///
/// # Errors
///
/// Returns [`ConfigError::EnvError`] when a value cannot be coerced to the
/// type of the field it overrides.
pub fn apply_env_overrides<S: ::std::hash::BuildHasher>(
    merged: &mut toml::Value,
    env_vars: &HashMap<String, String, S>,
) -> ConfigResult<usize> {
    let mut count: usize = 0;
    for mapping in ENV_MAPPINGS {
        let Some(raw) = env_vars.get(mapping.var_name) else {
            continue;
        };
        debug!(
            var = mapping.var_name,
            field = mapping.field_path,
            "applying env var override"
        );
        set_field(merged, mapping.field_path, raw).map_err(|message| ConfigError::EnvError {
            var_name: mapping.var_name.to_owned(),
            message,
        })?;
        count = count.saturating_add(1);
    }
    Ok(count)
}

/// Set a dotted field, creating intermediate tables.
fn set_field(root: &mut toml::Value, path: &str, raw: &str) -> Result<(), String> {
    let mut segments: Vec<&str> = path.split('.').collect();
    let Some(leaf) = segments.pop() else {
        return Err("empty field path".to_owned());
    };

    let mut current = root;
    for segment in segments {
        let toml::Value::Table(table) = current else {
            return Err(format!("'{segment}' is not a table"));
        };
        current = table
            .entry(segment.to_owned())
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
    }

    let toml::Value::Table(table) = current else {
        return Err(format!("parent of '{leaf}' is not a table"));
    };
    let value = coerce(table.get(leaf), raw)?;
    table.insert(leaf.to_owned(), value);
    Ok(())
}

fn coerce(existing: Option<&toml::Value>, raw: &str) -> Result<toml::Value, String> {
    match existing {
        Some(toml::Value::Integer(_)) => raw
            .trim()
            .parse::<i64>()
            .map(toml::Value::Integer)
            .map_err(|e| format!("expected an integer: {e}")),
        Some(toml::Value::Float(_)) => raw
            .trim()
            .parse::<f64>()
            .map(toml::Value::Float)
            .map_err(|e| format!("expected a number: {e}")),
        Some(toml::Value::Boolean(_)) => raw
            .trim()
            .parse::<bool>()
            .map(toml::Value::Boolean)
            .map_err(|e| format!("expected true or false: {e}")),
        _ => Ok(toml::Value::String(raw.to_owned())),
    }
}
