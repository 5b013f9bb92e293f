//! Post-merge configuration validation.
//!
//! Validates that deserialized [`Config`](crate::Config) values are within
//! acceptable ranges and that cross-field invariants hold.

use crate::error::{ConfigError, ConfigResult};
use crate::types::{AuditBackend, Config};

/// Upper bound on the accepted clock skew (one hour).
const MAX_CLOCK_SKEW_MS: u64 = 3_600_000;

/// Validate a fully-merged and deserialized configuration.
///
/// # Errors
///
/// Returns the first validation error found.
pub fn validate(config: &Config) -> ConfigResult<()> {
    validate_service(config)?;
    validate_protocol(config)?;
    validate_sessions(config)?;
    validate_discovery(config)?;
    validate_audit(config)?;
    validate_logging(config)?;
    Ok(())
}

fn validate_service(config: &Config) -> ConfigResult<()> {
    let id = config.service.agent_id.trim();
    if id.is_empty() {
        return Err(ConfigError::invalid("service.agent_id", "must not be empty"));
    }
    if id.len() > 256 {
        return Err(ConfigError::invalid(
            "service.agent_id",
            "must be at most 256 bytes",
        ));
    }
    Ok(())
}

fn validate_protocol(config: &Config) -> ConfigResult<()> {
    let p = &config.protocol;
    if p.clock_skew_ms == 0 || p.clock_skew_ms > MAX_CLOCK_SKEW_MS {
        return Err(ConfigError::invalid(
            "protocol.clock_skew_ms",
            format!("{} is out of range 1..={MAX_CLOCK_SKEW_MS}", p.clock_skew_ms),
        ));
    }
    if p.replay_window_ms < p.clock_skew_ms {
        return Err(ConfigError::invalid(
            "protocol.replay_window_ms",
            format!(
                "{} is shorter than clock_skew_ms ({}); replays inside the skew window would be accepted",
                p.replay_window_ms, p.clock_skew_ms
            ),
        ));
    }
    if p.replay_capacity == 0 {
        return Err(ConfigError::invalid(
            "protocol.replay_capacity",
            "must be at least 1",
        ));
    }
    if p.max_envelope_bytes < 1024 {
        return Err(ConfigError::invalid(
            "protocol.max_envelope_bytes",
            "must be at least 1024",
        ));
    }
    Ok(())
}

fn validate_sessions(config: &Config) -> ConfigResult<()> {
    let s = &config.sessions;
    if s.sweep_interval_secs == 0 {
        return Err(ConfigError::invalid(
            "sessions.sweep_interval_secs",
            "must be at least 1",
        ));
    }
    if s.pending_ttl_secs == 0 {
        return Err(ConfigError::invalid(
            "sessions.pending_ttl_secs",
            "must be at least 1",
        ));
    }
    Ok(())
}

fn validate_discovery(config: &Config) -> ConfigResult<()> {
    let d = &config.discovery;
    if d.default_results == 0 {
        return Err(ConfigError::invalid(
            "discovery.default_results",
            "must be at least 1",
        ));
    }
    if d.max_results < d.default_results {
        return Err(ConfigError::invalid(
            "discovery.max_results",
            format!(
                "{} is below default_results ({})",
                d.max_results, d.default_results
            ),
        ));
    }
    Ok(())
}

fn validate_audit(config: &Config) -> ConfigResult<()> {
    let a = &config.audit;
    if a.backend == AuditBackend::Jsonl && a.path.is_none() {
        return Err(ConfigError::invalid(
            "audit.path",
            "required when backend is \"jsonl\"",
        ));
    }
    if a.preview_len == 0 {
        return Err(ConfigError::invalid("audit.preview_len", "must be at least 1"));
    }
    Ok(())
}

fn validate_logging(config: &Config) -> ConfigResult<()> {
    let l = &config.logging;
    if !matches!(
        l.level.to_ascii_lowercase().as_str(),
        "trace" | "debug" | "info" | "warn" | "error"
    ) {
        return Err(ConfigError::invalid(
            "logging.level",
            format!(
                "unsupported level '{}'; expected one of: trace, debug, info, warn, error",
                l.level
            ),
        ));
    }
    if !matches!(l.format.as_str(), "pretty" | "compact" | "json" | "full") {
        return Err(ConfigError::invalid(
            "logging.format",
            format!(
                "unsupported format '{}'; expected one of: pretty, compact, json, full",
                l.format
            ),
        ));
    }
    match l.target.as_str() {
        "stdout" | "stderr" => {},
        "file" if l.directory.is_some() => {},
        "file" => {
            return Err(ConfigError::invalid(
                "logging.directory",
                "required when target is \"file\"",
            ));
        },
        other => {
            return Err(ConfigError::invalid(
                "logging.target",
                format!("unsupported target '{other}'; expected one of: stdout, stderr, file"),
            ));
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_defaults_are_valid() {
        validate(&Config::default()).unwrap();
    }

    #[test]
    fn test_replay_window_must_cover_skew() {
        let mut config = Config::default();
        config.protocol.replay_window_ms = 1_000;
        let err = validate(&config).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::ValidationError { ref field, .. } if field == "protocol.replay_window_ms"
        ));
    }

    #[test]
    fn test_jsonl_backend_needs_path() {
        let mut config = Config::default();
        config.audit.backend = AuditBackend::Jsonl;
        assert!(validate(&config).is_err());
        config.audit.path = Some(PathBuf::from("/var/lib/embody/audit.jsonl"));
        validate(&config).unwrap();
    }

    #[test]
    fn test_logging_choices() {
        let mut config = Config::default();
        config.logging.format = "xml".into();
        assert!(validate(&config).is_err());

        let mut config = Config::default();
        config.logging.target = "file".into();
        assert!(validate(&config).is_err());
        config.logging.directory = Some(PathBuf::from("/var/log/embody"));
        validate(&config).unwrap();
    }
}
