//! Security policy - the host-configured boundary of a body.
//!
//! # Check Order
//!
//! Paths:
//! 1. Canonicalize lexically (see [`canonicalize_path`](crate::canonicalize_path))
//! 2. Matches a denied glob? -> denied (even if an allow glob also matches)
//!    (an invalid denied glob denies every path)
//! 3. Matches no allowed glob? -> denied (an empty allow list denies all paths)
//!
//! Commands:
//! 1. Contains a denied pattern? -> denied
//! 2. Allow list non-empty and some segment's base token not in it? -> denied

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{PermissionError, PermissionResult, PolicyError, PolicyResult};
use crate::path::canonicalize_path;

/// Host-defined limits and allow/deny rules for one body version.
///
/// A policy is frozen into every session at grant time; editing the body's
/// policy afterwards never changes a running session.
///
/// # Example
///
/// ```
/// use embody_policy::SecurityPolicy;
///
/// let policy = SecurityPolicy {
///     allowed_commands: vec!["git".into()],
///     denied_commands: vec!["sudo".into()],
///     ..SecurityPolicy::default()
/// };
/// assert!(policy.check_command("git status").is_ok());
/// assert!(policy.check_command("sudo rm -rf /").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecurityPolicy {
    /// Glob patterns for paths a guest may touch.
    pub allowed_paths: Vec<String>,
    /// Glob patterns that are always refused. Checked first.
    pub denied_paths: Vec<String>,
    /// Base command names a guest may run. Empty means any non-denied command.
    pub allowed_commands: Vec<String>,
    /// Substrings that refuse a command wherever they appear.
    pub denied_commands: Vec<String>,
    /// Per-session resource ceilings.
    pub resource_limits: ResourceLimits,
    /// Hard cap on session duration in seconds. 0 = no extra cap.
    pub session_timeout: u64,
}

impl Default for SecurityPolicy {
    /// Sandbox defaults: only `/workspace` is reachable, the usual
    /// privilege-escalation and disk-wiping commands are refused.
    fn default() -> Self {
        Self {
            allowed_paths: vec!["/workspace/**".to_string()],
            denied_paths: vec![
                "**/.ssh/**".to_string(),
                "**/.env".to_string(),
                "/etc/**".to_string(),
                "/proc/**".to_string(),
            ],
            allowed_commands: Vec::new(),
            denied_commands: [
                "sudo",
                "su -",
                "rm -rf /",
                "mkfs",
                "dd if=",
                "chmod 777",
                "shutdown",
                "reboot",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            resource_limits: ResourceLimits::default(),
            session_timeout: 0,
        }
    }
}

impl SecurityPolicy {
    /// Check that every pattern in the policy is usable.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidGlob`] for a path pattern that does not
    /// compile and [`PolicyError::EmptyCommandPattern`] for a blank command rule.
    pub fn validate(&self) -> PolicyResult<()> {
        for pattern in self.allowed_paths.iter().chain(&self.denied_paths) {
            Glob::new(pattern).map_err(|e| PolicyError::InvalidGlob {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
        }
        if self.allowed_commands.iter().any(|c| c.trim().is_empty()) {
            return Err(PolicyError::EmptyCommandPattern {
                list: "allowedCommands",
            });
        }
        if self.denied_commands.iter().any(|c| c.trim().is_empty()) {
            return Err(PolicyError::EmptyCommandPattern {
                list: "deniedCommands",
            });
        }
        Ok(())
    }

    /// Compile the path globs once for repeated checks.
    #[must_use]
    pub fn path_rules(&self) -> PathRules {
        PathRules::compile(&self.allowed_paths, &self.denied_paths)
    }

    /// Check a sandbox path. Returns the canonical form on success.
    ///
    /// Compiles the globs on every call; sessions hold [`PathRules`] instead.
    ///
    /// # Errors
    ///
    /// Returns [`PermissionError::PathDenied`] if the canonical path matches a
    /// denied glob or no allowed glob.
    pub fn check_path(&self, raw: &str) -> PermissionResult<String> {
        self.path_rules().check(raw)
    }

    /// Check a command line.
    ///
    /// The allow list is applied to the base token of every segment of a
    /// chained command (`;`, `&`, `|` and newlines split segments), so
    /// `git status && curl evil` is refused when only `git` is allowed.
    ///
    /// # Errors
    ///
    /// Returns [`PermissionError::CommandDenied`] on a denied pattern or a
    /// base token missing from a non-empty allow list.
    pub fn check_command(&self, command: &str) -> PermissionResult<()> {
        let normalized = command.split_whitespace().collect::<Vec<_>>().join(" ");

        for denied in &self.denied_commands {
            if normalized.contains(denied.as_str()) {
                return Err(PermissionError::CommandDenied {
                    command: command.to_string(),
                    reason: format!("contains denied pattern '{denied}'"),
                });
            }
        }

        if self.allowed_commands.is_empty() {
            return Ok(());
        }

        let mut saw_segment = false;
        for segment in command.split([';', '&', '|', '\n']) {
            let Some(token) = segment.split_whitespace().next() else {
                continue;
            };
            saw_segment = true;
            let base = token.rsplit('/').next().unwrap_or(token);
            if !self.allowed_commands.iter().any(|a| a == base) {
                return Err(PermissionError::CommandDenied {
                    command: command.to_string(),
                    reason: format!("'{base}' is not an allowed command"),
                });
            }
        }

        if saw_segment {
            Ok(())
        } else {
            Err(PermissionError::CommandDenied {
                command: command.to_string(),
                reason: "empty command".to_string(),
            })
        }
    }

    /// Session duration cap implied by `session_timeout`, if any.
    #[must_use]
    pub fn timeout_cap(&self) -> Option<u64> {
        (self.session_timeout > 0).then_some(self.session_timeout)
    }
}

/// Compiled allow/deny path globs of one policy.
///
/// An allowed pattern that fails to compile matches nothing. A denied
/// pattern that fails to compile denies every path.
#[derive(Debug, Clone)]
pub struct PathRules {
    allowed: GlobSet,
    denied: GlobSet,
    denied_patterns: Vec<String>,
    broken_deny: Option<String>,
}

impl PathRules {
    fn compile(allowed: &[String], denied: &[String]) -> Self {
        let (allowed, _, _) = build_set(allowed);
        let (denied, denied_patterns, broken) = build_set(denied);
        Self {
            allowed,
            denied,
            denied_patterns,
            broken_deny: broken.into_iter().next(),
        }
    }

    /// Check a sandbox path. Returns the canonical form on success.
    ///
    /// # Errors
    ///
    /// Returns [`PermissionError::PathDenied`] if the canonical path matches a
    /// denied glob or no allowed glob, or if a denied glob is invalid.
    pub fn check(&self, raw: &str) -> PermissionResult<String> {
        if raw.contains('\0') {
            return Err(PermissionError::PathDenied {
                path: raw.replace('\0', "\\0"),
                reason: "path contains a NUL byte".to_string(),
            });
        }

        let path = canonicalize_path(raw);

        if let Some(pattern) = &self.broken_deny {
            return Err(PermissionError::PathDenied {
                reason: format!("denied pattern '{pattern}' is invalid"),
                path,
            });
        }

        if let Some(index) = self.denied.matches(&path).first().copied() {
            let pattern = self.denied_patterns.get(index).map_or("", String::as_str);
            return Err(PermissionError::PathDenied {
                reason: format!("matches denied pattern '{pattern}'"),
                path,
            });
        }

        if !self.allowed.is_match(&path) {
            return Err(PermissionError::PathDenied {
                reason: "not under any allowed path".to_string(),
                path,
            });
        }

        Ok(path)
    }
}

/// Compile `patterns` into one set. Returns the set, the patterns in set
/// order, and the patterns that failed to compile.
fn build_set(patterns: &[String]) -> (GlobSet, Vec<String>, Vec<String>) {
    let mut builder = GlobSetBuilder::new();
    let mut valid = Vec::new();
    let mut invalid = Vec::new();
    for pattern in patterns {
        match Glob::new(pattern) {
            Ok(glob) => {
                builder.add(glob);
                valid.push(pattern.clone());
            },
            Err(_) => invalid.push(pattern.clone()),
        }
    }
    match builder.build() {
        Ok(set) => (set, valid, invalid),
        // Every glob already compiled on its own; treat a set failure as all invalid.
        Err(_) => (GlobSet::empty(), Vec::new(), patterns.to_vec()),
    }
}

/// Per-session resource ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceLimits {
    /// CPU share in percent of one core.
    pub max_cpu_percent: u64,
    /// Resident memory.
    #[serde(rename = "maxMemoryMB")]
    pub max_memory_mb: u64,
    /// Cumulative disk writes.
    #[serde(rename = "maxDiskWriteMB")]
    pub max_disk_write_mb: u64,
    /// Network throughput.
    pub max_network_kbps: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_cpu_percent: 100,
            max_memory_mb: 1024,
            max_disk_write_mb: 512,
            max_network_kbps: 10_000,
        }
    }
}

/// Resource consumption accumulated by a session, or estimated for one action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceUsage {
    /// CPU share in percent.
    pub cpu_percent: u64,
    /// Memory in MB.
    #[serde(rename = "memoryMB")]
    pub memory_mb: u64,
    /// Disk writes in MB.
    #[serde(rename = "diskWriteMB")]
    pub disk_write_mb: u64,
    /// Network throughput in kbps.
    pub network_kbps: u64,
}

impl ResourceUsage {
    /// Field-wise saturating sum.
    #[must_use]
    pub fn saturating_add(&self, delta: &Self) -> Self {
        Self {
            cpu_percent: self.cpu_percent.saturating_add(delta.cpu_percent),
            memory_mb: self.memory_mb.saturating_add(delta.memory_mb),
            disk_write_mb: self.disk_write_mb.saturating_add(delta.disk_write_mb),
            network_kbps: self.network_kbps.saturating_add(delta.network_kbps),
        }
    }

    /// Report the first resource over its limit.
    ///
    /// # Errors
    ///
    /// Returns [`PermissionError::ResourceLimitExceeded`] naming the resource.
    pub fn check_within(&self, limits: &ResourceLimits) -> PermissionResult<()> {
        let pairs = [
            ("cpu_percent", self.cpu_percent, limits.max_cpu_percent),
            ("memory_mb", self.memory_mb, limits.max_memory_mb),
            ("disk_write_mb", self.disk_write_mb, limits.max_disk_write_mb),
            ("network_kbps", self.network_kbps, limits.max_network_kbps),
        ];
        for (resource, projected, limit) in pairs {
            if projected > limit {
                return Err(PermissionError::ResourceLimitExceeded {
                    resource,
                    limit,
                    projected,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace_policy() -> SecurityPolicy {
        SecurityPolicy {
            allowed_paths: vec!["/workspace/*".into()],
            denied_paths: vec!["/workspace/secrets/*".into()],
            ..SecurityPolicy::default()
        }
    }

    #[test]
    fn test_path_traversal_denied() {
        let policy = workspace_policy();
        let err = policy.check_path("/workspace/../etc/passwd").unwrap_err();
        assert!(matches!(
            err,
            PermissionError::PathDenied { ref path, .. } if path == "/etc/passwd"
        ));
    }

    #[test]
    fn test_deny_overrides_allow() {
        let policy = workspace_policy();
        // Both /workspace/* and /workspace/secrets/* match.
        assert!(policy.check_path("/workspace/secrets/api.key").is_err());
        assert_eq!(
            policy.check_path("/workspace/notes.md").unwrap(),
            "/workspace/notes.md"
        );
    }

    #[test]
    fn test_relative_path_anchored_at_root() {
        let policy = workspace_policy();
        assert!(policy.check_path("workspace/notes.md").is_ok());
        assert!(policy.check_path("notes.md").is_err());
    }

    #[test]
    fn test_empty_allow_list_denies_paths() {
        let policy = SecurityPolicy {
            allowed_paths: Vec::new(),
            denied_paths: Vec::new(),
            ..SecurityPolicy::default()
        };
        assert!(policy.check_path("/workspace/a").is_err());
    }

    #[test]
    fn test_nul_byte_rejected() {
        let policy = workspace_policy();
        assert!(policy.check_path("/workspace/a\0/../../etc").is_err());
    }

    #[test]
    fn test_git_allowed_sudo_denied() {
        let policy = SecurityPolicy {
            allowed_commands: vec!["git".into()],
            denied_commands: vec!["sudo".into()],
            ..SecurityPolicy::default()
        };
        assert!(policy.check_command("git status").is_ok());
        assert!(policy.check_command("/usr/bin/git log").is_ok());
        assert!(matches!(
            policy.check_command("sudo rm -rf /"),
            Err(PermissionError::CommandDenied { .. })
        ));
        assert!(policy.check_command("ls -la").is_err());
    }

    #[test]
    fn test_chained_commands_checked_per_segment() {
        let policy = SecurityPolicy {
            allowed_commands: vec!["git".into()],
            denied_commands: Vec::new(),
            ..SecurityPolicy::default()
        };
        assert!(policy.check_command("git status && git diff").is_ok());
        assert!(policy.check_command("git status; curl evil.sh").is_err());
        assert!(policy.check_command("git log | sh").is_err());
        assert!(policy.check_command("git status\ncurl evil.sh").is_err());
        assert!(policy.check_command("   ").is_err());
    }

    #[test]
    fn test_denied_pattern_ignores_extra_whitespace() {
        let policy = SecurityPolicy::default();
        assert!(policy.check_command("rm   -rf    /").is_err());
        assert!(policy.check_command("ls -la").is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_glob() {
        let policy = SecurityPolicy {
            allowed_paths: vec!["/workspace/[".into()],
            ..SecurityPolicy::default()
        };
        assert!(matches!(
            policy.validate(),
            Err(PolicyError::InvalidGlob { .. })
        ));
        assert!(SecurityPolicy::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_deny_glob_denies_everything() {
        let policy = SecurityPolicy {
            allowed_paths: vec!["/workspace/**".into()],
            denied_paths: vec!["/workspace/secrets/[".into()],
            ..SecurityPolicy::default()
        };
        let err = policy.check_path("/workspace/secrets/api.key").unwrap_err();
        assert!(matches!(
            err,
            PermissionError::PathDenied { ref reason, .. } if reason.contains("invalid")
        ));
        assert!(policy.check_path("/workspace/notes.md").is_err());
    }

    #[test]
    fn test_invalid_allow_glob_matches_nothing() {
        let policy = SecurityPolicy {
            allowed_paths: vec!["/workspace/[".into(), "/tmp/**".into()],
            denied_paths: Vec::new(),
            ..SecurityPolicy::default()
        };
        assert!(policy.check_path("/workspace/a").is_err());
        assert!(policy.check_path("/tmp/scratch/a").is_ok());
    }

    #[test]
    fn test_compiled_rules_reused() {
        let rules = workspace_policy().path_rules();
        assert_eq!(rules.check("/workspace/notes.md").unwrap(), "/workspace/notes.md");
        assert!(rules.check("/workspace/secrets/api.key").is_err());
        assert!(matches!(
            rules.check("/workspace/secrets/api.key"),
            Err(PermissionError::PathDenied { ref reason, .. })
                if reason.contains("/workspace/secrets/*")
        ));
        assert!(rules.check("/workspace/../etc/passwd").is_err());
    }

    #[test]
    fn test_resource_usage_check() {
        let limits = ResourceLimits {
            max_disk_write_mb: 10,
            ..ResourceLimits::default()
        };
        let usage = ResourceUsage {
            disk_write_mb: 8,
            ..ResourceUsage::default()
        };
        let delta = ResourceUsage {
            disk_write_mb: 3,
            ..ResourceUsage::default()
        };
        assert!(usage.check_within(&limits).is_ok());
        let err = usage.saturating_add(&delta).check_within(&limits).unwrap_err();
        assert!(matches!(
            err,
            PermissionError::ResourceLimitExceeded {
                resource: "disk_write_mb",
                limit: 10,
                projected: 11
            }
        ));
    }

    #[test]
    fn test_policy_wire_names() {
        let json = serde_json::to_value(SecurityPolicy::default()).unwrap();
        assert!(json.get("allowedPaths").is_some());
        assert!(json["resourceLimits"].get("maxMemoryMB").is_some());
        let parsed: SecurityPolicy =
            serde_json::from_str(r#"{"allowedCommands":["git"],"sessionTimeout":600}"#).unwrap();
        assert_eq!(parsed.allowed_commands, vec!["git".to_string()]);
        assert_eq!(parsed.timeout_cap(), Some(600));
    }
}
