//! The per-action permission validator.
//!
//! Validation is a pure decision over a read-only view of the session; it
//! never touches counters, storage or logs. The session manager applies the
//! outcome (violation counting, usage accounting, audit) afterwards.

use embody_core::{SessionState, Timestamp};
use serde_json::Value;

use crate::error::{PermissionError, PermissionResult};
use crate::permission::Permission;
use crate::policy::{PathRules, ResourceUsage, SecurityPolicy};

/// Parameter keys treated as sandbox paths.
pub const PATH_KEYS: &[&str] = &[
    "path",
    "file_path",
    "directory",
    "source",
    "destination",
    "target",
];

/// Parameter keys treated as command lines.
pub const COMMAND_KEYS: &[&str] = &["command", "cmd"];

/// What the validator needs to know about a session.
#[derive(Debug, Clone, Copy)]
pub struct SessionView<'a> {
    /// Current lifecycle state.
    pub state: SessionState,
    /// Absolute expiry.
    pub expires_at: Timestamp,
    /// Permissions frozen at grant time.
    pub permissions: &'a [Permission],
    /// Policy snapshot frozen at grant time.
    pub policy: &'a SecurityPolicy,
    /// Path globs of `policy`, compiled once.
    pub paths: &'a PathRules,
    /// Usage accumulated so far.
    pub usage: ResourceUsage,
}

/// A tool call as seen by the validator.
#[derive(Debug, Clone, Copy)]
pub struct ToolAction<'a> {
    /// Requested tool name.
    pub tool: &'a str,
    /// Raw call parameters.
    pub parameters: &'a Value,
    /// Guest- or host-supplied estimate of the call's resource cost.
    pub estimated: ResourceUsage,
}

/// Validate one action. On success returns the projected resource usage
/// the caller should store if the call goes ahead.
///
/// Checks run in order and the first failure wins: session state, tool
/// permission, paths, commands, resources.
///
/// # Errors
///
/// Returns the [`PermissionError`] of the first failing check.
pub fn validate(
    session: &SessionView<'_>,
    action: &ToolAction<'_>,
    now: Timestamp,
) -> PermissionResult<ResourceUsage> {
    if session.state != SessionState::Active || now >= session.expires_at {
        let state = if session.state == SessionState::Active {
            SessionState::Expired
        } else {
            session.state
        };
        return Err(PermissionError::SessionInvalid { state });
    }

    if !session.permissions.iter().any(|p| p.covers(action.tool)) {
        return Err(PermissionError::ToolNotPermitted {
            tool: action.tool.to_string(),
        });
    }

    for raw in path_parameters(action.parameters)? {
        session.paths.check(raw)?;
    }

    for command in command_parameters(action.parameters)? {
        session.policy.check_command(&command)?;
    }

    let projected = session.usage.saturating_add(&action.estimated);
    projected.check_within(&session.policy.resource_limits)?;
    Ok(projected)
}

/// Collect every path-valued parameter. Arrays of strings are accepted;
/// any other non-string value under a path key is refused.
fn path_parameters(parameters: &Value) -> PermissionResult<Vec<&str>> {
    let Some(map) = parameters.as_object() else {
        return Ok(Vec::new());
    };

    let mut paths = Vec::new();
    for key in PATH_KEYS {
        match map.get(*key) {
            None | Some(Value::Null) => {},
            Some(Value::String(s)) => paths.push(s.as_str()),
            Some(Value::Array(items)) => {
                for item in items {
                    let Some(s) = item.as_str() else {
                        return Err(non_string_path(key));
                    };
                    paths.push(s);
                }
            },
            Some(_) => return Err(non_string_path(key)),
        }
    }
    Ok(paths)
}

fn non_string_path(key: &str) -> PermissionError {
    PermissionError::PathDenied {
        path: format!("<{key}>"),
        reason: "path parameter must be a string".to_string(),
    }
}

/// Every command-valued parameter, each joined with the `args` array when
/// present. A non-string command or argument is refused.
fn command_parameters(parameters: &Value) -> PermissionResult<Vec<String>> {
    let Some(map) = parameters.as_object() else {
        return Ok(Vec::new());
    };

    let mut commands = Vec::new();
    for key in COMMAND_KEYS {
        match map.get(*key) {
            None | Some(Value::Null) => {},
            Some(Value::String(command)) => commands.push(command.clone()),
            Some(_) => return Err(non_string_command(key)),
        }
    }
    if commands.is_empty() {
        return Ok(commands);
    }

    let args = match map.get("args") {
        None | Some(Value::Null) => return Ok(commands),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| item.as_str().ok_or_else(|| non_string_command("args")))
            .collect::<PermissionResult<Vec<&str>>>()?,
        Some(_) => return Err(non_string_command("args")),
    };
    if !args.is_empty() {
        let joined = args.join(" ");
        for command in &mut commands {
            command.push(' ');
            command.push_str(&joined);
        }
    }
    Ok(commands)
}

fn non_string_command(key: &str) -> PermissionError {
    PermissionError::CommandDenied {
        command: format!("<{key}>"),
        reason: "command parameter must be a string".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ResourceLimits;
    use serde_json::json;

    struct Fixture {
        permissions: Vec<Permission>,
        policy: SecurityPolicy,
        paths: PathRules,
        now: Timestamp,
    }

    impl Fixture {
        fn new() -> Self {
            let policy = SecurityPolicy {
                allowed_paths: vec!["/workspace/*".into()],
                denied_paths: vec!["/workspace/.git/*".into()],
                allowed_commands: vec!["git".into()],
                denied_commands: vec!["sudo".into()],
                resource_limits: ResourceLimits {
                    max_disk_write_mb: 10,
                    ..ResourceLimits::default()
                },
                session_timeout: 0,
            };
            Self {
                permissions: vec![
                    Permission::new("file.read", "/workspace/*"),
                    Permission::new("shell.execute", "git"),
                ],
                paths: policy.path_rules(),
                policy,
                now: Timestamp::from_millis(1_700_000_000_000),
            }
        }

        fn view(&self, state: SessionState) -> SessionView<'_> {
            SessionView {
                state,
                expires_at: self.now.plus_secs(60),
                permissions: &self.permissions,
                policy: &self.policy,
                paths: &self.paths,
                usage: ResourceUsage::default(),
            }
        }
    }

    fn action<'a>(tool: &'a str, parameters: &'a Value) -> ToolAction<'a> {
        ToolAction {
            tool,
            parameters,
            estimated: ResourceUsage::default(),
        }
    }

    #[test]
    fn test_allowed_file_read() {
        let f = Fixture::new();
        let params = json!({"path": "/workspace/readme.md"});
        assert!(validate(&f.view(SessionState::Active), &action("file.read", &params), f.now).is_ok());
    }

    #[test]
    fn test_inactive_or_expired_session() {
        let f = Fixture::new();
        let params = json!({});
        let err = validate(&f.view(SessionState::Revoked), &action("file.read", &params), f.now)
            .unwrap_err();
        assert_eq!(
            err,
            PermissionError::SessionInvalid {
                state: SessionState::Revoked
            }
        );

        let later = f.now.plus_secs(61);
        let err = validate(&f.view(SessionState::Active), &action("file.read", &params), later)
            .unwrap_err();
        assert_eq!(
            err,
            PermissionError::SessionInvalid {
                state: SessionState::Expired
            }
        );
    }

    #[test]
    fn test_tool_not_permitted_wins_over_path() {
        let f = Fixture::new();
        let params = json!({"path": "/etc/passwd"});
        let err = validate(&f.view(SessionState::Active), &action("file.write", &params), f.now)
            .unwrap_err();
        assert!(matches!(err, PermissionError::ToolNotPermitted { .. }));
    }

    #[test]
    fn test_traversal_in_any_path_key() {
        let f = Fixture::new();
        let params = json!({
            "source": "/workspace/a.txt",
            "destination": "/workspace/../etc/passwd",
        });
        let err = validate(&f.view(SessionState::Active), &action("file.read", &params), f.now)
            .unwrap_err();
        assert!(matches!(err, PermissionError::PathDenied { ref path, .. } if path == "/etc/passwd"));
    }

    #[test]
    fn test_path_arrays_and_bad_types() {
        let f = Fixture::new();
        let params = json!({"path": ["/workspace/a", "/workspace/.git/config"]});
        assert!(validate(&f.view(SessionState::Active), &action("file.read", &params), f.now).is_err());

        let params = json!({"path": 42});
        assert!(matches!(
            validate(&f.view(SessionState::Active), &action("file.read", &params), f.now),
            Err(PermissionError::PathDenied { .. })
        ));
    }

    #[test]
    fn test_command_with_args_array() {
        let f = Fixture::new();
        let params = json!({"command": "git", "args": ["status"]});
        assert!(validate(&f.view(SessionState::Active), &action("shell.execute", &params), f.now).is_ok());

        let params = json!({"cmd": "sudo rm -rf /"});
        assert!(matches!(
            validate(&f.view(SessionState::Active), &action("shell.execute", &params), f.now),
            Err(PermissionError::CommandDenied { .. })
        ));
    }

    #[test]
    fn test_every_command_key_is_checked() {
        let f = Fixture::new();
        let params = json!({"command": "git status", "cmd": "sudo rm -rf /"});
        assert!(matches!(
            validate(&f.view(SessionState::Active), &action("shell.execute", &params), f.now),
            Err(PermissionError::CommandDenied { ref command, .. }) if command == "sudo rm -rf /"
        ));

        let params = json!({"cmd": "git log", "command": "curl http://evil.example"});
        assert!(matches!(
            validate(&f.view(SessionState::Active), &action("shell.execute", &params), f.now),
            Err(PermissionError::CommandDenied { .. })
        ));
    }

    #[test]
    fn test_non_string_command_values_refused() {
        let f = Fixture::new();
        for params in [
            json!({"command": ["sudo", "reboot"]}),
            json!({"command": "git", "cmd": 7}),
            json!({"command": "git", "args": ["status", {"x": "; sudo reboot"}]}),
            json!({"command": "git", "args": "status; sudo reboot"}),
        ] {
            assert!(
                matches!(
                    validate(&f.view(SessionState::Active), &action("shell.execute", &params), f.now),
                    Err(PermissionError::CommandDenied { .. })
                ),
                "accepted {params}"
            );
        }
    }

    #[test]
    fn test_args_are_part_of_the_checked_command() {
        let f = Fixture::new();
        let params = json!({"command": "git", "args": ["status", "&&", "sudo", "reboot"]});
        assert!(matches!(
            validate(&f.view(SessionState::Active), &action("shell.execute", &params), f.now),
            Err(PermissionError::CommandDenied { .. })
        ));
    }

    #[test]
    fn test_args_ignored_without_a_command() {
        let f = Fixture::new();
        let params = json!({"path": "/workspace/a", "args": {"encoding": "utf8"}});
        assert!(validate(&f.view(SessionState::Active), &action("file.read", &params), f.now).is_ok());
    }

    #[test]
    fn test_projected_usage() {
        let f = Fixture::new();
        let params = json!({"path": "/workspace/out.bin"});
        let mut view = f.view(SessionState::Active);
        view.usage.disk_write_mb = 9;

        let mut act = action("file.read", &params);
        act.estimated.disk_write_mb = 1;
        let projected = validate(&view, &act, f.now).unwrap();
        assert_eq!(projected.disk_write_mb, 10);

        act.estimated.disk_write_mb = 2;
        assert!(matches!(
            validate(&view, &act, f.now),
            Err(PermissionError::ResourceLimitExceeded { .. })
        ));
    }
}
