//! Derivation of a session's permission list from its body.

use embody_discovery::{BodyDefinition, ToolKind};
use embody_policy::Permission;

/// Wildcard constraint.
const ANY: &str = "*";

/// Derive the `tool:constraint` list frozen into a new session.
///
/// File tools are paired with every allowed path and command tools with
/// every allowed command; anything else gets `tool:*`. A file tool on a
/// body with no allowed paths gets no permission at all. A command tool
/// with an empty allow-list gets `tool:*`, leaving the deny-list as the
/// only command filter.
#[must_use]
pub fn generate_permissions(body: &BodyDefinition) -> Vec<Permission> {
    let policy = &body.security_policy;
    let mut permissions = Vec::new();

    for tool in &body.tools {
        match tool.kind {
            ToolKind::File => {
                permissions.extend(
                    policy
                        .allowed_paths
                        .iter()
                        .map(|path| Permission::new(tool.name.as_str(), path.as_str())),
                );
            },
            ToolKind::Command if !policy.allowed_commands.is_empty() => {
                permissions.extend(
                    policy
                        .allowed_commands
                        .iter()
                        .map(|cmd| Permission::new(tool.name.as_str(), cmd.as_str())),
                );
            },
            ToolKind::Command | ToolKind::General => {
                permissions.push(Permission::new(tool.name.as_str(), ANY));
            },
        }
    }

    permissions
}
