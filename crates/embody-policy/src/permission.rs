//! Granted permissions in `tool:constraint` form.

use embody_core::CapabilityPattern;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One entry of a session's frozen permission list, e.g.
/// `file.read:/workspace/*` or `shell.execute:git`.
///
/// The tool half may be a wildcard pattern. The constraint records the
/// policy scope the tool was paired with at grant time; enforcement of that
/// scope happens through the session's policy snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Permission {
    tool: CapabilityPattern,
    constraint: String,
}

impl Permission {
    /// Build a permission from its parts.
    #[must_use]
    pub fn new(tool: impl Into<CapabilityPattern>, constraint: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            constraint: constraint.into(),
        }
    }

    /// Parse `tool:constraint`. The split happens at the first `:`, so
    /// constraints may contain colons. A bare tool name means `tool:*`.
    ///
    /// # Errors
    ///
    /// Returns a message if the tool half is empty.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let (tool, constraint) = raw.split_once(':').unwrap_or((raw, "*"));
        if tool.is_empty() {
            return Err(format!("permission '{raw}' has an empty tool name"));
        }
        Ok(Self::new(tool, constraint))
    }

    /// The tool pattern.
    #[must_use]
    pub fn tool(&self) -> &CapabilityPattern {
        &self.tool
    }

    /// The scope recorded at grant time.
    #[must_use]
    pub fn constraint(&self) -> &str {
        &self.constraint
    }

    /// Whether this permission covers a tool name.
    #[must_use]
    pub fn covers(&self, tool: &str) -> bool {
        self.tool.matches(tool)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tool, self.constraint)
    }
}

impl TryFrom<String> for Permission {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<Permission> for String {
    fn from(p: Permission) -> Self {
        p.to_string()
    }
}
