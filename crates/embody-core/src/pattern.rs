//! Capability patterns.
//!
//! A pattern is either an exact tool name (`file.read`) or a trailing
//! wildcard prefix (`file.*`, `*`). Matching is case-sensitive and purely
//! string-prefix based; there is no regex or glob syntax here.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A capability pattern used in discovery queries and granted permissions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CapabilityPattern {
    /// Matches exactly one tool name.
    Exact(String),
    /// Matches every tool name starting with the prefix (`""` matches all).
    Prefix(String),
}

impl CapabilityPattern {
    /// Parse a pattern. A trailing `*` turns the rest into a prefix.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.strip_suffix('*') {
            Some(prefix) => Self::Prefix(prefix.to_string()),
            None => Self::Exact(raw.to_string()),
        }
    }

    /// The pattern that matches every tool.
    #[must_use]
    pub fn any() -> Self {
        Self::Prefix(String::new())
    }

    /// Check whether a tool name matches.
    #[must_use]
    pub fn matches(&self, tool: &str) -> bool {
        match self {
            Self::Exact(name) => name == tool,
            Self::Prefix(prefix) => tool.starts_with(prefix.as_str()),
        }
    }

    /// Check whether this is the match-everything pattern.
    #[must_use]
    pub fn is_any(&self) -> bool {
        matches!(self, Self::Prefix(p) if p.is_empty())
    }
}

impl fmt::Display for CapabilityPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(name) => f.write_str(name),
            Self::Prefix(prefix) => write!(f, "{prefix}*"),
        }
    }
}

impl From<String> for CapabilityPattern {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<&str> for CapabilityPattern {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

impl From<CapabilityPattern> for String {
    fn from(pattern: CapabilityPattern) -> Self {
        pattern.to_string()
    }
}
