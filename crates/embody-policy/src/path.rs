//! Lexical path canonicalization.
//!
//! Paths in tool parameters refer to the body's sandbox, not to the local
//! filesystem, so they are resolved purely lexically: `.` segments are
//! dropped, `..` pops the previous segment and can never climb above the
//! root, and relative paths are anchored at `/`.

/// Canonicalize a sandbox path.
///
/// ```
/// use embody_policy::canonicalize_path;
///
/// assert_eq!(canonicalize_path("/workspace/../etc/passwd"), "/etc/passwd");
/// assert_eq!(canonicalize_path("src/./main.rs"), "/src/main.rs");
/// assert_eq!(canonicalize_path("/../../.."), "/");
/// ```
#[must_use]
pub fn canonicalize_path(raw: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in raw.split('/') {
        match segment {
            "" | "." => {},
            ".." => {
                segments.pop();
            },
            other => segments.push(other),
        }
    }

    let mut out = String::with_capacity(raw.len().saturating_add(1));
    if segments.is_empty() {
        out.push('/');
    }
    for segment in segments {
        out.push('/');
        out.push_str(segment);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_traversal_is_resolved() {
        assert_eq!(canonicalize_path("/workspace/../etc/passwd"), "/etc/passwd");
        assert_eq!(
            canonicalize_path("/workspace/a/b/../../../etc"),
            "/etc"
        );
    }

    #[test]
    fn test_cannot_climb_above_root() {
        assert_eq!(canonicalize_path("../../etc/shadow"), "/etc/shadow");
        assert_eq!(canonicalize_path(".."), "/");
    }

    #[test]
    fn test_redundant_separators_and_dots() {
        assert_eq!(canonicalize_path("//workspace//./src/"), "/workspace/src");
        assert_eq!(canonicalize_path(""), "/");
        assert_eq!(canonicalize_path("notes.txt"), "/notes.txt");
    }

    #[test]
    fn test_dotted_names_are_kept() {
        assert_eq!(canonicalize_path("/workspace/...hidden"), "/workspace/...hidden");
        assert_eq!(canonicalize_path("/workspace/.env"), "/workspace/.env");
    }
}
