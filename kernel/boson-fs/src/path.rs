//! Path utilities.

/// Returns whether `path` is absolute.
#[must_use]
pub fn is_absolute(path: &str) -> bool {
    path.starts_with('/')
}

/// Iterates the non-empty components of `path`.
///
/// Repeated and trailing slashes are skipped; `.` and `..` are yielded
/// as-is for the resolver to interpret.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// Splits a path into its directory part and final component.
///
/// Returns `None` for an empty path or one that names no component.
#[must_use]
pub fn split_parent(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.rfind('/') {
        Some(pos) => {
            let (dir, name) = trimmed.split_at(pos);
            let dir = if dir.is_empty() && is_absolute(path) {
                "/"
            } else {
                dir
            };
            Some((dir, &name[1..]))
        }
        None => Some(("", trimmed)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_iteration_skips_empties() {
        let parts: Vec<&str> = components("/usr//bin/ls/").collect();
        assert_eq!(parts, ["usr", "bin", "ls"]);
        assert_eq!(components("").count(), 0);
        assert_eq!(components("/").count(), 0);
    }

    #[test]
    fn split_parent_cases() {
        assert_eq!(split_parent("/etc/passwd"), Some(("/etc", "passwd")));
        assert_eq!(split_parent("/passwd"), Some(("/", "passwd")));
        assert_eq!(split_parent("name"), Some(("", "name")));
        assert_eq!(split_parent("/a/b/"), Some(("/a", "b")));
        assert_eq!(split_parent("/"), None);
        assert_eq!(split_parent(""), None);
    }
}
