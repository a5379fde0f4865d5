//! Path sandbox
//!
//! Confines script-supplied file paths to a base directory.
//!
//! # Security Mitigations
//!
//! - **Traversal**: `../` escapes are detected on the cleaned relative path
//! - **Prefix confusion**: `/base-evil` is not accepted for base `/base`; the
//!   final prefix check is done on separator-terminated strings
//! - **NUL injection**: paths containing NUL bytes are rejected
//! - **Long paths**: paths longer than [`MAX_PATH_LENGTH`] are rejected

use std::path::{Component, MAIN_SEPARATOR, Path, PathBuf};

use crate::error::{Error, Result};
use crate::limits::MAX_PATH_LENGTH;

/// Lexically clean a path: drop `.` components, fold `..` into its parent.
///
/// Works purely on the path text; symbolic links are not followed.
/// `..` at the root stays at the root, leading `..` of a relative path is kept.
pub fn clean_path(path: &Path) -> PathBuf {
    let mut parts: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => parts.push(component),
            },
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return PathBuf::from(".");
    }
    parts.iter().collect()
}

/// Resolve `path` against `base` (when relative) and clean the result.
pub fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        clean_path(path)
    } else {
        clean_path(&base.join(path))
    }
}

/// Relative path from `base` to `target`; both must be absolute and clean.
///
/// Returns `None` when the two paths live under different prefixes
/// (different drives on Windows).
fn relative_to(base: &Path, target: &Path) -> Option<PathBuf> {
    let base: Vec<_> = base.components().collect();
    let target: Vec<_> = target.components().collect();

    if base.first() != target.first() {
        return None;
    }

    let common = base
        .iter()
        .zip(target.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel = PathBuf::new();
    for _ in common..base.len() {
        rel.push("..");
    }
    for component in &target[common..] {
        rel.push(component.as_os_str());
    }
    if rel.as_os_str().is_empty() {
        rel.push(".");
    }
    Some(rel)
}

/// Validates file paths against a sandbox base directory.
///
/// # Example
///
/// ```rust
/// use swrt::PathValidator;
///
/// let validator = PathValidator::new("/tmp/work");
/// assert!(validator.validate("/tmp/work/sub/file.txt").is_ok());
/// assert!(validator.validate("/tmp/work/../etc/passwd").is_err());
/// ```
#[derive(Debug, Clone)]
pub struct PathValidator {
    base: PathBuf,
    allow_all: bool,
    max_path_length: usize,
}

impl PathValidator {
    /// Create a validator confining paths to `base`.
    ///
    /// A relative base is resolved against the process working directory.
    pub fn new(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        let base = if base.is_absolute() {
            clean_path(base)
        } else {
            let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
            absolutize(base, &cwd)
        };
        Self {
            base,
            allow_all: false,
            max_path_length: MAX_PATH_LENGTH,
        }
    }

    /// Create a validator that accepts every path unchanged.
    ///
    /// # Warning
    ///
    /// This disables the sandbox. Only use in tests or for fully trusted scripts.
    pub fn allow_all(base: impl AsRef<Path>) -> Self {
        Self {
            allow_all: true,
            ..Self::new(base)
        }
    }

    /// Set the maximum accepted path length in bytes.
    pub fn max_path_length(mut self, len: usize) -> Self {
        self.max_path_length = len;
        self
    }

    /// The cleaned absolute sandbox base.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Validate `path` and return its cleaned absolute form.
    ///
    /// Relative paths are resolved against the sandbox base.
    pub fn validate(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();
        if self.allow_all {
            return Ok(path.to_path_buf());
        }

        let raw = path.to_string_lossy();
        if raw.len() > self.max_path_length {
            return Err(Error::validation(format!(
                "path too long: max {} characters",
                self.max_path_length
            )));
        }
        if raw.contains('\0') {
            return Err(Error::validation("path contains null bytes"));
        }

        let abs = absolutize(path, &self.base);

        let rel = relative_to(&self.base, &abs).ok_or_else(|| {
            Error::validation("access denied: cannot resolve path relative to base")
        })?;
        if matches!(rel.components().next(), Some(Component::ParentDir)) {
            return Err(Error::validation(
                "access denied: path outside sandbox (potential traversal attack)",
            ));
        }

        let abs_str = abs.to_string_lossy();
        let base_str = self.base.to_string_lossy();
        if abs_str != base_str {
            let abs_sep = with_trailing_separator(&abs_str);
            let base_sep = with_trailing_separator(&base_str);
            let inside = abs_sep.starts_with(&base_sep)
                || abs_sep.to_lowercase().starts_with(&base_sep.to_lowercase());
            if !inside {
                return Err(Error::validation(
                    "access denied: path outside allowed directory",
                ));
            }
        }

        Ok(abs)
    }

    /// Check a path without returning the cleaned form.
    pub fn is_valid_path(&self, path: impl AsRef<Path>) -> bool {
        self.validate(path).is_ok()
    }
}

fn with_trailing_separator(s: &str) -> String {
    if s.ends_with(MAIN_SEPARATOR) {
        s.to_string()
    } else {
        format!("{s}{MAIN_SEPARATOR}")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn clean_folds_dots() {
        assert_eq!(clean_path(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
        assert_eq!(clean_path(Path::new("/../x")), PathBuf::from("/x"));
        assert_eq!(clean_path(Path::new("a/../../b")), PathBuf::from("../b"));
        assert_eq!(clean_path(Path::new("./")), PathBuf::from("."));
    }

    #[test]
    fn relative_paths() {
        let rel = relative_to(Path::new("/tmp/work"), Path::new("/tmp/work/a/b")).unwrap();
        assert_eq!(rel, PathBuf::from("a/b"));
        let rel = relative_to(Path::new("/tmp/work"), Path::new("/tmp/other")).unwrap();
        assert_eq!(rel, PathBuf::from("../other"));
        let rel = relative_to(Path::new("/tmp/work"), Path::new("/tmp/work")).unwrap();
        assert_eq!(rel, PathBuf::from("."));
    }

    #[test]
    fn traversal_is_rejected() {
        let v = PathValidator::new("/tmp/work");
        let err = v.validate("/tmp/work/../etc/passwd").unwrap_err();
        assert!(err.to_string().contains("outside sandbox"));
    }

    #[test]
    fn base_and_children_are_accepted() {
        let v = PathValidator::new("/tmp/work");
        assert_eq!(v.validate("/tmp/work").unwrap(), PathBuf::from("/tmp/work"));
        assert_eq!(
            v.validate("/tmp/work/sub").unwrap(),
            PathBuf::from("/tmp/work/sub")
        );
        assert_eq!(
            v.validate("sub/./file.txt").unwrap(),
            PathBuf::from("/tmp/work/sub/file.txt")
        );
    }

    #[test]
    fn sibling_with_common_prefix_is_rejected() {
        let v = PathValidator::new("/tmp/work");
        assert!(!v.is_valid_path("/tmp/work-evil/file"));
    }

    #[test]
    fn nul_and_length_are_rejected() {
        let v = PathValidator::new("/tmp/work");
        let err = v.validate("/tmp/work/a\0b").unwrap_err();
        assert_eq!(err.to_string(), "path contains null bytes");

        let long = format!("/tmp/work/{}", "a".repeat(5000));
        let err = v.validate(long).unwrap_err();
        assert!(err.to_string().starts_with("path too long"));

        let v = v.max_path_length(16);
        assert!(v.validate("/tmp/work/abcdefghijk").is_err());
    }

    #[test]
    fn allow_all_returns_path_unchanged() {
        let v = PathValidator::allow_all("/tmp/work");
        assert_eq!(
            v.validate("/etc/../etc/passwd").unwrap(),
            PathBuf::from("/etc/../etc/passwd")
        );
    }
}
