//! Path-safety primitives shared by the classifier and shadow-branch manager.

use std::path::{Path, PathBuf};

/// Resolve `path` (which need not exist) against `repo_root` and confirm the
/// result still lives inside `repo_root` after symlink resolution of
/// whichever ancestor components do exist. Mirrors the reference daemon's
/// `safe_path` traversal guard, adapted to also catch symlink escapes for
/// classifier use rather than just `..` segments.
pub fn is_inside_repo(repo_root: &Path, path: &Path) -> bool {
    let root = match canonicalize_best_effort(repo_root) {
        Some(r) => r,
        None => return false,
    };
    let candidate = match canonicalize_best_effort(path) {
        Some(c) => c,
        None => return false,
    };
    candidate.starts_with(&root)
}

/// Canonicalize as much of `path` as exists; resolve the remaining tail
/// lexically (strip `.`/`..`) without requiring the file to exist yet.
fn canonicalize_best_effort(path: &Path) -> Option<PathBuf> {
    let mut existing = path;
    let mut tail: Vec<&std::ffi::OsStr> = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(resolved) => {
                let mut result = resolved;
                for component in tail.iter().rev() {
                    result.push(component);
                }
                return Some(normalize_lexically(&result));
            }
            Err(_) => {
                let file_name = existing.file_name()?;
                tail.push(file_name);
                existing = existing.parent()?;
            }
        }
    }
}

fn normalize_lexically(path: &Path) -> PathBuf {
    use std::path::Component;
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Drop embedded NUL bytes — defends against path/content confusion when a
/// value later crosses an FFI or SQL boundary.
pub fn strip_null_bytes(input: &str) -> String {
    if input.contains('\0') {
        input.chars().filter(|&c| c != '\0').collect()
    } else {
        input.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_path_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"x").unwrap();
        assert!(is_inside_repo(dir.path(), &file));
    }

    #[test]
    fn rejects_parent_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let escaped = sub.join("../../etc/passwd");
        assert!(!is_inside_repo(&sub, &escaped));
    }

    #[test]
    fn strips_null_bytes() {
        assert_eq!(strip_null_bytes("a\0b"), "ab");
        assert_eq!(strip_null_bytes("ab"), "ab");
    }
}
