//! Path resolution helpers
//!
//! Preset documents and identifiers carry user-written paths: `~`-prefixed,
//! absolute, or relative to the file that mentions them. `resolve` turns all
//! of these into cleaned absolute paths without touching the filesystem.

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Resolve a user-written path to a cleaned absolute path.
///
/// - `~` and `~/…` expand to the user's home directory (`~user` is not
///   expanded and is treated as a relative path)
/// - absolute paths are returned cleaned
/// - anything else is joined onto `base_dir`
pub fn resolve(path: &str, base_dir: &Path) -> Result<PathBuf> {
    if path.is_empty() {
        return Err(Error::Other("empty path".to_string()));
    }

    if path == "~" {
        return Ok(clean(&home_dir()?));
    }
    if let Some(rest) = path.strip_prefix("~/") {
        return Ok(clean(&home_dir()?.join(rest)));
    }

    let p = Path::new(path);
    if p.is_absolute() {
        return Ok(clean(p));
    }
    Ok(clean(&base_dir.join(p)))
}

fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().ok_or_else(|| Error::Other("could not determine home directory".to_string()))
}

/// Lexically normalize a path: drop `.` components and fold `..` into the
/// preceding component where possible. A `..` at the root of an absolute
/// path is dropped; leading `..` components of a relative path are kept.
pub fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    let mut depth = 0usize;
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if depth > 0 {
                    out.pop();
                    depth -= 1;
                } else if !out.has_root() {
                    out.push("..");
                }
            }
            Component::Normal(c) => {
                out.push(c);
                depth += 1;
            }
            other => out.push(other),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_path_is_an_error() {
        assert!(resolve("", Path::new("/base")).is_err());
    }

    #[test]
    fn absolute_paths_are_cleaned() {
        assert_eq!(
            resolve("/a/b/../c/./d", Path::new("/base")).unwrap(),
            PathBuf::from("/a/c/d")
        );
    }

    #[test]
    fn relative_paths_join_the_base() {
        assert_eq!(
            resolve("models/m.gguf", Path::new("/base")).unwrap(),
            PathBuf::from("/base/models/m.gguf")
        );
        assert_eq!(
            resolve("../m.gguf", Path::new("/base/presets")).unwrap(),
            PathBuf::from("/base/m.gguf")
        );
    }

    #[test]
    fn tilde_expands_to_home() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(resolve("~", Path::new("/base")).unwrap(), clean(&home));
        assert_eq!(
            resolve("~/models/m.gguf", Path::new("/base")).unwrap(),
            clean(&home.join("models/m.gguf"))
        );
    }

    #[test]
    fn tilde_user_is_not_expanded() {
        assert_eq!(
            resolve("~other/m.gguf", Path::new("/base")).unwrap(),
            PathBuf::from("/base/~other/m.gguf")
        );
    }

    #[test]
    fn clean_handles_edge_cases() {
        assert_eq!(clean(Path::new("/..")), PathBuf::from("/"));
        assert_eq!(clean(Path::new("a/..")), PathBuf::from("."));
        assert_eq!(clean(Path::new("../a")), PathBuf::from("../a"));
        assert_eq!(clean(Path::new("/a//b/")), PathBuf::from("/a/b"));
    }
}
