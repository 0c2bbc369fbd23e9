//! Filesystem primitives the supervisor's persistence relies on
//!
//! Every persisted artifact (catalog JSON, preset YAML, router INI) goes
//! through `atomic_write`: write a temp file in the same directory, fsync,
//! rename. A crash leaves either the previous version or the new one, never
//! a truncated file.

use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Atomically replace `path` with `bytes` via temp-file + fsync + rename.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Other(format!("no parent directory for {}", path.display())))?;
    let name = path
        .file_name()
        .ok_or_else(|| Error::Other(format!("no file name in {}", path.display())))?
        .to_string_lossy();
    let tmp = dir.join(format!(".{}.tmp{:08x}", name, rand::random::<u32>()));

    let result = (|| -> std::io::Result<()> {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result.map_err(Error::from)
}

/// A handle to the models directory that refuses path traversal.
///
/// Filenames coming back from the remote registry are untrusted; they are
/// only ever joined through this handle, which requires a single normal
/// path component.
#[derive(Debug, Clone)]
pub struct ModelsDir {
    root: PathBuf,
}

impl ModelsDir {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Join a filename onto the root, rejecting anything that could escape
    /// it: absolute paths, separators, `.` and `..`.
    pub fn join(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() {
            return Err(Error::Download("empty artifact filename".to_string()));
        }
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.root.join(name)),
            _ => Err(Error::Download(format!(
                "artifact filename {name:?} is not a local file name"
            ))),
        }
    }
}
