//! On-disk preset store
//!
//! Presets live in a directory of YAML files named with random 16-hex
//! strings; the logical identifier is the `name` field inside the document,
//! so loading by name scans the directory. Writes go through atomic rename.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{Error, Result};
use crate::fsutil;
use crate::paths;

use super::Preset;

#[derive(Debug, Clone)]
pub struct PresetStore {
    dir: PathBuf,
}

impl PresetStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load, validate, and resolve a preset document from an explicit path.
    /// Relative paths are resolved against the current working directory.
    pub fn load_file(&self, path: &str) -> Result<Preset> {
        let base = std::env::current_dir()?;
        let path = paths::resolve(path, &base)?;
        let doc = fs::read_to_string(&path).map_err(|e| {
            Error::Other(format!("cannot read preset file {}: {e}", path.display()))
        })?;
        let preset = Preset::parse(&doc)?;
        preset.validate()?;
        let base_dir = path.parent().unwrap_or(Path::new("."));
        preset.resolve_paths(base_dir)
    }

    /// Load a preset by its embedded name, scanning the store directory.
    pub fn load_by_name(&self, name: &str) -> Result<Preset> {
        match self.find(name)? {
            Some((path, preset)) => {
                preset.validate()?;
                preset.resolve_paths(path.parent().unwrap_or(&self.dir))
            }
            None => Err(Error::PresetNotFound(name.to_string())),
        }
    }

    /// Names of every parseable preset in the store, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for (_, preset) in self.scan()? {
            names.push(preset.name);
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Persist a preset. Overwrites the file currently holding that name,
    /// or creates a new randomly-named file.
    pub fn save(&self, preset: &Preset) -> Result<PathBuf> {
        preset.validate()?;
        let path = match self.find(&preset.name)? {
            Some((path, _)) => path,
            None => self.dir.join(format!("{:016x}.yaml", rand::random::<u64>())),
        };
        fsutil::atomic_write(&path, preset.to_yaml()?.as_bytes())?;
        Ok(path)
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        match self.find(name)? {
            Some((path, _)) => Ok(fs::remove_file(path)?),
            None => Err(Error::PresetNotFound(name.to_string())),
        }
    }

    fn find(&self, name: &str) -> Result<Option<(PathBuf, Preset)>> {
        Ok(self
            .scan()?
            .into_iter()
            .find(|(_, preset)| preset.name == name))
    }

    /// Every YAML document in the store that parses. Unparseable files are
    /// logged and skipped so one bad document does not hide the rest.
    fn scan(&self) -> Result<Vec<(PathBuf, Preset)>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_yaml = path
                .extension()
                .map(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
                .unwrap_or(false);
            if !is_yaml {
                continue;
            }
            let doc = match fs::read_to_string(&path) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable preset file");
                    continue;
                }
            };
            match Preset::parse(&doc) {
                Ok(preset) => found.push((path, preset)),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unparseable preset file");
                }
            }
        }
        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found)
    }
}
