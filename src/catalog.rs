//! Local artifact catalog
//!
//! A single JSON document inside the models directory mapping
//! `(repo, quant)` to the downloaded file. Saves are atomic so a crash
//! leaves either the previous catalog or the new one.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::fsutil;

const CATALOG_FILE: &str = "catalog.json";

/// One downloaded artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub repo: String,
    pub quant: String,
    pub filename: String,
    pub size: u64,
    pub downloaded_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    models: Vec<CatalogEntry>,
}

/// The on-disk catalog, loaded into memory for mutation.
///
/// The legal sequence is load → mutate → save; the supervisor serializes
/// callers. Cross-process safety is not provided — one supervisor owns the
/// models directory.
#[derive(Debug)]
pub struct Catalog {
    dir: PathBuf,
    entries: Vec<CatalogEntry>,
}

impl Catalog {
    /// Load the catalog from `dir`. A missing file yields an empty catalog.
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let path = dir.join(CATALOG_FILE);
        let entries = match fs::read(&path) {
            Ok(bytes) => {
                let doc: Document = serde_json::from_slice(&bytes).map_err(|e| {
                    Error::Other(format!("corrupt catalog {}: {e}", path.display()))
                })?;
                doc.models
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { dir, entries })
    }

    /// Persist via atomic rename.
    pub fn save(&self) -> Result<()> {
        let doc = Document {
            models: self.entries.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&doc)
            .map_err(|e| Error::Other(format!("cannot serialize catalog: {e}")))?;
        fsutil::atomic_write(&self.dir.join(CATALOG_FILE), &bytes)
    }

    /// Insert a record, replacing any existing one for the same
    /// `(repo, quant)`.
    pub fn add(&mut self, entry: CatalogEntry) {
        self.entries
            .retain(|e| !(e.repo == entry.repo && e.quant == entry.quant));
        self.entries.push(entry);
    }

    pub fn remove(&mut self, repo: &str, quant: &str) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|e| !(e.repo == repo && e.quant == quant));
        self.entries.len() != before
    }

    pub fn exists(&self, repo: &str, quant: &str) -> bool {
        self.get(repo, quant).is_some()
    }

    pub fn get(&self, repo: &str, quant: &str) -> Option<&CatalogEntry> {
        self.entries
            .iter()
            .find(|e| e.repo == repo && e.quant == quant)
    }

    /// Absolute path of the recorded file, or `ModelNotFound`.
    pub fn get_file_path(&self, repo: &str, quant: &str) -> Result<PathBuf> {
        match self.get(repo, quant) {
            Some(entry) => Ok(self.dir.join(&entry.filename)),
            None => Err(Error::ModelNotFound {
                repo: repo.to_string(),
                quant: quant.to_string(),
            }),
        }
    }

    /// Records in insertion order.
    pub fn list(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
