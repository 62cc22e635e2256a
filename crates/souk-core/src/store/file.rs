use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use tracing::debug;

use super::CredentialStore;

/// Credentials file name in the data directory
const CREDENTIALS_FILE: &str = "credentials.json";

type Entries = BTreeMap<String, String>;

/// Credential store persisted as a single JSON document.
///
/// Each batch writes the full document to a sibling temp file and renames it
/// over the original, so a failed write leaves the previous document intact.
pub struct FileStore {
    path: PathBuf,
    // Last state known to be on disk; `None` until first read.
    cached: Mutex<Option<Entries>>,
}

impl FileStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            cached: Mutex::new(None),
        }
    }

    /// Store rooted in a directory, using the default file name.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(CREDENTIALS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Entries>> {
        self.cached.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_from_disk(&self) -> Result<Entries> {
        if !self.path.exists() {
            return Ok(Entries::new());
        }
        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read credentials file: {}", self.path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse credentials file: {}", self.path.display()))
    }

    fn write_to_disk(&self, entries: &Entries) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.temp_path();
        let contents = serde_json::to_string_pretty(entries)?;
        std::fs::write(&tmp, contents)
            .with_context(|| format!("Failed to write credentials file: {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace credentials file: {}", self.path.display()))?;
        Ok(())
    }

    /// Apply `change` to a copy of the current entries and persist it. The
    /// cached state only moves forward once the file is replaced.
    fn update<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut Entries),
    {
        let mut cached = self.lock();
        let mut next = match cached.as_ref() {
            Some(entries) => entries.clone(),
            None => self.read_from_disk()?,
        };
        change(&mut next);
        self.write_to_disk(&next)?;
        debug!(path = %self.path.display(), keys = next.len(), "Credentials file updated");
        *cached = Some(next);
        Ok(())
    }
}

impl CredentialStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let mut cached = self.lock();
        if cached.is_none() {
            *cached = Some(self.read_from_disk()?);
        }
        Ok(cached.as_ref().and_then(|entries| entries.get(key).cloned()))
    }

    fn set_many(&self, entries: &[(&str, &str)]) -> Result<()> {
        self.update(|map| {
            for (key, value) in entries {
                map.insert(key.to_string(), value.to_string());
            }
        })
    }

    fn remove_many(&self, keys: &[&str]) -> Result<()> {
        self.update(|map| {
            for key in keys {
                map.remove(*key);
            }
        })
    }
}
