//! Key-value persistence for the active calibration profile.

use crate::calibration::CalibrationProfile;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Errors raised by a profile store.
#[derive(Error, Debug)]
pub enum ProfileStoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed record for key {key}: {message}")]
    Malformed { key: String, message: String },

    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

/// Durable storage for a single calibration record per key.
#[cfg_attr(test, mockall::automock)]
pub trait ProfileStore: Send + Sync {
    /// Load the record under `key`, `None` if nothing is stored.
    fn load(&self, key: &str) -> Result<Option<CalibrationProfile>, ProfileStoreError>;

    /// Replace the record under `key`.
    fn save(&self, key: &str, profile: &CalibrationProfile) -> Result<(), ProfileStoreError>;

    /// Remove the record under `key`. Removing a missing key is not an error.
    fn clear(&self, key: &str) -> Result<(), ProfileStoreError>;
}

/// Stores each key as a pretty-printed JSON file under a directory.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, ProfileStoreError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(ProfileStoreError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ProfileStoreError + '_ {
    move |source| ProfileStoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl ProfileStore for JsonFileStore {
    fn load(&self, key: &str) -> Result<Option<CalibrationProfile>, ProfileStoreError> {
        let path = self.path_for(key)?;
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path)(e)),
        };

        let profile = serde_json::from_str(&raw).map_err(|e| ProfileStoreError::Malformed {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        Ok(Some(profile))
    }

    fn save(&self, key: &str, profile: &CalibrationProfile) -> Result<(), ProfileStoreError> {
        let path = self.path_for(key)?;
        std::fs::create_dir_all(&self.dir).map_err(io_error(&self.dir))?;

        let json =
            serde_json::to_string_pretty(profile).map_err(|e| ProfileStoreError::Malformed {
                key: key.to_string(),
                message: e.to_string(),
            })?;

        // Write then rename so a crash never leaves a half-written record
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(io_error(&tmp))?;
        std::fs::rename(&tmp, &path).map_err(io_error(&path))?;

        debug!(path = %path.display(), "Calibration record saved");
        Ok(())
    }

    fn clear(&self, key: &str) -> Result<(), ProfileStoreError> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path)(e)),
        }
    }
}

/// In-memory store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, CalibrationProfile>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProfileStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<CalibrationProfile>, ProfileStoreError> {
        Ok(self.records.lock().get(key).copied())
    }

    fn save(&self, key: &str, profile: &CalibrationProfile) -> Result<(), ProfileStoreError> {
        self.records.lock().insert(key.to_string(), *profile);
        Ok(())
    }

    fn clear(&self, key: &str) -> Result<(), ProfileStoreError> {
        self.records.lock().remove(key);
        Ok(())
    }
}
