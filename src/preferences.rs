//! Persisted "camera was left on" preference
//!
//! A single boolean that survives restarts. It is read once at startup to
//! decide whether to reacquire the camera, and written on every explicit
//! acquire/release.

use crate::utils::error::AppResult;
use parking_lot::Mutex as ParkingMutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// File name inside the app config directory
pub const PREFERENCES_FILE: &str = "preferences.json";

pub trait PreferenceStore: Send + Sync {
    /// Whether the camera was on when the app last left it
    fn camera_on(&self) -> bool;

    fn set_camera_on(&self, on: bool) -> AppResult<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Preferences {
    #[serde(default)]
    camera_on: bool,
}

/// Preference store backed by a small JSON file
pub struct JsonPreferenceStore {
    path: PathBuf,
    lock: ParkingMutex<()>,
}

impl JsonPreferenceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: ParkingMutex::new(()),
        }
    }

    /// Store under `dir/preferences.json`
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(PREFERENCES_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> AppResult<Preferences> {
        if !self.path.exists() {
            return Ok(Preferences::default());
        }
        let content = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl PreferenceStore for JsonPreferenceStore {
    fn camera_on(&self) -> bool {
        let _guard = self.lock.lock();
        match self.read() {
            Ok(prefs) => prefs.camera_on,
            Err(e) => {
                tracing::warn!("Ignoring unreadable preferences at {:?}: {}", self.path, e);
                false
            }
        }
    }

    fn set_camera_on(&self, on: bool) -> AppResult<()> {
        let _guard = self.lock.lock();
        let mut prefs = self.read().unwrap_or_default();
        prefs.camera_on = on;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write to a sibling file first so a crash never leaves half a file behind
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&prefs)?)?;
        fs::rename(&tmp, &self.path)?;

        tracing::debug!("Saved cameraOn={} to {:?}", on, self.path);
        Ok(())
    }
}

/// In-memory store, used when no config directory is available
#[derive(Debug, Default)]
pub struct MemoryPreferenceStore {
    camera_on: ParkingMutex<bool>,
    writes: ParkingMutex<Vec<bool>>,
}

impl MemoryPreferenceStore {
    pub fn new(camera_on: bool) -> Self {
        Self {
            camera_on: ParkingMutex::new(camera_on),
            writes: ParkingMutex::new(Vec::new()),
        }
    }

    /// Every value written so far, oldest first
    pub fn writes(&self) -> Vec<bool> {
        self.writes.lock().clone()
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn camera_on(&self) -> bool {
        *self.camera_on.lock()
    }

    fn set_camera_on(&self, on: bool) -> AppResult<()> {
        *self.camera_on.lock() = on;
        self.writes.lock().push(on);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_means_off() {
        let dir = tempdir().unwrap();
        let store = JsonPreferenceStore::in_dir(dir.path());
        assert!(!store.camera_on());
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = tempdir().unwrap();
        let store = JsonPreferenceStore::in_dir(&dir.path().join("nested"));

        store.set_camera_on(true).unwrap();
        assert!(store.camera_on());

        // A fresh store over the same file sees the persisted value
        let reopened = JsonPreferenceStore::in_dir(&dir.path().join("nested"));
        assert!(reopened.camera_on());

        reopened.set_camera_on(false).unwrap();
        assert!(!store.camera_on());
    }

    #[test]
    fn test_file_format() {
        let dir = tempdir().unwrap();
        let store = JsonPreferenceStore::in_dir(dir.path());
        store.set_camera_on(true).unwrap();

        let raw = fs::read_to_string(store.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["cameraOn"], serde_json::Value::Bool(true));
    }

    #[test]
    fn test_corrupt_file_reads_as_off() {
        let dir = tempdir().unwrap();
        let store = JsonPreferenceStore::in_dir(dir.path());
        fs::write(store.path(), "not json").unwrap();

        assert!(!store.camera_on());
        store.set_camera_on(true).unwrap();
        assert!(store.camera_on());
    }

    #[test]
    fn test_memory_store_records_writes() {
        let store = MemoryPreferenceStore::new(true);
        assert!(store.camera_on());
        store.set_camera_on(false).unwrap();
        assert_eq!(store.writes(), vec![false]);
    }
}
