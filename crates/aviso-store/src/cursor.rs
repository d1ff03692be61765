// ABOUTME: Persists the next revision to read per watched key, one JSON file per store endpoint.
// ABOUTME: Writes go through an exclusive advisory lock and an fsynced temp file renamed into place.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use aviso_core::Revision;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::adapter::Endpoint;

/// Errors that can occur while reading or writing the cursor file.
#[derive(Debug, Error)]
pub enum CursorError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Contents of a cursor file.
///
/// Revisions are the next revision to read, i.e. one past the last one delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorState {
    pub last_revision: Revision,
    pub timestamp: DateTime<Utc>,
    pub server_host: String,
    pub server_port: u16,
    #[serde(default)]
    pub key_revisions: BTreeMap<String, Revision>,
}

/// Handle on `<state_dir>/<host>_<port>.json` and its sidecar lock file.
#[derive(Debug, Clone)]
pub struct CursorFile {
    path: PathBuf,
    lock_path: PathBuf,
    endpoint: Endpoint,
}

impl CursorFile {
    pub fn for_endpoint(state_dir: &Path, endpoint: &Endpoint) -> Self {
        let stem = format!("{}_{}", endpoint.host, endpoint.port);
        Self {
            path: state_dir.join(format!("{}.json", stem)),
            lock_path: state_dir.join(format!("{}.lock", stem)),
            endpoint: endpoint.clone(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the cursor file under a shared lock. `None` if it does not exist.
    pub fn load(&self) -> Result<Option<CursorState>, CursorError> {
        let lock = self.open_lock()?;
        FileExt::lock_shared(&lock)?;
        let state = self.read_unlocked();
        FileExt::unlock(&lock)?;
        state
    }

    /// Where `key` should resume, if anything was recorded.
    ///
    /// A key without its own entry resumes from the oldest recorded position, so
    /// nothing published while the process was down is skipped. Files without a
    /// per-key map fall back to the endpoint-wide revision.
    pub fn revision_for(&self, key: &str) -> Result<Option<Revision>, CursorError> {
        Ok(self.load()?.map(|state| {
            state
                .key_revisions
                .get(key)
                .copied()
                .or_else(|| state.key_revisions.values().min().copied())
                .unwrap_or(state.last_revision)
        }))
    }

    /// Record that `key` has been delivered up to `next - 1`.
    ///
    /// Never moves a key backwards, so concurrent writers converge on the maximum.
    pub fn record(&self, key: &str, next: Revision) -> Result<(), CursorError> {
        let lock = self.open_lock()?;
        FileExt::lock_exclusive(&lock)?;
        let result = self.record_locked(key, next);
        FileExt::unlock(&lock)?;
        result
    }

    /// Forget every recorded position.
    pub fn clear(&self) -> Result<(), CursorError> {
        let lock = self.open_lock()?;
        FileExt::lock_exclusive(&lock)?;
        let result = match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CursorError::Io(e)),
        };
        FileExt::unlock(&lock)?;
        if result.is_ok() {
            tracing::info!("cleared cursor file {}", self.path.display());
        }
        result
    }

    fn open_lock(&self) -> Result<File, CursorError> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)?)
    }

    fn read_unlocked(&self) -> Result<Option<CursorState>, CursorError> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CursorError::Io(e)),
        }
    }

    fn record_locked(&self, key: &str, next: Revision) -> Result<(), CursorError> {
        let mut state = self.read_unlocked()?.unwrap_or_else(|| CursorState {
            last_revision: 0,
            timestamp: Utc::now(),
            server_host: self.endpoint.host.clone(),
            server_port: self.endpoint.port,
            key_revisions: BTreeMap::new(),
        });

        let entry = state.key_revisions.entry(key.to_string()).or_insert(next);
        *entry = (*entry).max(next);
        state.last_revision = state.last_revision.max(next);
        state.timestamp = Utc::now();

        self.write_atomic(&state)
    }

    fn write_atomic(&self, state: &CursorState) -> Result<(), CursorError> {
        let tmp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(state)?;

        let mut file = File::create(&tmp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, &self.path)?;

        // Best-effort: make the rename itself durable.
        if let Some(parent) = self.path.parent()
            && let Ok(dir) = File::open(parent)
        {
            let _ = dir.sync_all();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn endpoint() -> Endpoint {
        Endpoint {
            host: "etcd.local".to_string(),
            port: 2379,
        }
    }

    #[test]
    fn file_is_named_after_endpoint() {
        let dir = TempDir::new().unwrap();
        let cursor = CursorFile::for_endpoint(dir.path(), &endpoint());
        assert_eq!(cursor.path(), dir.path().join("etcd.local_2379.json"));
    }

    #[test]
    fn missing_file_has_no_revision() {
        let dir = TempDir::new().unwrap();
        let cursor = CursorFile::for_endpoint(&dir.path().join("state"), &endpoint());
        assert!(cursor.load().unwrap().is_none());
        assert_eq!(cursor.revision_for("/x/").unwrap(), None);
    }

    #[test]
    fn record_keeps_keys_independent() {
        let dir = TempDir::new().unwrap();
        let cursor = CursorFile::for_endpoint(dir.path(), &endpoint());
        cursor.record("/a/", 10).unwrap();
        cursor.record("/b/", 4).unwrap();

        assert_eq!(cursor.revision_for("/a/").unwrap(), Some(10));
        assert_eq!(cursor.revision_for("/b/").unwrap(), Some(4));

        let state = cursor.load().unwrap().unwrap();
        assert_eq!(state.last_revision, 10);
        assert_eq!(state.server_host, "etcd.local");
        assert_eq!(state.server_port, 2379);
    }

    #[test]
    fn unrecorded_key_resumes_from_oldest_entry() {
        let dir = TempDir::new().unwrap();
        let cursor = CursorFile::for_endpoint(dir.path(), &endpoint());
        assert_eq!(cursor.revision_for("/c/").unwrap(), None);

        cursor.record("/a/", 10).unwrap();
        cursor.record("/b/", 4).unwrap();
        assert_eq!(cursor.revision_for("/c/").unwrap(), Some(4));
    }

    #[test]
    fn record_never_moves_backwards() {
        let dir = TempDir::new().unwrap();
        let cursor = CursorFile::for_endpoint(dir.path(), &endpoint());
        cursor.record("/a/", 10).unwrap();
        cursor.record("/a/", 7).unwrap();
        assert_eq!(cursor.revision_for("/a/").unwrap(), Some(10));
    }

    #[test]
    fn file_without_key_map_falls_back_to_last_revision() {
        let dir = TempDir::new().unwrap();
        let cursor = CursorFile::for_endpoint(dir.path(), &endpoint());
        fs::write(
            cursor.path(),
            r#"{"last_revision": 42, "timestamp": "2024-01-01T00:00:00Z",
                "server_host": "etcd.local", "server_port": 2379}"#,
        )
        .unwrap();
        assert_eq!(cursor.revision_for("/anything/").unwrap(), Some(42));
    }

    #[test]
    fn clear_removes_state() {
        let dir = TempDir::new().unwrap();
        let cursor = CursorFile::for_endpoint(dir.path(), &endpoint());
        cursor.record("/a/", 3).unwrap();
        cursor.clear().unwrap();
        assert!(cursor.load().unwrap().is_none());
        // Clearing twice is fine.
        cursor.clear().unwrap();
    }

    #[test]
    fn no_temp_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let cursor = CursorFile::for_endpoint(dir.path(), &endpoint());
        cursor.record("/a/", 3).unwrap();
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert!(names.iter().all(|n| !n.ends_with(".tmp")), "{:?}", names);
    }
}
