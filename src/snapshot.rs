//! Snapshot store
//!
//! Persists a partition's full recovery image — last applied WAL index,
//! business state and idempotency filter — as one atomically-replaced file.
//! The write protocol is temp file + flush + atomic rename, so at any
//! instant either no snapshot exists or the canonical file is fully valid.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::idempotency::IdempotencyFilter;

const SNAPSHOT_FILE_NAME: &str = "snapshot.dat";
const TEMP_FILE_NAME: &str = "snapshot.tmp";

/// Everything recovery needs: replay resumes at `last_wal_index + 1`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotContainer<S> {
    /// Index of the last WAL record whose effect is reflected in `state`
    pub last_wal_index: u64,
    /// Business state
    pub state: S,
    /// Idempotency filter state
    pub filter: IdempotencyFilter,
}

/// Atomic save/load of snapshot containers for one partition.
pub struct SnapshotStore {
    snapshot_dir: PathBuf,
}

impl SnapshotStore {
    /// Store rooted at `<data_dir>/snapshot`.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let snapshot_dir = data_dir.as_ref().join("snapshot");
        std::fs::create_dir_all(&snapshot_dir)?;
        Ok(Self { snapshot_dir })
    }

    /// Serialize `container` to the temp file, flush, and atomically rename
    /// over the canonical snapshot.
    pub fn save<S: Serialize>(&self, container: &SnapshotContainer<S>) -> Result<()> {
        let temp_path = self.snapshot_dir.join(TEMP_FILE_NAME);
        let final_path = self.snapshot_dir.join(SNAPSHOT_FILE_NAME);

        {
            let file = File::create(&temp_path)
                .map_err(|e| Error::Snapshot(format!("create temp file: {}", e)))?;
            let mut writer = BufWriter::new(file);
            bincode::serialize_into(&mut writer, container)
                .map_err(|e| Error::Snapshot(format!("serialize: {}", e)))?;
            writer
                .flush()
                .map_err(|e| Error::Snapshot(format!("flush temp file: {}", e)))?;
            writer
                .get_ref()
                .sync_all()
                .map_err(|e| Error::Snapshot(format!("sync temp file: {}", e)))?;
        }

        std::fs::rename(&temp_path, &final_path)
            .map_err(|e| Error::Snapshot(format!("atomic rename: {}", e)))?;

        info!(
            path = %final_path.display(),
            last_wal_index = container.last_wal_index,
            "snapshot saved"
        );
        Ok(())
    }

    /// Load the canonical snapshot.
    ///
    /// Missing file means a cold start. A corrupt or incompatible file is
    /// logged and treated as absent, forcing a full WAL replay.
    pub fn load<S: DeserializeOwned>(&self) -> Option<SnapshotContainer<S>> {
        let path = self.snapshot_dir.join(SNAPSHOT_FILE_NAME);
        if !path.exists() {
            info!("no snapshot found, recovery starts from scratch");
            return None;
        }
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "snapshot unreadable, ignoring");
                return None;
            }
        };
        match bincode::deserialize_from(BufReader::new(file)) {
            Ok(container) => Some(container),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "snapshot corrupt or incompatible, ignoring");
                None
            }
        }
    }

    /// Path of the canonical snapshot file.
    #[must_use]
    pub fn snapshot_path(&self) -> PathBuf {
        self.snapshot_dir.join(SNAPSHOT_FILE_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::LruFilter;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn sample_filter() -> IdempotencyFilter {
        let mut f = LruFilter::new(64);
        f.add("tx-1");
        f.add("tx-2");
        IdempotencyFilter::Lru(f)
    }

    #[test]
    fn test_load_absent_returns_none() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        assert!(store.load::<HashMap<String, i64>>().is_none());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();

        let mut state = HashMap::new();
        state.insert("u1".to_string(), 250i64);
        let container = SnapshotContainer {
            last_wal_index: 42,
            state,
            filter: sample_filter(),
        };
        store.save(&container).unwrap();

        let mut loaded = store.load::<HashMap<String, i64>>().unwrap();
        assert_eq!(loaded.last_wal_index, 42);
        assert_eq!(loaded.state.get("u1"), Some(&250));
        assert!(loaded.filter.contains("tx-1"));
        assert!(loaded.filter.contains("tx-2"));
        assert!(!loaded.filter.contains("tx-3"));
    }

    #[test]
    fn test_save_replaces_previous() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();

        for index in [1u64, 2, 3] {
            let container = SnapshotContainer {
                last_wal_index: index,
                state: index as i64,
                filter: sample_filter(),
            };
            store.save(&container).unwrap();
        }
        let loaded = store.load::<i64>().unwrap();
        assert_eq!(loaded.last_wal_index, 3);
        assert_eq!(loaded.state, 3);
        // No stray temp file after a completed save
        assert!(!dir.path().join("snapshot").join(TEMP_FILE_NAME).exists());
    }

    #[test]
    fn test_corrupt_snapshot_ignored() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        std::fs::write(store.snapshot_path(), b"definitely not bincode").unwrap();
        assert!(store.load::<HashMap<String, i64>>().is_none());
    }
}
