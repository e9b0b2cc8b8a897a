//! Snapshot persistence for the store coordinator.
//!
//! The authoritative tables are serialized as MessagePack snapshots and
//! written atomically (temp file + rename). Depending on the durability
//! mode, writes happen inline during apply or on a background persister
//! thread that coalesces to the newest pending snapshot.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::core::{EntityKind, Record, RecordId, Result, StoreError};
use crate::store::schema::DurabilityMode;

pub(crate) type Tables = HashMap<EntityKind, HashMap<RecordId, Record>>;

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u32,
    pub tables: Tables,
    pub metadata: SnapshotMetadata,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub created_at_ms: u64,
    pub record_count: usize,
}

impl StoreSnapshot {
    pub fn new(tables: Tables) -> Self {
        let record_count = tables.values().map(|t| t.len()).sum();
        let created_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            version: 1,
            tables,
            metadata: SnapshotMetadata {
                created_at_ms,
                record_count,
            },
        }
    }
}

/// Reads and writes snapshot files for one store path.
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<StoreSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&self.path)
            .map_err(|e| StoreError::PersistenceFailed(format!("Failed to read snapshot: {}", e)))?;
        if bytes.is_empty() {
            return Ok(None);
        }
        let snapshot = rmp_serde::from_slice(&bytes).map_err(|e| {
            StoreError::PersistenceFailed(format!("Failed to decode snapshot: {}", e))
        })?;
        Ok(Some(snapshot))
    }

    pub fn write(&self, snapshot: &StoreSnapshot) -> Result<()> {
        let bytes = rmp_serde::to_vec(snapshot).map_err(|e| {
            StoreError::PersistenceFailed(format!("Failed to serialize snapshot: {}", e))
        })?;

        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent).map_err(|e| {
            StoreError::PersistenceFailed(format!("Failed to create snapshot directory: {}", e))
        })?;

        let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(|e| {
            StoreError::PersistenceFailed(format!("Failed to create temp snapshot: {}", e))
        })?;
        temp.write_all(&bytes).map_err(|e| {
            StoreError::PersistenceFailed(format!("Failed to write snapshot: {}", e))
        })?;
        temp.persist(&self.path).map_err(|e| {
            StoreError::PersistenceFailed(format!("Failed to persist snapshot: {}", e))
        })?;

        debug!(
            path = %self.path.display(),
            records = snapshot.metadata.record_count,
            "snapshot written"
        );
        Ok(())
    }
}

/// Hands snapshots to disk according to the configured durability mode.
pub struct Persister {
    mode: DurabilityMode,
    snapshots: Option<SnapshotStore>,
    tx: Option<mpsc::Sender<StoreSnapshot>>,
    worker: Option<JoinHandle<()>>,
}

impl Persister {
    pub fn new(path: Option<PathBuf>, mode: DurabilityMode) -> Self {
        // No path means memory-only regardless of the requested mode.
        let path = match path {
            Some(path) => path,
            None => {
                return Self {
                    mode: DurabilityMode::None,
                    snapshots: None,
                    tx: None,
                    worker: None,
                }
            }
        };

        match mode {
            DurabilityMode::None => Self {
                mode,
                snapshots: None,
                tx: None,
                worker: None,
            },
            DurabilityMode::Sync => Self {
                mode,
                snapshots: Some(SnapshotStore::new(path)),
                tx: None,
                worker: None,
            },
            DurabilityMode::Async => {
                let store = SnapshotStore::new(path);
                let (tx, rx) = mpsc::channel::<StoreSnapshot>();
                let worker = thread::Builder::new()
                    .name("datastack-persister".into())
                    .spawn(move || Self::run_worker(store, rx))
                    .ok();
                if worker.is_none() {
                    error!("failed to spawn persister thread; snapshots will be dropped");
                }
                Self {
                    mode,
                    snapshots: None,
                    tx: Some(tx),
                    worker,
                }
            }
        }
    }

    fn run_worker(store: SnapshotStore, rx: mpsc::Receiver<StoreSnapshot>) {
        while let Ok(mut snapshot) = rx.recv() {
            // Coalesce to the newest pending snapshot; intermediate states
            // are superseded.
            while let Ok(newer) = rx.try_recv() {
                snapshot = newer;
            }
            if let Err(e) = store.write(&snapshot) {
                error!(error = %e, "background snapshot write failed");
            }
        }
    }

    /// Persists a snapshot. Only `Sync` mode surfaces write failures to the
    /// caller; `Async` failures are logged by the persister thread.
    pub fn persist(&self, snapshot: StoreSnapshot) -> Result<()> {
        match self.mode {
            DurabilityMode::None => Ok(()),
            DurabilityMode::Sync => match &self.snapshots {
                Some(store) => store.write(&snapshot),
                None => Ok(()),
            },
            DurabilityMode::Async => {
                if let Some(tx) = &self.tx {
                    if tx.send(snapshot).is_err() {
                        warn!("persister thread gone; snapshot dropped");
                    }
                }
                Ok(())
            }
        }
    }
}

impl Drop for Persister {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain pending snapshots and
        // exit; joining guarantees the last snapshot reaches disk.
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EntityKind;

    fn sample_tables() -> Tables {
        let mut records = HashMap::new();
        let mut record = Record::new(EntityKind::new("Note"));
        record.set("title", "persisted");
        records.insert(record.id(), record);

        let mut tables = Tables::new();
        tables.insert(EntityKind::new("Note"), records);
        tables
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("data.snapshot"));

        let tables = sample_tables();
        store.write(&StoreSnapshot::new(tables.clone())).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.tables, tables);
        assert_eq!(loaded.metadata.record_count, 1);
    }

    #[test]
    fn test_load_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("absent.snapshot"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_load_corrupt_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.snapshot");
        std::fs::write(&path, b"not msgpack at all").unwrap();

        let store = SnapshotStore::new(path);
        assert!(matches!(
            store.load(),
            Err(StoreError::PersistenceFailed(_))
        ));
    }

    #[test]
    fn test_none_mode_ignores_path_entirely() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.snapshot");

        let persister = Persister::new(Some(path.clone()), DurabilityMode::None);
        persister
            .persist(StoreSnapshot::new(sample_tables()))
            .unwrap();
        assert!(persister.snapshots.is_none());
        assert!(!path.exists());
    }

    #[test]
    fn test_async_persister_flushes_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.snapshot");

        let persister = Persister::new(Some(path.clone()), DurabilityMode::Async);
        persister
            .persist(StoreSnapshot::new(sample_tables()))
            .unwrap();
        drop(persister);

        let loaded = SnapshotStore::new(path).load().unwrap().unwrap();
        assert_eq!(loaded.metadata.record_count, 1);
    }
}
