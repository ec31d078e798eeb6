//! Durable registry of instance records, persisted as one JSON document.

use deacon_common::{DeaconError, InstanceRecord, Result};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

type Records = BTreeMap<String, InstanceRecord>;

/// Name -> record map backed by a single file.
///
/// Every mutation rewrites the whole file through a temp file and rename,
/// while still holding the write lock, so writes land in mutation order and
/// a reader of the file never sees a partial document. If the write fails
/// the in-memory change is kept and the caller gets `DeaconError::Persistence`.
pub struct StateStore {
    path: PathBuf,
    records: RwLock<Records>,
}

impl StateStore {
    /// Loads the registry from `path`. A missing file is an empty registry.
    /// A file that exists but cannot be parsed is an error so that it is
    /// never silently overwritten.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Records>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No state file yet, starting empty");
                Records::new()
            }
            Err(e) => return Err(DeaconError::Io(e)),
        };
        info!(path = %path.display(), instances = records.len(), "Loaded instance state");
        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, name: &str) -> Option<InstanceRecord> {
        self.records.read().await.get(name).cloned()
    }

    /// All records, ordered by name.
    pub async fn snapshot(&self) -> Vec<InstanceRecord> {
        self.records.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Inserts or replaces the record keyed by `record.name` and persists.
    pub async fn upsert(&self, record: InstanceRecord) -> Result<()> {
        let mut records = self.records.write().await;
        records.insert(record.name.clone(), record);
        self.persist(&records).await
    }

    async fn persist(&self, records: &Records) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(records)?;
        let path = self.path.clone();
        let written = tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(|e| DeaconError::Persistence {
                path: self.path.display().to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e),
            })?;

        match written {
            Ok(()) => {
                debug!(path = %self.path.display(), instances = records.len(), "State persisted");
                Ok(())
            }
            Err(source) => {
                error!(
                    path = %self.path.display(),
                    error = %source,
                    "Failed to persist state; in-memory state will not survive restart"
                );
                Err(DeaconError::Persistence {
                    path: self.path.display().to_string(),
                    source,
                })
            }
        }
    }
}

/// Replaces `target` with `data` via a sibling temp file, fsync and rename.
fn write_atomic(target: &Path, data: &[u8]) -> std::io::Result<()> {
    let parent = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;

    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(data)?;
    temp.as_file().sync_all()?;
    temp.persist(target).map_err(|e| e.error)?;
    Ok(())
}
