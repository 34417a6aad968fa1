//! Snapshot storage
//!
//! Snapshots live in memory and every change is written through to one JSON
//! file per snapshot, so a restart picks up where Workbench left off.

use crate::error::WorkbenchError;
use crate::snapshot::{Document, PatchKind, Snapshot};
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct SnapshotStore {
    dir: PathBuf,
    snapshots: RwLock<HashMap<Uuid, Snapshot>>,
}

impl SnapshotStore {
    /// Open the store in `dir`, loading every snapshot persisted there.
    pub async fn load(dir: PathBuf) -> Result<Self, WorkbenchError> {
        tokio::fs::create_dir_all(&dir).await?;

        let mut snapshots = HashMap::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_snapshot(&path).await {
                Ok((uuid, snapshot)) => {
                    snapshots.insert(uuid, snapshot);
                }
                Err(e) => warn!(path = ?path, error = %e, "Skipping unreadable snapshot"),
            }
        }

        info!(dir = ?dir, count = snapshots.len(), "Snapshot store loaded");

        Ok(Self {
            dir,
            snapshots: RwLock::new(snapshots),
        })
    }

    /// Merge a patch into the snapshot, creating it on its first phase.
    pub async fn patch(
        &self,
        uuid: Uuid,
        patch: Value,
        total_phases: u64,
    ) -> Result<(Snapshot, PatchKind), WorkbenchError> {
        let mut snapshots = self.snapshots.write().await;
        let now = Utc::now();

        let mut snapshot = snapshots
            .get(&uuid)
            .cloned()
            .unwrap_or_else(|| Snapshot::new(uuid, total_phases, now));
        let kind = snapshot.apply_patch(patch, now)?;

        self.persist(&uuid, &snapshot).await?;
        snapshots.insert(uuid, snapshot.clone());

        Ok((snapshot, kind))
    }

    pub async fn get(&self, uuid: &Uuid) -> Option<Snapshot> {
        self.snapshots.read().await.get(uuid).cloned()
    }

    /// Every snapshot, oldest first.
    pub async fn list(&self) -> Vec<Snapshot> {
        let mut all: Vec<Snapshot> = self.snapshots.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.created().cmp(b.created()));
        all
    }

    /// Apply `f` to an existing snapshot and persist the result.
    pub async fn update<F>(&self, uuid: &Uuid, f: F) -> Result<Snapshot, WorkbenchError>
    where
        F: FnOnce(&mut Snapshot),
    {
        let mut snapshots = self.snapshots.write().await;
        let mut snapshot = snapshots
            .get(uuid)
            .cloned()
            .ok_or_else(|| WorkbenchError::SnapshotNotFound(uuid.to_string()))?;

        f(&mut snapshot);

        self.persist(uuid, &snapshot).await?;
        snapshots.insert(*uuid, snapshot.clone());
        Ok(snapshot)
    }

    /// Attach device identifiers from the dashboard and link the snapshot.
    pub async fn tag(&self, uuid: &Uuid, fields: Document) -> Result<Snapshot, WorkbenchError> {
        self.update(uuid, |s| s.tag(fields, Utc::now())).await
    }

    pub async fn remove(&self, uuid: &Uuid) -> Result<(), WorkbenchError> {
        let mut snapshots = self.snapshots.write().await;
        if snapshots.remove(uuid).is_none() {
            return Err(WorkbenchError::SnapshotNotFound(uuid.to_string()));
        }
        match tokio::fs::remove_file(self.path_of(uuid)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn path_of(&self, uuid: &Uuid) -> PathBuf {
        self.dir.join(format!("{uuid}.json"))
    }

    async fn persist(&self, uuid: &Uuid, snapshot: &Snapshot) -> Result<(), WorkbenchError> {
        let path = self.path_of(uuid);
        write_atomic(&path, &serde_json::to_vec(snapshot)?).await?;
        debug!(path = ?path, "Snapshot persisted");
        Ok(())
    }
}

/// Write through a sibling temp file so a crash never leaves `path` truncated.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

async fn read_snapshot(path: &Path) -> Result<(Uuid, Snapshot), WorkbenchError> {
    let bytes = tokio::fs::read(path).await?;
    let doc: Document = serde_json::from_slice(&bytes)?;
    let snapshot = Snapshot::from_document(doc)?;
    let uuid = Uuid::parse_str(snapshot.uuid())
        .map_err(|e| WorkbenchError::Internal(e.to_string()))?;
    Ok((uuid, snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::DEFAULT_TOTAL_PHASES;
    use serde_json::json;

    #[tokio::test]
    async fn patches_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let uuid = Uuid::new_v4();

        let store = SnapshotStore::load(dir.path().to_path_buf()).await.unwrap();
        store
            .patch(uuid, json!({"device": {"serialNumber": "S1"}}), DEFAULT_TOTAL_PHASES)
            .await
            .unwrap();
        let (snapshot, kind) = store
            .patch(uuid, json!({"tests": []}), DEFAULT_TOTAL_PHASES)
            .await
            .unwrap();
        assert_eq!(kind, PatchKind::Phase(2));
        drop(store);

        let reopened = SnapshotStore::load(dir.path().to_path_buf()).await.unwrap();
        assert_eq!(reopened.get(&uuid).await.unwrap(), snapshot);
    }

    #[tokio::test]
    async fn invalid_first_patch_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::load(dir.path().to_path_buf()).await.unwrap();
        let uuid = Uuid::new_v4();

        let result = store.patch(uuid, json!("nope"), DEFAULT_TOTAL_PHASES).await;
        assert!(result.is_err());
        assert!(store.get(&uuid).await.is_none());
    }

    #[tokio::test]
    async fn unreadable_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("garbage.json"), b"{not json").unwrap();
        std::fs::write(dir.path().join("nouuid.json"), b"{}").unwrap();

        let store = SnapshotStore::load(dir.path().to_path_buf()).await.unwrap();
        assert!(store.list().await.is_empty());
    }

    #[tokio::test]
    async fn remove_and_update_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::load(dir.path().to_path_buf()).await.unwrap();
        let uuid = Uuid::new_v4();

        assert!(matches!(
            store.remove(&uuid).await,
            Err(WorkbenchError::SnapshotNotFound(_))
        ));
        assert!(store.update(&uuid, |_| {}).await.is_err());

        store.patch(uuid, json!({}), DEFAULT_TOTAL_PHASES).await.unwrap();
        store.remove(&uuid).await.unwrap();
        assert!(!dir.path().join(format!("{uuid}.json")).exists());
    }

    #[tokio::test]
    async fn list_is_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::load(dir.path().to_path_buf()).await.unwrap();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        store.patch(first, json!({}), DEFAULT_TOTAL_PHASES).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.patch(second, json!({}), DEFAULT_TOTAL_PHASES).await.unwrap();

        let uuids: Vec<String> = store.list().await.iter().map(|s| s.uuid().to_string()).collect();
        assert_eq!(uuids, vec![first.to_string(), second.to_string()]);
    }

    #[tokio::test]
    async fn write_atomic_replaces_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("names.json");
        std::fs::write(&path, b"{\"old\": \"a much longer previous content\"}").unwrap();

        write_atomic(&path, b"{}").await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"{}");
        assert!(!dir.path().join("names.json.tmp").exists());
    }
}
