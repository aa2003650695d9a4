//! BackupManager — create and restore content-addressed snapshots.

use std::path::PathBuf;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use cutover_state::{BackupRecord, StateError, StateStore, epoch_secs};

/// Errors from backup creation or restore.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("capture failed for agent {agent_id}: {message}")]
    CaptureFailed { agent_id: String, message: String },

    #[error("backup blob io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backup blob missing: {0}")]
    MissingBlob(String),

    #[error("digest mismatch for backup {digest}")]
    DigestMismatch { digest: String },

    #[error("restore failed for agent {agent_id}: {message}")]
    RestoreFailed { agent_id: String, message: String },

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

/// The boundary to an agent's deployable state.
///
/// Implementations capture everything needed to put the agent back on
/// its pre-upgrade version, and replay such a capture on restore.
pub trait SnapshotSource: Send + Sync {
    fn capture(&self, agent_id: &str) -> Result<Vec<u8>, BackupError>;
    fn restore(&self, agent_id: &str, bytes: &[u8]) -> Result<(), BackupError>;
}

/// File-per-agent snapshot source: the agent's deployable state is the
/// blob at `<root>/<agent_id>`.
pub struct FileSnapshotSource {
    root: PathBuf,
}

impl FileSnapshotSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl SnapshotSource for FileSnapshotSource {
    fn capture(&self, agent_id: &str) -> Result<Vec<u8>, BackupError> {
        std::fs::read(self.root.join(agent_id)).map_err(|e| BackupError::CaptureFailed {
            agent_id: agent_id.to_string(),
            message: e.to_string(),
        })
    }

    fn restore(&self, agent_id: &str, bytes: &[u8]) -> Result<(), BackupError> {
        std::fs::write(self.root.join(agent_id), bytes).map_err(|e| BackupError::RestoreFailed {
            agent_id: agent_id.to_string(),
            message: e.to_string(),
        })
    }
}

/// Creates and restores durable, content-addressed backups.
pub struct BackupManager {
    root: PathBuf,
    store: StateStore,
    source: Arc<dyn SnapshotSource>,
}

impl BackupManager {
    pub fn new(
        root: impl Into<PathBuf>,
        store: StateStore,
        source: Arc<dyn SnapshotSource>,
    ) -> Result<Self, BackupError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            store,
            source,
        })
    }

    /// Capture an agent's state and persist it under its content digest.
    ///
    /// Idempotent: a capture identical to an existing backup reuses the
    /// existing blob.
    pub async fn create(&self, agent_id: &str, version: &str) -> Result<BackupRecord, BackupError> {
        let bytes = self.source.capture(agent_id)?;
        let digest = hex::encode(Sha256::digest(&bytes));
        let path = self.root.join(&digest);

        if tokio::fs::try_exists(&path).await? {
            debug!(%agent_id, %digest, "backup blob already present, reusing");
        } else {
            // Write-then-rename so a crash never leaves a half-written blob
            // under its final digest name.
            let tmp = self.root.join(format!("{digest}.tmp"));
            tokio::fs::write(&tmp, &bytes).await?;
            tokio::fs::rename(&tmp, &path).await?;
        }

        let record = BackupRecord {
            digest: digest.clone(),
            agent_id: agent_id.to_string(),
            version: version.to_string(),
            size_bytes: bytes.len() as u64,
            created_at: epoch_secs(),
        };
        self.store.put_backup(&record)?;
        info!(%agent_id, %version, %digest, size = record.size_bytes, "backup created");
        Ok(record)
    }

    /// Restore an agent from a backup record.
    ///
    /// Verifies the blob against the record's digest before replaying it.
    /// Failures here are fatal to the calling session and escalate to
    /// manual intervention; this method never retries.
    pub async fn restore(&self, record: &BackupRecord) -> Result<(), BackupError> {
        let path = self.root.join(&record.digest);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(agent_id = %record.agent_id, digest = %record.digest, "backup blob missing");
                return Err(BackupError::MissingBlob(record.digest.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        let digest = hex::encode(Sha256::digest(&bytes));
        if digest != record.digest {
            warn!(agent_id = %record.agent_id, expected = %record.digest, actual = %digest, "backup digest mismatch");
            return Err(BackupError::DigestMismatch {
                digest: record.digest.clone(),
            });
        }

        self.source.restore(&record.agent_id, &bytes)?;
        info!(agent_id = %record.agent_id, version = %record.version, "agent restored from backup");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &std::path::Path) -> (BackupManager, Arc<FileSnapshotSource>) {
        let agents = dir.join("agents");
        std::fs::create_dir_all(&agents).unwrap();
        let source = Arc::new(FileSnapshotSource::new(&agents));
        let store = StateStore::open_in_memory().unwrap();
        let manager = BackupManager::new(dir.join("backups"), store, source.clone()).unwrap();
        (manager, source)
    }

    fn seed_agent(dir: &std::path::Path, agent_id: &str, contents: &[u8]) {
        std::fs::write(dir.join("agents").join(agent_id), contents).unwrap();
    }

    #[tokio::test]
    async fn create_is_content_addressed() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager(dir.path());
        seed_agent(dir.path(), "agent-1", b"state v1");

        let record = manager.create("agent-1", "1.0.0").await.unwrap();
        assert_eq!(
            record.digest,
            hex::encode(Sha256::digest(b"state v1"))
        );
        assert!(dir.path().join("backups").join(&record.digest).exists());
    }

    #[tokio::test]
    async fn identical_backup_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager(dir.path());
        seed_agent(dir.path(), "agent-1", b"state v1");

        let first = manager.create("agent-1", "1.0.0").await.unwrap();
        let second = manager.create("agent-1", "1.0.0").await.unwrap();
        assert_eq!(first.digest, second.digest);

        let blobs = std::fs::read_dir(dir.path().join("backups")).unwrap().count();
        assert_eq!(blobs, 1);
    }

    #[tokio::test]
    async fn restore_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager(dir.path());
        seed_agent(dir.path(), "agent-1", b"state v1");

        let record = manager.create("agent-1", "1.0.0").await.unwrap();

        // The upgrade mangles the agent's state.
        seed_agent(dir.path(), "agent-1", b"broken v2");
        manager.restore(&record).await.unwrap();

        let restored = std::fs::read(dir.path().join("agents").join("agent-1")).unwrap();
        assert_eq!(restored, b"state v1");
    }

    #[tokio::test]
    async fn restore_rejects_corrupted_blob() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager(dir.path());
        seed_agent(dir.path(), "agent-1", b"state v1");

        let record = manager.create("agent-1", "1.0.0").await.unwrap();
        std::fs::write(dir.path().join("backups").join(&record.digest), b"tampered").unwrap();

        let err = manager.restore(&record).await.unwrap_err();
        assert!(matches!(err, BackupError::DigestMismatch { .. }));
    }

    #[tokio::test]
    async fn restore_missing_blob_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager(dir.path());
        seed_agent(dir.path(), "agent-1", b"state v1");

        let record = manager.create("agent-1", "1.0.0").await.unwrap();
        std::fs::remove_file(dir.path().join("backups").join(&record.digest)).unwrap();

        let err = manager.restore(&record).await.unwrap_err();
        assert!(matches!(err, BackupError::MissingBlob(_)));
    }

    #[tokio::test]
    async fn create_fails_for_unknown_agent() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager(dir.path());

        let err = manager.create("agent-missing", "1.0.0").await.unwrap_err();
        assert!(matches!(err, BackupError::CaptureFailed { .. }));
    }

    #[tokio::test]
    async fn record_is_persisted_in_store() {
        let dir = tempfile::tempdir().unwrap();
        let agents = dir.path().join("agents");
        std::fs::create_dir_all(&agents).unwrap();
        std::fs::write(agents.join("agent-1"), b"state v1").unwrap();

        let store = StateStore::open_in_memory().unwrap();
        let manager = BackupManager::new(
            dir.path().join("backups"),
            store.clone(),
            Arc::new(FileSnapshotSource::new(&agents)),
        )
        .unwrap();

        let record = manager.create("agent-1", "1.0.0").await.unwrap();
        let loaded = store.get_backup("agent-1", &record.digest).unwrap();
        assert_eq!(loaded, Some(record));
    }
}
