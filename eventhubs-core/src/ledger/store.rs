use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{Error, Result};

const STAGING_SUFFIX: &str = ".tmp";

/// Handle to an artifact that has been written but is not yet visible to readers.
#[derive(Debug)]
pub struct StagedArtifact {
    name: String,
}

impl StagedArtifact {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Flat namespace of immutable artifacts the ledger is persisted in. Writing is split into
/// [LocalArtifactStore::stage] and [LocalArtifactStore::publish] so that an artifact only becomes
/// visible once it is complete.
#[trait_variant::make(ArtifactStore: Send)]
pub trait LocalArtifactStore {
    /// Durably writes `data` under a fresh staging name. Staged artifacts are never listed.
    async fn stage(&self, data: Bytes) -> Result<StagedArtifact>;

    /// Atomically makes a staged artifact visible as `name`.
    async fn publish(&self, staged: StagedArtifact, name: &str) -> Result<()>;

    /// Names of all published artifacts, in no particular order.
    async fn list(&self) -> Result<Vec<String>>;

    async fn read(&self, name: &str) -> Result<Bytes>;

    async fn delete(&self, name: &str) -> Result<()>;

    /// Removes staging leftovers of writes that never got published, returns how many were removed.
    async fn cleanup_staged(&self) -> Result<usize>;
}

/// [ArtifactStore] backed by a local (or mounted) directory. Publishing is a `rename`, which is
/// atomic within a filesystem.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    base_path: PathBuf,
}

impl FsArtifactStore {
    pub async fn new(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        tokio::fs::create_dir_all(&base_path).await.map_err(|e| {
            Error::CheckpointWrite(format!(
                "failed to create checkpoint directory {}: {e}",
                base_path.display()
            ))
        })?;
        Ok(Self { base_path })
    }

    async fn sync_dir(&self) -> std::io::Result<()> {
        tokio::fs::File::open(&self.base_path).await?.sync_all().await
    }
}

impl ArtifactStore for FsArtifactStore {
    async fn stage(&self, data: Bytes) -> Result<StagedArtifact> {
        let name = format!(".{}{STAGING_SUFFIX}", uuid::Uuid::new_v4());
        let path = self.base_path.join(&name);

        let write = async {
            let mut file = tokio::fs::File::create(&path).await?;
            file.write_all(&data).await?;
            file.sync_all().await
        };
        write.await.map_err(|e| {
            Error::CheckpointWrite(format!("failed to stage {}: {e}", path.display()))
        })?;

        debug!(path = %path.display(), bytes = data.len(), "Staged checkpoint artifact");
        Ok(StagedArtifact { name })
    }

    async fn publish(&self, staged: StagedArtifact, name: &str) -> Result<()> {
        let from = self.base_path.join(&staged.name);
        let to = self.base_path.join(name);
        tokio::fs::rename(&from, &to).await.map_err(|e| {
            Error::CheckpointWrite(format!(
                "failed to publish {} as {}: {e}",
                from.display(),
                to.display()
            ))
        })?;
        // the rename itself has to survive a crash
        self.sync_dir().await.map_err(|e| {
            Error::CheckpointWrite(format!("failed to sync {}: {e}", self.base_path.display()))
        })
    }

    async fn list(&self) -> Result<Vec<String>> {
        let unreadable = |e: std::io::Error| Error::CorruptCheckpoint {
            artifact: self.base_path.display().to_string(),
            reason: format!("failed to list checkpoint directory: {e}"),
        };

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base_path)
            .await
            .map_err(unreadable)?;
        while let Some(entry) = entries.next_entry().await.map_err(unreadable)? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !name.ends_with(STAGING_SUFFIX) {
                names.push(name);
            }
        }
        Ok(names)
    }

    async fn read(&self, name: &str) -> Result<Bytes> {
        let path = self.base_path.join(name);
        tokio::fs::read(&path)
            .await
            .map(Bytes::from)
            .map_err(|e| Error::CorruptCheckpoint {
                artifact: name.to_string(),
                reason: format!("failed to read {}: {e}", path.display()),
            })
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let path = self.base_path.join(name);
        tokio::fs::remove_file(&path).await.map_err(|e| {
            Error::CheckpointWrite(format!("failed to delete {}: {e}", path.display()))
        })
    }

    async fn cleanup_staged(&self) -> Result<usize> {
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.base_path)
            .await
            .map_err(|e| Error::CheckpointWrite(e.to_string()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::CheckpointWrite(e.to_string()))?
        {
            let is_staged = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.ends_with(STAGING_SUFFIX));
            if is_staged {
                tokio::fs::remove_file(entry.path())
                    .await
                    .map_err(|e| Error::CheckpointWrite(e.to_string()))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    staged: HashMap<String, Bytes>,
    published: BTreeMap<String, Bytes>,
}

/// In-memory [ArtifactStore]. Cloning shares the underlying state, which lets tests "restart" a
/// ledger over the same artifacts and inject write failures.
#[derive(Debug, Clone, Default)]
pub struct InMemoryArtifactStore {
    state: Arc<parking_lot::Mutex<MemoryState>>,
    fail_stage: Arc<AtomicBool>,
    fail_publish: Arc<AtomicBool>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `stage` fail until reset.
    pub fn set_fail_stage(&self, fail: bool) {
        self.fail_stage.store(fail, Ordering::Relaxed);
    }

    /// Makes every subsequent `publish` fail until reset. The staged artifact is left behind, as
    /// it would be after a crash between the two steps.
    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::Relaxed);
    }

    /// Overwrites a published artifact with arbitrary bytes.
    pub fn put_raw(&self, name: &str, data: Bytes) {
        self.state.lock().published.insert(name.to_string(), data);
    }

    /// Number of staged, never published artifacts.
    pub fn staged_count(&self) -> usize {
        self.state.lock().staged.len()
    }
}

impl ArtifactStore for InMemoryArtifactStore {
    async fn stage(&self, data: Bytes) -> Result<StagedArtifact> {
        if self.fail_stage.load(Ordering::Relaxed) {
            return Err(Error::CheckpointWrite("injected stage failure".to_string()));
        }
        let name = format!(".{}{STAGING_SUFFIX}", uuid::Uuid::new_v4());
        self.state.lock().staged.insert(name.clone(), data);
        Ok(StagedArtifact { name })
    }

    async fn publish(&self, staged: StagedArtifact, name: &str) -> Result<()> {
        if self.fail_publish.load(Ordering::Relaxed) {
            return Err(Error::CheckpointWrite(
                "injected publish failure".to_string(),
            ));
        }
        let mut state = self.state.lock();
        let data = state.staged.remove(&staged.name).ok_or_else(|| {
            Error::CheckpointWrite(format!("staged artifact {} not found", staged.name))
        })?;
        state.published.insert(name.to_string(), data);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().published.keys().cloned().collect())
    }

    async fn read(&self, name: &str) -> Result<Bytes> {
        self.state
            .lock()
            .published
            .get(name)
            .cloned()
            .ok_or_else(|| Error::CorruptCheckpoint {
                artifact: name.to_string(),
                reason: "artifact not found".to_string(),
            })
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.state.lock().published.remove(name);
        Ok(())
    }

    async fn cleanup_staged(&self) -> Result<usize> {
        let mut state = self.state.lock();
        let removed = state.staged.len();
        state.staged.clear();
        Ok(removed)
    }
}
