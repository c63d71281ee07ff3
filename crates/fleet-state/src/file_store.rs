use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::StoreError;
use crate::schema::{RunState, STATE_VERSION};
use crate::storage_traits::{StateStore, StoreResult};

/// File name of the state document inside the state directory.
pub const STATE_FILE_NAME: &str = "run_state.json";

/// Filesystem-backed state store.
///
/// Layout: `<root>/run_state.json`, replaced atomically on every save
/// (temp file in the same directory, fsync, rename, fsync directory).
#[derive(Debug, Clone)]
pub struct FileStateStore {
    root: PathBuf,
    path: PathBuf,
}

impl FileStateStore {
    /// Create a store rooted at `root`. Creates the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let path = root.join(STATE_FILE_NAME);
        Ok(Self { root, path })
    }

    /// Path of the state document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn corrupt(&self, reason: impl Into<String>) -> StoreError {
        StoreError::Corrupt {
            path: self.path.display().to_string(),
            reason: reason.into(),
        }
    }

    fn parse(&self, bytes: &[u8]) -> StoreResult<RunState> {
        let state: RunState =
            serde_json::from_slice(bytes).map_err(|e| self.corrupt(e.to_string()))?;
        if state.version > STATE_VERSION {
            return Err(self.corrupt(format!(
                "unsupported state version {} (max {})",
                state.version, STATE_VERSION
            )));
        }
        let mut last_seq = None;
        for queued in &state.pending_reports {
            if last_seq.is_some_and(|prev| queued.seq <= prev) {
                return Err(self.corrupt("pending report ledger out of order"));
            }
            last_seq = Some(queued.seq);
        }
        if last_seq.is_some_and(|seq| seq >= state.next_report_seq) {
            return Err(self.corrupt("pending report seq ahead of next_report_seq"));
        }
        Ok(state)
    }
}

fn write_atomic(root: &Path, path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut tmp = NamedTempFile::new_in(root)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    // Make the rename itself durable.
    #[cfg(unix)]
    fs::File::open(root)?.sync_all()?;

    Ok(())
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self) -> StoreResult<RunState> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => self.parse(&bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no persisted state, starting fresh");
                Ok(RunState::default())
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn save(&self, state: &RunState) -> StoreResult<()> {
        let data = serde_json::to_vec_pretty(state)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let root = self.root.clone();
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&root, &path, &data))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))??;
        debug!(
            path = %self.path.display(),
            fingerprints = state.fingerprints.len(),
            pending = state.pending_reports.len(),
            "state saved"
        );
        Ok(())
    }

    async fn reset(&self) -> StoreResult<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}
