//! In-memory owner of the agent's `RunState`.
//!
//! The run task and the background report flusher both touch the state:
//! the run commits fingerprints, the flusher acknowledges reports. Both go
//! through one `tokio::sync::Mutex`, and every persisted snapshot is taken
//! and saved under that lock so an older snapshot can never overwrite a
//! newer one on disk.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use fleet_state::{RunState, StateStore};

use crate::domain::error::Result;

pub struct StateKeeper {
    store: Arc<dyn StateStore>,
    state: Mutex<RunState>,
}

impl StateKeeper {
    /// Load the persisted state. A corrupt document is a fatal error.
    pub async fn open(store: Arc<dyn StateStore>) -> Result<Self> {
        let state = store.load().await?;
        debug!(
            location = %store.location(),
            fingerprints = state.fingerprints.len(),
            pending_reports = state.pending_reports.len(),
            "run state loaded"
        );
        Ok(Self {
            store,
            state: Mutex::new(state),
        })
    }

    pub fn location(&self) -> String {
        self.store.location()
    }

    pub async fn snapshot(&self) -> RunState {
        self.state.lock().await.clone()
    }

    pub async fn read<R>(&self, f: impl FnOnce(&RunState) -> R) -> R {
        f(&*self.state.lock().await)
    }

    /// Change the in-memory state without persisting it.
    pub async fn mutate<R>(&self, f: impl FnOnce(&mut RunState) -> R) -> R {
        f(&mut *self.state.lock().await)
    }

    /// Change the state and persist it before returning. On a failed save
    /// the in-memory change is kept; the next successful save carries it.
    pub async fn update<R>(&self, f: impl FnOnce(&mut RunState) -> R) -> Result<R> {
        let mut state = self.state.lock().await;
        let value = f(&mut state);
        self.store.save(&state).await?;
        Ok(value)
    }

    pub async fn persist(&self) -> Result<()> {
        self.update(|_| ()).await
    }

    /// Fold a finished run into the current state and persist it.
    ///
    /// Only run-owned fields are taken from `run`; the pending ledger keeps
    /// whatever the flusher did while the run was in flight.
    pub async fn commit_run(&self, run: &RunState) -> Result<()> {
        self.update(|state| {
            state.fingerprints = run.fingerprints.clone();
            state.last_run_at = run.last_run_at;
            if run.last_applied_commit_id.is_some() {
                state.last_applied_commit_id = run.last_applied_commit_id.clone();
            }
        })
        .await
    }

    /// Forget everything. The next run re-applies every item.
    pub async fn reset(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.store.reset().await?;
        *state = RunState::new();
        info!(location = %self.store.location(), "run state reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_state::fakes::MemoryStateStore;
    use fleet_state::{CommitId, Fingerprint, ItemKey};

    #[tokio::test]
    async fn commit_keeps_concurrent_ledger_changes() {
        let store = Arc::new(MemoryStateStore::new());
        let keeper = StateKeeper::open(store.clone()).await.unwrap();
        let mut run = keeper.snapshot().await;

        keeper.mutate(|s| s.next_report_seq = 42).await;

        run.record(ItemKey::new("settings", "hostname"), Fingerprint::from_raw("a"));
        run.last_applied_commit_id = Some(CommitId::new("c1"));
        keeper.commit_run(&run).await.unwrap();

        let saved = store.snapshot();
        assert_eq!(saved.next_report_seq, 42);
        assert_eq!(saved.fingerprints.len(), 1);
        assert_eq!(saved.last_applied_commit_id, Some(CommitId::new("c1")));
    }

    #[tokio::test]
    async fn commit_without_new_commit_keeps_the_old_one() {
        let mut initial = RunState::new();
        initial.last_applied_commit_id = Some(CommitId::new("c0"));
        let store = Arc::new(MemoryStateStore::with_state(initial));
        let keeper = StateKeeper::open(store.clone()).await.unwrap();

        let mut run = keeper.snapshot().await;
        run.last_applied_commit_id = None;
        keeper.commit_run(&run).await.unwrap();
        assert_eq!(store.snapshot().last_applied_commit_id, Some(CommitId::new("c0")));
    }

    #[tokio::test]
    async fn failed_save_keeps_memory_change() {
        let store = Arc::new(MemoryStateStore::new());
        let keeper = StateKeeper::open(store.clone()).await.unwrap();
        store.fail_next_saves(1);
        assert!(keeper.update(|s| s.next_report_seq = 7).await.is_err());
        assert_eq!(keeper.read(|s| s.next_report_seq).await, 7);
        keeper.persist().await.unwrap();
        assert_eq!(store.snapshot().next_report_seq, 7);
    }

    #[tokio::test]
    async fn corrupt_store_is_fatal() {
        let store = Arc::new(MemoryStateStore::new());
        store.mark_corrupt();
        let err = StateKeeper::open(store).await.err().unwrap();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn reset_clears_memory_and_store() {
        let store = Arc::new(MemoryStateStore::new());
        let keeper = StateKeeper::open(store.clone()).await.unwrap();
        keeper.update(|s| s.next_report_seq = 3).await.unwrap();
        keeper.reset().await.unwrap();
        assert_eq!(keeper.snapshot().await, RunState::new());
        assert_eq!(store.snapshot(), RunState::new());
    }
}
