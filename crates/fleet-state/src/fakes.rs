//! In-memory fakes for storage traits (testing only)
//!
//! `MemoryStateStore` satisfies the `StateStore` contract and lets tests
//! simulate failed writes and corrupted storage.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::schema::RunState;
use crate::storage_traits::{StateStore, StoreResult};

/// In-memory state store with failure injection.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<Option<RunState>>,
    saves: AtomicUsize,
    failing_saves: AtomicUsize,
    corrupt: AtomicBool,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an already persisted state.
    pub fn with_state(state: RunState) -> Self {
        let store = Self::default();
        *store.state.lock().unwrap() = Some(state);
        store
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Make the next `n` saves fail without touching the stored state.
    pub fn fail_next_saves(&self, n: usize) {
        self.failing_saves.store(n, Ordering::SeqCst);
    }

    /// Make every subsequent `load` report corruption.
    pub fn mark_corrupt(&self) {
        self.corrupt.store(true, Ordering::SeqCst);
    }

    /// Currently persisted state (default if never saved).
    pub fn snapshot(&self) -> RunState {
        self.state.lock().unwrap().clone().unwrap_or_default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> StoreResult<RunState> {
        if self.corrupt.load(Ordering::SeqCst) {
            return Err(StoreError::Corrupt {
                path: self.location(),
                reason: "marked corrupt".to_string(),
            });
        }
        Ok(self.snapshot())
    }

    async fn save(&self, state: &RunState) -> StoreResult<()> {
        let failing = self.failing_saves.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_saves.store(failing - 1, Ordering::SeqCst);
            return Err(StoreError::Injected("save failed".to_string()));
        }
        *self.state.lock().unwrap() = Some(state.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reset(&self) -> StoreResult<()> {
        *self.state.lock().unwrap() = None;
        self.corrupt.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}
