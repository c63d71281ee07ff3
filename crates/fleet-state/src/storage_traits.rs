//! Storage trait definitions for the fleet agent
//!
//! `StateStore` persists the single [`RunState`] document. Backends must
//! make `save` atomic and durable: after it returns `Ok`, a crash leaves
//! either the previous or the new document on disk, never a mix.
//!
//! In-memory fakes are provided for testing via the `fakes` module.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::schema::RunState;

/// Result type for storage operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Durable home of the agent's run state.
///
/// Guarantees:
/// - `load` on a fresh store returns `RunState::default()`.
/// - `save` is atomic and synced before returning.
/// - `reset` removes all state; the next `load` behaves like a fresh store.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the persisted state, or the default state if none exists.
    async fn load(&self) -> StoreResult<RunState>;

    /// Atomically replace the persisted state.
    async fn save(&self, state: &RunState) -> StoreResult<()>;

    /// Delete the persisted state. No-op if absent.
    async fn reset(&self) -> StoreResult<()>;

    /// Human-readable location, for log lines.
    fn location(&self) -> String;
}
