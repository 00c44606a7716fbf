//! Durable storage for scenario runs and attempt logs.
//!
//! The engine only talks to storage through [`RunStore`]. Run creation and
//! run updates are single atomic read-modify-write operations; the attempt
//! log is append-only.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{AttemptLogEntry, IdempotencyKey, ScenarioRun};

pub use memory::MemoryRunStore;
pub use sqlite::SqliteRunStore;

/// Errors raised by a run store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fields of a run the caller chooses; the store assigns the id
#[derive(Debug, Clone)]
pub struct NewRun {
    pub key: IdempotencyKey,
    pub node_id: Option<String>,
    pub connection_id: Option<String>,
}

/// Result of an atomic create-or-find
#[derive(Debug, Clone)]
pub struct CreateOrFind {
    pub run: ScenarioRun,

    /// True when this call inserted the run
    pub created: bool,
}

/// Result of an atomic read-modify-write on a run
#[derive(Debug, Clone)]
pub enum RunUpdate {
    /// No run with this id
    NotFound,

    /// The mutation declined to write; carries the current record
    Unchanged(ScenarioRun),

    /// The mutation was applied; carries the new record
    Updated(ScenarioRun),
}

impl RunUpdate {
    pub fn run(&self) -> Option<&ScenarioRun> {
        match self {
            Self::NotFound => None,
            Self::Unchanged(run) | Self::Updated(run) => Some(run),
        }
    }

    pub fn is_updated(&self) -> bool {
        matches!(self, Self::Updated(_))
    }
}

/// A mutation applied under the store's write lock.
///
/// Returns `true` if the run was changed and must be written back. Owned so
/// stores can run it on a blocking thread.
pub type RunMutation = Box<dyn FnOnce(&mut ScenarioRun) -> bool + Send>;

/// Transactional store for runs and attempt logs
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert a pending run for `new.key` unless one exists, in one atomic step
    async fn create_or_find_run(&self, new: NewRun) -> Result<CreateOrFind, StoreError>;

    async fn get_run(&self, run_id: &str) -> Result<Option<ScenarioRun>, StoreError>;

    /// Atomically read a run, apply `mutation`, and write it back if changed
    async fn update_run(
        &self,
        run_id: &str,
        mutation: RunMutation,
    ) -> Result<RunUpdate, StoreError>;

    async fn append_attempt(&self, entry: &AttemptLogEntry) -> Result<(), StoreError>;

    /// Attempt log entries for a run in append order
    async fn attempts(&self, run_id: &str) -> Result<Vec<AttemptLogEntry>, StoreError>;

    /// Most recently created runs first
    async fn list_runs(&self, limit: usize) -> Result<Vec<ScenarioRun>, StoreError>;
}
