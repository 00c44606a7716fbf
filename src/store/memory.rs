//! In-process run store guarded by a single mutex.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{CreateOrFind, NewRun, RunMutation, RunStore, RunUpdate, StoreError};
use crate::domain::{AttemptLogEntry, IdempotencyKey, ScenarioRun};

#[derive(Default)]
struct Inner {
    runs: HashMap<String, ScenarioRun>,
    by_key: HashMap<IdempotencyKey, String>,
    attempts: HashMap<String, Vec<AttemptLogEntry>>,
}

/// Run store held in memory; used by tests and embedders without a database
#[derive(Default)]
pub struct MemoryRunStore {
    inner: Mutex<Inner>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    fn create_or_find_sync(&self, new: NewRun) -> Result<CreateOrFind, StoreError> {
        let mut inner = self.lock()?;

        if let Some(run_id) = inner.by_key.get(&new.key) {
            if let Some(run) = inner.runs.get(run_id) {
                return Ok(CreateOrFind {
                    run: run.clone(),
                    created: false,
                });
            }
        }

        let mut run = ScenarioRun::new(Uuid::new_v4().to_string(), &new.key, new.connection_id);
        run.node_id = new.node_id;

        inner.by_key.insert(new.key, run.run_id.clone());
        inner.runs.insert(run.run_id.clone(), run.clone());

        Ok(CreateOrFind { run, created: true })
    }

    fn update_sync(&self, run_id: &str, mutation: RunMutation) -> Result<RunUpdate, StoreError> {
        let mut inner = self.lock()?;

        let Some(run) = inner.runs.get_mut(run_id) else {
            return Ok(RunUpdate::NotFound);
        };

        let mut candidate = run.clone();
        if !mutation(&mut candidate) {
            return Ok(RunUpdate::Unchanged(candidate));
        }

        candidate.updated_at = Utc::now();
        *run = candidate.clone();
        Ok(RunUpdate::Updated(candidate))
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create_or_find_run(&self, new: NewRun) -> Result<CreateOrFind, StoreError> {
        self.create_or_find_sync(new)
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<ScenarioRun>, StoreError> {
        Ok(self.lock()?.runs.get(run_id).cloned())
    }

    async fn update_run(
        &self,
        run_id: &str,
        mutation: RunMutation,
    ) -> Result<RunUpdate, StoreError> {
        self.update_sync(run_id, mutation)
    }

    async fn append_attempt(&self, entry: &AttemptLogEntry) -> Result<(), StoreError> {
        self.lock()?
            .attempts
            .entry(entry.run_id.clone())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn attempts(&self, run_id: &str) -> Result<Vec<AttemptLogEntry>, StoreError> {
        Ok(self
            .lock()?
            .attempts
            .get(run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<ScenarioRun>, StoreError> {
        let mut runs: Vec<ScenarioRun> = self.lock()?.runs.values().cloned().collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs.truncate(limit);
        Ok(runs)
    }
}
