//! SQLite-backed run store.
//!
//! Runs are stored as JSON documents next to the columns needed for lookups.
//! The UNIQUE `(scenario_id, trigger_key, correlation_id)` constraint plus an
//! immediate transaction make create-or-find atomic across connections.
//! rusqlite is synchronous, so every store call runs on tokio's blocking
//! pool and never stalls a runtime worker.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use uuid::Uuid;

use super::{CreateOrFind, NewRun, RunMutation, RunStore, RunUpdate, StoreError};
use crate::domain::{AttemptLogEntry, ScenarioRun};

#[derive(Clone)]
pub struct SqliteRunStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRunStore {
    /// Open (or create) a database file and ensure the schema exists
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("sqlite run store lock poisoned".to_string()))
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS scenario_runs (
              run_id TEXT PRIMARY KEY,
              scenario_id TEXT NOT NULL,
              trigger_key TEXT NOT NULL,
              correlation_id TEXT NOT NULL,
              status TEXT NOT NULL,
              created_at_ms INTEGER NOT NULL,
              updated_at_ms INTEGER NOT NULL,
              record_json TEXT NOT NULL,
              UNIQUE(scenario_id, trigger_key, correlation_id)
            );
            CREATE TABLE IF NOT EXISTS attempt_log (
              seq INTEGER PRIMARY KEY AUTOINCREMENT,
              entry_id TEXT NOT NULL UNIQUE,
              run_id TEXT NOT NULL,
              attempt_no INTEGER NOT NULL,
              status TEXT NOT NULL,
              entry_json TEXT NOT NULL,
              created_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_scenario_runs_created ON scenario_runs(created_at_ms DESC);
            CREATE INDEX IF NOT EXISTS idx_attempt_log_run ON attempt_log(run_id, seq);
            "#,
        )?;
        Ok(())
    }

    fn create_or_find_sync(&self, new: NewRun) -> Result<CreateOrFind, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut candidate =
            ScenarioRun::new(Uuid::new_v4().to_string(), &new.key, new.connection_id);
        candidate.node_id = new.node_id;

        let inserted = tx.execute(
            "INSERT INTO scenario_runs
             (run_id, scenario_id, trigger_key, correlation_id, status, created_at_ms, updated_at_ms, record_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7)
             ON CONFLICT(scenario_id, trigger_key, correlation_id) DO NOTHING",
            params![
                candidate.run_id,
                candidate.scenario_id,
                candidate.trigger_key,
                candidate.correlation_id,
                candidate.status.as_str(),
                candidate.created_at.timestamp_millis(),
                serde_json::to_string(&candidate)?,
            ],
        )?;

        let record_json: String = tx.query_row(
            "SELECT record_json FROM scenario_runs
             WHERE scenario_id = ?1 AND trigger_key = ?2 AND correlation_id = ?3",
            params![new.key.scenario_id, new.key.trigger_key, new.key.correlation_id],
            |row| row.get(0),
        )?;
        tx.commit()?;

        Ok(CreateOrFind {
            run: serde_json::from_str(&record_json)?,
            created: inserted == 1,
        })
    }

    fn get_sync(&self, run_id: &str) -> Result<Option<ScenarioRun>, StoreError> {
        let conn = self.lock()?;
        let record_json: Option<String> = conn
            .query_row(
                "SELECT record_json FROM scenario_runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;

        record_json
            .map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    fn update_sync(&self, run_id: &str, mutation: RunMutation) -> Result<RunUpdate, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let record_json: Option<String> = tx
            .query_row(
                "SELECT record_json FROM scenario_runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(record_json) = record_json else {
            return Ok(RunUpdate::NotFound);
        };

        let mut run: ScenarioRun = serde_json::from_str(&record_json)?;
        if !mutation(&mut run) {
            return Ok(RunUpdate::Unchanged(run));
        }

        run.updated_at = Utc::now();
        tx.execute(
            "UPDATE scenario_runs SET status = ?2, updated_at_ms = ?3, record_json = ?4 WHERE run_id = ?1",
            params![
                run_id,
                run.status.as_str(),
                run.updated_at.timestamp_millis(),
                serde_json::to_string(&run)?,
            ],
        )?;
        tx.commit()?;

        Ok(RunUpdate::Updated(run))
    }

    fn append_sync(&self, entry: &AttemptLogEntry) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let status = serde_json::to_value(entry.status)?;
        conn.execute(
            "INSERT INTO attempt_log (entry_id, run_id, attempt_no, status, entry_json, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.id.to_string(),
                entry.run_id,
                entry.attempt,
                status.as_str().unwrap_or_default(),
                serde_json::to_string(entry)?,
                Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    fn attempts_sync(&self, run_id: &str) -> Result<Vec<AttemptLogEntry>, StoreError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT entry_json FROM attempt_log WHERE run_id = ?1 ORDER BY seq")?;
        let rows = stmt.query_map(params![run_id], |row| row.get::<_, String>(0))?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(serde_json::from_str(&row?)?);
        }
        Ok(entries)
    }

    /// Run `op` against this store on the blocking pool
    async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteRunStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| StoreError::Unavailable(format!("sqlite task failed: {}", e)))?
    }

    fn list_sync(&self, limit: usize) -> Result<Vec<ScenarioRun>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT record_json FROM scenario_runs ORDER BY created_at_ms DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;

        let mut runs = Vec::new();
        for row in rows {
            runs.push(serde_json::from_str(&row?)?);
        }
        Ok(runs)
    }
}

#[async_trait]
impl RunStore for SqliteRunStore {
    async fn create_or_find_run(&self, new: NewRun) -> Result<CreateOrFind, StoreError> {
        self.blocking(move |store| store.create_or_find_sync(new)).await
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<ScenarioRun>, StoreError> {
        let run_id = run_id.to_string();
        self.blocking(move |store| store.get_sync(&run_id)).await
    }

    async fn update_run(
        &self,
        run_id: &str,
        mutation: RunMutation,
    ) -> Result<RunUpdate, StoreError> {
        let run_id = run_id.to_string();
        self.blocking(move |store| store.update_sync(&run_id, mutation)).await
    }

    async fn append_attempt(&self, entry: &AttemptLogEntry) -> Result<(), StoreError> {
        let entry = entry.clone();
        self.blocking(move |store| store.append_sync(&entry)).await
    }

    async fn attempts(&self, run_id: &str) -> Result<Vec<AttemptLogEntry>, StoreError> {
        let run_id = run_id.to_string();
        self.blocking(move |store| store.attempts_sync(&run_id)).await
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<ScenarioRun>, StoreError> {
        self.blocking(move |store| store.list_sync(limit)).await
    }
}
