use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};

use wayfare_core::contracts::RunPersistence;
use wayfare_core::error::{Result, WayfareError};
use wayfare_core::progress::RunProgress;
use wayfare_core::types::{RunId, UserContext};

/// Durable run store backed by SQLite.
///
/// The loop saves the aggregate every iteration; writing each of those to
/// disk would hammer the database for no benefit, so saves land in a dirty
/// buffer and `finalize_save` commits them in one transaction. A crash
/// loses at most the buffered iterations since the last flush, and the run
/// resumes from the last committed aggregate.
pub struct SqliteRunStore {
    conn: Mutex<Connection>,
    dirty: Mutex<HashMap<RunId, (String, String)>>,
}

impl SqliteRunStore {
    /// Open or create the run database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| WayfareError::Persistence(format!("failed to open run store: {e}")))?;
        Self::init(conn)
    }

    /// Fully in-memory database, mainly for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| WayfareError::Persistence(format!("failed to open run store: {e}")))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS runs (
                 run_id TEXT PRIMARY KEY,
                 owner_id TEXT NOT NULL,
                 progress_json TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_runs_owner ON runs(owner_id);",
        )
        .map_err(|e| WayfareError::Persistence(format!("failed to initialize run schema: {e}")))?;

        Ok(Self {
            conn: Mutex::new(conn),
            dirty: Mutex::new(HashMap::new()),
        })
    }

    fn flush(&self, clear_cache: bool) -> Result<()> {
        let mut dirty = self.dirty.lock().unwrap_or_else(|e| e.into_inner());
        if dirty.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn
            .transaction()
            .map_err(|e| WayfareError::Persistence(format!("failed to begin transaction: {e}")))?;
        let now = Utc::now().to_rfc3339();
        for (run_id, (owner_id, json)) in dirty.iter() {
            tx.execute(
                "INSERT INTO runs (run_id, owner_id, progress_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(run_id) DO UPDATE SET
                     owner_id = excluded.owner_id,
                     progress_json = excluded.progress_json,
                     updated_at = excluded.updated_at",
                params![run_id.0, owner_id, json, now],
            )
            .map_err(|e| WayfareError::Persistence(format!("failed to write run {run_id}: {e}")))?;
        }
        tx.commit()
            .map_err(|e| WayfareError::Persistence(format!("failed to commit runs: {e}")))?;
        tracing::debug!(runs = dirty.len(), "flushed run store");
        if clear_cache {
            dirty.clear();
        }
        Ok(())
    }
}

impl RunPersistence for SqliteRunStore {
    fn load_progress<'a>(
        &'a self,
        run_id: &'a RunId,
        user: &'a UserContext,
    ) -> BoxFuture<'a, Result<Option<RunProgress>>> {
        Box::pin(async move {
            let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
            let row: Option<(String, String)> = conn
                .query_row(
                    "SELECT owner_id, progress_json FROM runs WHERE run_id = ?1",
                    params![run_id.0],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(|e| {
                    WayfareError::Persistence(format!("failed to load run {run_id}: {e}"))
                })?;

            let Some((owner_id, json)) = row else {
                return Ok(None);
            };
            if owner_id != user.user_id {
                return Ok(None);
            }
            let progress: RunProgress = serde_json::from_str(&json)?;
            Ok(Some(progress))
        })
    }

    fn save_progress<'a>(&'a self, run: &'a RunProgress) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let json = serde_json::to_string(run)?;
            self.dirty
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(run.run_id.clone(), (run.owner.user_id.clone(), json));
            Ok(())
        })
    }

    fn finalize_save(&self, clear_cache: bool) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.flush(clear_cache) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;
    use wayfare_core::config::RunConfig;
    use wayfare_core::progress::LATEST_RUN_PROGRESS_VERSION;
    use wayfare_core::types::{RunMetrics, RunStatus, RunType};

    fn sample_run(user_id: &str) -> RunProgress {
        RunProgress {
            version: LATEST_RUN_PROGRESS_VERSION,
            run_id: RunId::new(),
            run_type: RunType::RunRoutine,
            status: RunStatus::InProgress,
            status_reason: None,
            config: RunConfig::default(),
            branches: vec![],
            subcontexts: Map::new(),
            decisions: Map::new(),
            metrics: RunMetrics::default(),
            failed_branch_count: 0,
            owner: UserContext::new(user_id),
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.db");
        let user = UserContext::new("u1");
        let run = sample_run("u1");

        {
            let store = SqliteRunStore::open(&path).unwrap();
            store.save_progress(&run).await.unwrap();
            store.finalize_save(true).await.unwrap();
        }

        // Reopen: only flushed state survives.
        let store = SqliteRunStore::open(&path).unwrap();
        let loaded = store.load_progress(&run.run_id, &user).await.unwrap();
        assert!(loaded.is_some());
        assert_eq!(loaded.unwrap().run_id, run.run_id);
    }

    #[tokio::test]
    async fn test_unflushed_saves_are_not_durable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.db");
        let user = UserContext::new("u1");
        let run = sample_run("u1");

        {
            let store = SqliteRunStore::open(&path).unwrap();
            store.save_progress(&run).await.unwrap();
            // No finalize: simulated crash.
        }

        let store = SqliteRunStore::open(&path).unwrap();
        assert!(store.load_progress(&run.run_id, &user).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_keeps_latest() {
        let store = SqliteRunStore::in_memory().unwrap();
        let mut run = sample_run("u1");

        store.save_progress(&run).await.unwrap();
        store.finalize_save(true).await.unwrap();

        run.status = RunStatus::Paused;
        store.save_progress(&run).await.unwrap();
        store.finalize_save(true).await.unwrap();

        let loaded = store
            .load_progress(&run.run_id, &UserContext::new("u1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, RunStatus::Paused);
    }

    #[tokio::test]
    async fn test_owner_scoping() {
        let store = SqliteRunStore::in_memory().unwrap();
        let run = sample_run("u1");
        store.save_progress(&run).await.unwrap();
        store.finalize_save(true).await.unwrap();

        assert!(store
            .load_progress(&run.run_id, &UserContext::new("intruder"))
            .await
            .unwrap()
            .is_none());
    }
}
