//! Durable run-state storage with optimistic concurrency.
//!
//! Every write is a compare-and-swap on [`RunState::version`]: the caller
//! hands back the record it last read, and the store accepts it only if no
//! one else wrote in between. The accepted copy comes back with the version
//! bumped and `updated_at` refreshed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tokio::sync::RwLock;

use prepflow_types::{PrepflowError, Result, RunState};

#[async_trait]
pub trait RunStateStore: Send + Sync {
    /// Persist a new record at version 1. Fails if the id is taken.
    async fn create(&self, state: RunState) -> Result<RunState>;

    async fn load(&self, run_id: &str) -> Result<RunState>;

    /// Compare-and-swap write: the stored version must equal `state.version`.
    async fn save(&self, state: RunState) -> Result<RunState>;

    /// All records, oldest first.
    async fn list(&self) -> Result<Vec<RunState>>;
}

fn stamp_created(mut state: RunState) -> RunState {
    state.version = 1;
    state.updated_at = Utc::now();
    state
}

fn check_version(stored: &RunState, incoming: &RunState) -> Result<()> {
    if stored.version != incoming.version {
        return Err(PrepflowError::ConcurrentModification {
            run_id: incoming.run_id.clone(),
            expected: incoming.version,
            found: stored.version,
        });
    }
    Ok(())
}

fn bump(mut state: RunState) -> RunState {
    state.version += 1;
    state.updated_at = Utc::now();
    state
}

// ---------------------------------------------------------------------------
// MemoryRunStore
// ---------------------------------------------------------------------------

/// In-process store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    runs: RwLock<HashMap<String, RunState>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStateStore for MemoryRunStore {
    async fn create(&self, state: RunState) -> Result<RunState> {
        let mut runs = self.runs.write().await;
        if let Some(existing) = runs.get(&state.run_id) {
            return Err(PrepflowError::ConcurrentModification {
                run_id: state.run_id.clone(),
                expected: 0,
                found: existing.version,
            });
        }
        let state = stamp_created(state);
        runs.insert(state.run_id.clone(), state.clone());
        Ok(state)
    }

    async fn load(&self, run_id: &str) -> Result<RunState> {
        self.runs
            .read()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| PrepflowError::RunNotFound(run_id.to_string()))
    }

    async fn save(&self, state: RunState) -> Result<RunState> {
        let mut runs = self.runs.write().await;
        let stored = runs
            .get(&state.run_id)
            .ok_or_else(|| PrepflowError::RunNotFound(state.run_id.clone()))?;
        check_version(stored, &state)?;
        let state = bump(state);
        runs.insert(state.run_id.clone(), state.clone());
        Ok(state)
    }

    async fn list(&self) -> Result<Vec<RunState>> {
        let mut all: Vec<RunState> = self.runs.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.run_id.cmp(&b.run_id)));
        Ok(all)
    }
}

// ---------------------------------------------------------------------------
// SqliteRunStore
// ---------------------------------------------------------------------------

/// Durable store backed by one SQLite database, `<root>/runs.db`.
///
/// The compare-and-swap is a single conditional `UPDATE` on the version
/// column, so it holds across store instances and across processes sharing
/// the same database file.
#[derive(Debug, Clone)]
pub struct SqliteRunStore {
    pool: SqlitePool,
    path: PathBuf,
}

const DB_FILE: &str = "runs.db";

fn storage(e: sqlx::Error) -> PrepflowError {
    PrepflowError::Storage(e.to_string())
}

impl SqliteRunStore {
    /// Open (creating if needed) the database under `root`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        tokio::fs::create_dir_all(root).await?;
        let path = root.join(DB_FILE);

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(storage)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                run_id      TEXT    PRIMARY KEY,
                version     INTEGER NOT NULL,
                created_at  TEXT    NOT NULL,
                body        TEXT    NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(storage)?;

        tracing::debug!(path = %path.display(), "Run store opened");
        Ok(Self { pool, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn stored_version(&self, run_id: &str) -> Result<Option<u64>> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT version FROM runs WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        Ok(row.map(|(v,)| v as u64))
    }
}

#[async_trait]
impl RunStateStore for SqliteRunStore {
    async fn create(&self, state: RunState) -> Result<RunState> {
        let state = stamp_created(state);
        let body = serde_json::to_string(&state)?;
        let result = sqlx::query(
            "INSERT INTO runs (run_id, version, created_at, body) VALUES (?, ?, ?, ?)
             ON CONFLICT(run_id) DO NOTHING",
        )
        .bind(&state.run_id)
        .bind(state.version as i64)
        .bind(state.created_at.to_rfc3339())
        .bind(&body)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        if result.rows_affected() == 0 {
            let found = self.stored_version(&state.run_id).await?.unwrap_or_default();
            return Err(PrepflowError::ConcurrentModification {
                run_id: state.run_id.clone(),
                expected: 0,
                found,
            });
        }
        Ok(state)
    }

    async fn load(&self, run_id: &str) -> Result<RunState> {
        let row: Option<(String,)> = sqlx::query_as("SELECT body FROM runs WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        let (body,) = row.ok_or_else(|| PrepflowError::RunNotFound(run_id.to_string()))?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn save(&self, state: RunState) -> Result<RunState> {
        let expected = state.version;
        let state = bump(state);
        let body = serde_json::to_string(&state)?;
        let result = sqlx::query(
            "UPDATE runs SET body = ?, version = ? WHERE run_id = ? AND version = ?",
        )
        .bind(&body)
        .bind(state.version as i64)
        .bind(&state.run_id)
        .bind(expected as i64)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        if result.rows_affected() == 0 {
            return match self.stored_version(&state.run_id).await? {
                None => Err(PrepflowError::RunNotFound(state.run_id.clone())),
                Some(found) => Err(PrepflowError::ConcurrentModification {
                    run_id: state.run_id.clone(),
                    expected,
                    found,
                }),
            };
        }
        tracing::debug!(run_id = %state.run_id, version = state.version, "Run state written");
        Ok(state)
    }

    async fn list(&self) -> Result<Vec<RunState>> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT run_id, body FROM runs")
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        let mut all = Vec::with_capacity(rows.len());
        for (run_id, body) in rows {
            match serde_json::from_str::<RunState>(&body) {
                Ok(state) => all.push(state),
                Err(e) => tracing::warn!(run_id = %run_id, error = %e, "Skipping unreadable run record"),
            }
        }
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.run_id.cmp(&b.run_id)));
        Ok(all)
    }
}
