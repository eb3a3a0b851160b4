//! SQLite-based run history store

use crate::core::Verdict;
use crate::persistence::{PersistenceBackend, RunSummary};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqliteRow};
use sqlx::Row;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const COLUMNS: &str = "id, pipeline, event_name, git_ref, actor, verdict, started_at, finished_at, \
                       succeeded, failed, skipped, cancelled";

/// SQLite run store
pub struct SqliteRunStore {
    pool: SqlitePool,
}

impl SqliteRunStore {
    /// Open (or create) a store at the given path
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    /// Default database location under the user's local data directory
    pub fn default_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ci-engine")
            .join("runs.db")
    }

    /// Create store with default path
    pub async fn with_default_path() -> Result<Self> {
        let path = Self::default_path();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Self::new(path).await
    }

    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                pipeline TEXT NOT NULL,
                event_name TEXT NOT NULL,
                git_ref TEXT NOT NULL,
                actor TEXT NOT NULL,
                verdict TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                succeeded INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                skipped INTEGER NOT NULL DEFAULT 0,
                cancelled INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_runs_pipeline ON runs(pipeline);
            CREATE INDEX IF NOT EXISTS idx_runs_started_at ON runs(started_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize schema")?;

        Ok(())
    }

    fn to_naive(dt: DateTime<Utc>) -> NaiveDateTime {
        dt.naive_utc()
    }

    fn from_naive(dt: NaiveDateTime) -> DateTime<Utc> {
        DateTime::from_naive_utc_and_offset(dt, Utc)
    }

    fn from_row(row: &SqliteRow) -> Result<RunSummary> {
        let verdict: String = row.get("verdict");
        Ok(RunSummary {
            run_id: Uuid::parse_str(&row.get::<String, _>("id"))?,
            pipeline: row.get("pipeline"),
            event_name: row.get("event_name"),
            git_ref: row.get("git_ref"),
            actor: row.get("actor"),
            verdict: Verdict::parse(&verdict).ok_or_else(|| anyhow!("Unknown verdict '{}'", verdict))?,
            started_at: Self::from_naive(row.get("started_at")),
            finished_at: Self::from_naive(row.get("finished_at")),
            succeeded: row.get::<i64, _>("succeeded") as usize,
            failed: row.get::<i64, _>("failed") as usize,
            skipped: row.get::<i64, _>("skipped") as usize,
            cancelled: row.get::<i64, _>("cancelled") as usize,
        })
    }
}

#[async_trait::async_trait]
impl PersistenceBackend for SqliteRunStore {
    async fn save_run(&self, run: &RunSummary) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO runs
            (id, pipeline, event_name, git_ref, actor, verdict, started_at, finished_at,
             succeeded, failed, skipped, cancelled)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(run.run_id.to_string())
        .bind(&run.pipeline)
        .bind(&run.event_name)
        .bind(&run.git_ref)
        .bind(&run.actor)
        .bind(run.verdict.as_str())
        .bind(Self::to_naive(run.started_at))
        .bind(Self::to_naive(run.finished_at))
        .bind(run.succeeded as i64)
        .bind(run.failed as i64)
        .bind(run.skipped as i64)
        .bind(run.cancelled as i64)
        .execute(&self.pool)
        .await
        .context("Failed to save run")?;

        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<RunSummary>> {
        let row = sqlx::query(&format!("SELECT {} FROM runs WHERE id = ?1", COLUMNS))
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load run")?;

        row.as_ref().map(Self::from_row).transpose()
    }

    async fn list_runs(&self, pipeline: Option<&str>, limit: usize) -> Result<Vec<RunSummary>> {
        let rows = match pipeline {
            Some(name) => {
                sqlx::query(&format!(
                    "SELECT {} FROM runs WHERE pipeline = ?1 ORDER BY started_at DESC LIMIT ?2",
                    COLUMNS
                ))
                .bind(name)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM runs ORDER BY started_at DESC LIMIT ?1",
                    COLUMNS
                ))
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("Failed to list runs")?;

        rows.iter().map(Self::from_row).collect()
    }

    async fn list_pipelines(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT pipeline FROM runs ORDER BY pipeline ASC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list pipelines")?;

        Ok(rows.iter().map(|row| row.get("pipeline")).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::tests::summary;

    #[tokio::test]
    async fn test_sqlite_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteRunStore::new(dir.path().join("runs.db")).await.unwrap();

        let older = summary("ci", 10, Verdict::Failure);
        let newer = summary("ci", 1, Verdict::NoMatch);
        store.save_run(&older).await.unwrap();
        store.save_run(&newer).await.unwrap();
        store.save_run(&summary("release", 5, Verdict::Success)).await.unwrap();

        let loaded = store.load_run(older.run_id).await.unwrap().unwrap();
        assert_eq!(loaded.pipeline, "ci");
        assert_eq!(loaded.verdict, Verdict::Failure);
        assert_eq!(loaded.skipped, 1);

        let ci = store.list_runs(Some("ci"), 10).await.unwrap();
        assert_eq!(ci.len(), 2);
        assert_eq!(ci[0].run_id, newer.run_id);
        assert_eq!(ci[0].verdict, Verdict::NoMatch);

        assert_eq!(store.list_runs(None, 2).await.unwrap().len(), 2);
        assert_eq!(store.list_pipelines().await.unwrap(), vec!["ci", "release"]);
        assert!(store.load_run(Uuid::new_v4()).await.unwrap().is_none());
    }
}
