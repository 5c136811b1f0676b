//! Database lifecycle and schema migrations.
//!
//! Mirrors the teacher's `db::migrations`: a `schema_version` table tracks
//! which numbered migration has been applied, each migration runs inside
//! its own transaction, and `runtime_state` records a `clean_shutdown` flag
//! so a future health-check collaborator can detect a prior crash.

use crate::error::{Error, Result};
use sqlx::SqliteConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use std::path::Path;
use std::str::FromStr;

use super::Database;

impl Database {
    /// Open (creating if missing) the metadata database at `path` and bring
    /// its schema up to date.
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| Error::Config {
                message: format!("invalid database path: {e}"),
                key: Some("database_path".into()),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(options).await?;
        let db = Self { pool };
        db.run_migrations().await?;
        db.set_clean_start().await?;
        Ok(db)
    }

    /// Build a handle over an already-open pool (used by tests to share an
    /// in-memory database across assertions).
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )",
        )
        .execute(&mut *conn)
        .await?;

        let current: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
            .fetch_optional(&mut *conn)
            .await?;
        let current = current.unwrap_or(0);

        if current < 1 {
            Self::migrate_v1(&mut conn).await?;
        }
        if current < 2 {
            Self::migrate_v2(&mut conn).await?;
        }

        Ok(())
    }

    /// v1: the logical file tree, queue, history, and provider-accounting tables.
    async fn migrate_v1(conn: &mut SqliteConnection) -> Result<()> {
        tracing::info!("applying metadata store migration v1");
        sqlx::query("BEGIN").execute(&mut *conn).await?;

        let result: Result<()> = async {
            sqlx::query(
                "CREATE TABLE items (
                    id TEXT PRIMARY KEY,
                    parent_id TEXT REFERENCES items(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    path TEXT NOT NULL UNIQUE,
                    kind TEXT NOT NULL,
                    file_size INTEGER,
                    release_date INTEGER NOT NULL,
                    is_corrupted INTEGER NOT NULL DEFAULT 0,
                    corruption_reason TEXT,
                    last_health_check INTEGER,
                    next_health_check INTEGER
                )",
            )
            .execute(&mut *conn)
            .await?;
            sqlx::query("CREATE INDEX idx_items_parent ON items(parent_id)")
                .execute(&mut *conn)
                .await?;

            sqlx::query(
                "CREATE TABLE nzb_files (
                    item_id TEXT PRIMARY KEY REFERENCES items(id) ON DELETE CASCADE,
                    segments TEXT NOT NULL
                )",
            )
            .execute(&mut *conn)
            .await?;

            sqlx::query(
                "CREATE TABLE rar_files (
                    item_id TEXT PRIMARY KEY REFERENCES items(id) ON DELETE CASCADE,
                    rar_parts TEXT NOT NULL,
                    inner_offset_map TEXT NOT NULL
                )",
            )
            .execute(&mut *conn)
            .await?;

            sqlx::query(
                "CREATE TABLE multipart_files (
                    item_id TEXT PRIMARY KEY REFERENCES items(id) ON DELETE CASCADE,
                    file_parts TEXT NOT NULL
                )",
            )
            .execute(&mut *conn)
            .await?;

            sqlx::query(
                "CREATE TABLE queue_items (
                    id TEXT PRIMARY KEY,
                    file_name TEXT NOT NULL UNIQUE,
                    job_name TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    category TEXT,
                    priority INTEGER NOT NULL,
                    pause_until INTEGER,
                    post_processing INTEGER NOT NULL DEFAULT 0,
                    total_segment_bytes INTEGER NOT NULL,
                    stage TEXT NOT NULL DEFAULT 'queued',
                    version INTEGER NOT NULL DEFAULT 0
                )",
            )
            .execute(&mut *conn)
            .await?;
            sqlx::query(
                "CREATE INDEX idx_queue_priority ON queue_items(priority DESC, created_at ASC)",
            )
            .execute(&mut *conn)
            .await?;

            sqlx::query(
                "CREATE TABLE queue_nzb_contents (
                    id TEXT PRIMARY KEY REFERENCES queue_items(id) ON DELETE CASCADE,
                    nzb_contents TEXT NOT NULL
                )",
            )
            .execute(&mut *conn)
            .await?;

            sqlx::query(
                "CREATE TABLE history_items (
                    id TEXT PRIMARY KEY,
                    job_name TEXT NOT NULL,
                    file_name TEXT NOT NULL,
                    category TEXT,
                    status TEXT NOT NULL,
                    nzb_contents TEXT NOT NULL,
                    bytes INTEGER NOT NULL,
                    download_time_ms INTEGER NOT NULL,
                    completed_at INTEGER NOT NULL,
                    is_archived INTEGER NOT NULL DEFAULT 0,
                    archived_at INTEGER,
                    failure_reason TEXT
                )",
            )
            .execute(&mut *conn)
            .await?;
            sqlx::query("CREATE INDEX idx_history_completed ON history_items(completed_at DESC)")
                .execute(&mut *conn)
                .await?;
            sqlx::query(
                "CREATE INDEX idx_history_archived ON history_items(is_archived, archived_at)",
            )
            .execute(&mut *conn)
            .await?;

            sqlx::query(
                "CREATE TABLE provider_stats (
                    job_name TEXT NOT NULL,
                    provider_index INTEGER NOT NULL,
                    successful_segments INTEGER NOT NULL DEFAULT 0,
                    failed_segments INTEGER NOT NULL DEFAULT 0,
                    total_bytes INTEGER NOT NULL DEFAULT 0,
                    total_time_ms INTEGER NOT NULL DEFAULT 0,
                    last_used INTEGER NOT NULL,
                    recent_avg_speed_bps REAL NOT NULL DEFAULT 0.0,
                    PRIMARY KEY (job_name, provider_index)
                )",
            )
            .execute(&mut *conn)
            .await?;

            sqlx::query(
                "CREATE TABLE missing_article_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    filename TEXT NOT NULL,
                    message_id TEXT NOT NULL,
                    provider_index INTEGER NOT NULL,
                    timestamp INTEGER NOT NULL,
                    operation TEXT NOT NULL
                )",
            )
            .execute(&mut *conn)
            .await?;

            Self::record_migration(conn, 1).await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => sqlx::query("COMMIT").execute(&mut *conn).await.map(|_| ())?,
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                return Err(e);
            }
        }
        tracing::info!("metadata store migration v1 complete");
        Ok(())
    }

    /// v2: operator-facing config table and the crash-detection runtime flag.
    async fn migrate_v2(conn: &mut SqliteConnection) -> Result<()> {
        tracing::info!("applying metadata store migration v2");
        sqlx::query("BEGIN").execute(&mut *conn).await?;

        let result: Result<()> = async {
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS config (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                )",
            )
            .execute(&mut *conn)
            .await?;

            sqlx::query(
                "CREATE TABLE IF NOT EXISTS runtime_state (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                )",
            )
            .execute(&mut *conn)
            .await?;

            let now = super::now_ts();
            sqlx::query(
                "INSERT INTO runtime_state (key, value, updated_at)
                 VALUES ('clean_shutdown', 'false', ?)
                 ON CONFLICT(key) DO NOTHING",
            )
            .bind(now)
            .execute(&mut *conn)
            .await?;

            Self::record_migration(conn, 2).await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => sqlx::query("COMMIT").execute(&mut *conn).await.map(|_| ())?,
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                return Err(e);
            }
        }
        tracing::info!("metadata store migration v2 complete");
        Ok(())
    }

    async fn record_migration(conn: &mut SqliteConnection, version: i64) -> Result<()> {
        sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?, ?)")
            .bind(version)
            .bind(super::now_ts())
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Mark the previous shutdown clean and flip `clean_shutdown` back to
    /// `false` so an unclean process exit is detectable on the next startup.
    async fn set_clean_start(&self) -> Result<()> {
        sqlx::query(
            "INSERT INTO runtime_state (key, value, updated_at) VALUES ('clean_shutdown', 'false', ?)
             ON CONFLICT(key) DO UPDATE SET value = 'false', updated_at = excluded.updated_at",
        )
        .bind(super::now_ts())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record an orderly shutdown.
    pub async fn set_clean_shutdown(&self) -> Result<()> {
        sqlx::query(
            "UPDATE runtime_state SET value = 'true', updated_at = ? WHERE key = 'clean_shutdown'",
        )
        .bind(super::now_ts())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Whether the previous process exit was orderly, per `runtime_state`.
    pub async fn was_clean_shutdown(&self) -> Result<bool> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM runtime_state WHERE key = 'clean_shutdown'")
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.as_deref() == Some("true"))
    }

    /// Close the underlying connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
