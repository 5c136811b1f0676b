//! The metadata store: a transactional SQLite-backed persistence layer for
//! every entity in the data model except payload bytes (which this crate
//! never persists). Organized by domain the way the teacher's `db` module
//! is, one submodule per entity family:
//!
//! - [`migrations`] — schema lifecycle, versioned `CREATE TABLE`/`ALTER TABLE` steps
//! - [`items`] — the logical file tree (`Item` plus its per-kind descriptor rows)
//! - [`queue`] — `QueueItem`/`QueueNzbContents` CRUD and priority reordering
//! - [`history`] — promotion, archival, retention sweep, and requeue
//! - [`provider_stats`] — per-`(job, provider)` accounting and missing-article events

use sqlx::sqlite::SqlitePool;

mod history;
mod items;
mod migrations;
mod provider_stats;
mod queue;

#[cfg(test)]
mod tests;

pub use items::{NewFileDescriptor, NewItem};

/// Thin wrapper over a `sqlx::SqlitePool`. Cheap to clone (the pool itself
/// is reference-counted); every collaborator that needs metadata access
/// holds an `Arc<Database>` or a clone of this handle.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// The underlying connection pool, for collaborators (like the queue
    /// manager) that need to run a hand-assembled multi-statement transaction.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

fn ts_to_datetime(ts: i64) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp(ts, 0).unwrap_or_else(chrono::Utc::now)
}
