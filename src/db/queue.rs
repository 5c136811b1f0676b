//! The priority queue: `QueueItem` CRUD, priority reordering, and the
//! internal `stage`/`version` bookkeeping the queue manager relies on.
//!
//! `stage` and `version` are not part of the public [`QueueItem`] shape —
//! they're queue-manager-internal (current pipeline stage, optimistic
//! concurrency counter for priority mutations) and live only in this module.

use crate::error::{Error, Result};
use crate::types::{JobId, Priority, QueueItem, Stage};
use sqlx::FromRow;

use super::Database;

#[derive(FromRow)]
struct QueueItemRow {
    id: String,
    file_name: String,
    job_name: String,
    created_at: i64,
    category: Option<String>,
    priority: i64,
    pause_until: Option<i64>,
    post_processing: i64,
    total_segment_bytes: i64,
}

impl QueueItemRow {
    fn into_queue_item(self) -> Result<QueueItem> {
        Ok(QueueItem {
            id: self
                .id
                .parse()
                .map_err(|e| Error::Other(format!("corrupt queue item id: {e}")))?,
            file_name: self.file_name,
            job_name: self.job_name,
            created_at: super::ts_to_datetime(self.created_at),
            category: self.category,
            priority: priority_from_i64(self.priority)?,
            pause_until: self.pause_until.map(super::ts_to_datetime),
            post_processing: self.post_processing as i32,
            total_segment_bytes: self.total_segment_bytes,
        })
    }
}

fn priority_from_i64(v: i64) -> Result<Priority> {
    Ok(match v {
        0 => Priority::Low,
        1 => Priority::Normal,
        2 => Priority::High,
        3 => Priority::Force,
        other => return Err(Error::Other(format!("unknown priority value {other}"))),
    })
}

fn stage_str(stage: Stage) -> &'static str {
    match stage {
        Stage::Queued => "queued",
        Stage::Parsing => "parsing",
        Stage::Importing => "importing",
        Stage::Verifying => "verifying",
        Stage::Done => "done",
        Stage::Failed => "failed",
    }
}

fn parse_stage(s: &str) -> Result<Stage> {
    Ok(match s {
        "queued" => Stage::Queued,
        "parsing" => Stage::Parsing,
        "importing" => Stage::Importing,
        "verifying" => Stage::Verifying,
        "done" => Stage::Done,
        "failed" => Stage::Failed,
        other => return Err(Error::Other(format!("unknown queue stage {other}"))),
    })
}

impl Database {
    /// Enqueue a new job with its raw NZB contents. Fails with
    /// [`Error::StoreConflict`] if `file_name` is already in use.
    pub async fn add_queue_item(&self, item: &QueueItem, nzb_contents: &str) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        let existing: Option<String> =
            sqlx::query_scalar("SELECT id FROM queue_items WHERE file_name = ?")
                .bind(&item.file_name)
                .fetch_optional(&mut *tx)
                .await?;
        if existing.is_some() {
            return Err(Error::StoreConflict(format!(
                "a queue item named {} already exists",
                item.file_name
            )));
        }

        sqlx::query(
            "INSERT INTO queue_items (
                id, file_name, job_name, created_at, category, priority, pause_until,
                post_processing, total_segment_bytes, stage, version
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'queued', 0)",
        )
        .bind(item.id.to_string())
        .bind(&item.file_name)
        .bind(&item.job_name)
        .bind(item.created_at.timestamp())
        .bind(&item.category)
        .bind(item.priority as i64)
        .bind(item.pause_until.map(|t| t.timestamp()))
        .bind(item.post_processing as i64)
        .bind(item.total_segment_bytes)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO queue_nzb_contents (id, nzb_contents) VALUES (?, ?)")
            .bind(item.id.to_string())
            .bind(nzb_contents)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// List every queued job ordered by `(priority DESC, created_at ASC)` —
    /// the order the queue manager processes them in.
    pub async fn list_queue(&self) -> Result<Vec<QueueItem>> {
        let rows = sqlx::query_as::<_, QueueItemRow>(
            "SELECT id, file_name, job_name, created_at, category, priority, pause_until,
                    post_processing, total_segment_bytes
             FROM queue_items ORDER BY priority DESC, created_at ASC",
        )
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(QueueItemRow::into_queue_item).collect()
    }

    /// Fetch one queue item by id.
    pub async fn get_queue_item(&self, id: JobId) -> Result<Option<QueueItem>> {
        let row = sqlx::query_as::<_, QueueItemRow>(
            "SELECT id, file_name, job_name, created_at, category, priority, pause_until,
                    post_processing, total_segment_bytes
             FROM queue_items WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(self.pool())
        .await?;
        row.map(QueueItemRow::into_queue_item).transpose()
    }

    /// The next job eligible for processing: highest priority, oldest first,
    /// skipping anything still paused and anything not in `Queued` stage.
    pub async fn next_eligible_queue_item(&self) -> Result<Option<QueueItem>> {
        let now = super::now_ts();
        let row = sqlx::query_as::<_, QueueItemRow>(
            "SELECT id, file_name, job_name, created_at, category, priority, pause_until,
                    post_processing, total_segment_bytes
             FROM queue_items
             WHERE stage = 'queued' AND (pause_until IS NULL OR pause_until <= ?)
             ORDER BY priority DESC, created_at ASC
             LIMIT 1",
        )
        .bind(now)
        .fetch_optional(self.pool())
        .await?;
        row.map(QueueItemRow::into_queue_item).transpose()
    }

    /// Raw NZB contents for a queued job, as supplied at ingest time.
    pub async fn get_queue_nzb_contents(&self, id: JobId) -> Result<Option<String>> {
        let contents: Option<String> =
            sqlx::query_scalar("SELECT nzb_contents FROM queue_nzb_contents WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(self.pool())
                .await?;
        Ok(contents)
    }

    /// Move a queue item's pipeline stage forward. The queue manager calls
    /// this at each state-machine transition; it is not part of the public API.
    pub async fn set_queue_stage(&self, id: JobId, stage: Stage) -> Result<()> {
        sqlx::query("UPDATE queue_items SET stage = ? WHERE id = ?")
            .bind(stage_str(stage))
            .bind(id.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Current pipeline stage of a queue item, for the queue manager to
    /// resume correctly after a restart.
    pub async fn get_queue_stage(&self, id: JobId) -> Result<Option<Stage>> {
        let s: Option<String> = sqlx::query_scalar("SELECT stage FROM queue_items WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await?;
        s.map(|s| parse_stage(&s)).transpose()
    }

    /// Reset every `importing`/`parsing`/`verifying` job back to `queued` on
    /// startup — mirrors the teacher's "resume in-flight downloads" behavior,
    /// adapted to the single-writer contract (nothing was actually in flight
    /// across a process restart, so every such row is just requeued).
    pub async fn restore_queue(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE queue_items SET stage = 'queued'
             WHERE stage IN ('parsing', 'importing', 'verifying')",
        )
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Change a job's priority. `Force` means "move to top": the new
    /// `created_at` is set earlier than every other row's so the ordering
    /// still resolves to this item first. Moving to `Low` ("bottom") sets
    /// `created_at` to a sentinel later than every other row's, so later
    /// `Low`-priority arrivals (with a smaller, real `created_at`) still
    /// sort above it instead of bumping it off the bottom.
    pub async fn set_priority(&self, id: JobId, priority: Priority) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        let exists: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM queue_items WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&mut *tx)
        .await?;
        if exists.is_none() {
            return Err(Error::NotFound(format!("queue item {id}")));
        }

        match priority {
            Priority::Force => {
                let min_created: Option<i64> =
                    sqlx::query_scalar("SELECT MIN(created_at) FROM queue_items")
                        .fetch_one(&mut *tx)
                        .await?;
                let new_created = min_created.unwrap_or_else(super::now_ts) - 1;
                sqlx::query(
                    "UPDATE queue_items SET priority = ?, created_at = ? WHERE id = ?",
                )
                .bind(Priority::Force as i64)
                .bind(new_created)
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
            }
            Priority::Low => {
                let max_created: Option<i64> =
                    sqlx::query_scalar("SELECT MAX(created_at) FROM queue_items")
                        .fetch_one(&mut *tx)
                        .await?;
                let new_created = max_created.unwrap_or_else(super::now_ts) + 1;
                sqlx::query(
                    "UPDATE queue_items SET priority = ?, created_at = ? WHERE id = ?",
                )
                .bind(Priority::Low as i64)
                .bind(new_created)
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
            }
            _ => {
                sqlx::query("UPDATE queue_items SET priority = ? WHERE id = ?")
                    .bind(priority as i64)
                    .bind(id.to_string())
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Remove one or more queue items outright (cancellation, not promotion).
    /// Returns the ids that were actually present.
    pub async fn remove_queue_items(&self, ids: &[JobId]) -> Result<Vec<JobId>> {
        let mut removed = Vec::with_capacity(ids.len());
        let mut tx = self.pool().begin().await?;
        for id in ids {
            let result = sqlx::query("DELETE FROM queue_items WHERE id = ?")
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() > 0 {
                removed.push(*id);
            }
        }
        tx.commit().await?;
        Ok(removed)
    }
}
