//! History: promotion from the queue, archive-vs-delete semantics, the
//! retention sweep, and requeue ("retry").

use crate::error::{Error, Result};
use crate::types::{HistoryItem, HistoryStatus, JobId, Priority, QueueItem, Requester};
use sqlx::FromRow;
use std::time::Duration;

use super::Database;

#[derive(FromRow)]
struct HistoryItemRow {
    id: String,
    job_name: String,
    file_name: String,
    category: Option<String>,
    status: String,
    nzb_contents: String,
    bytes: i64,
    download_time_ms: i64,
    completed_at: i64,
    is_archived: bool,
    archived_at: Option<i64>,
    failure_reason: Option<String>,
}

impl HistoryItemRow {
    fn into_history_item(self) -> Result<HistoryItem> {
        Ok(HistoryItem {
            id: self
                .id
                .parse()
                .map_err(|e| Error::Other(format!("corrupt history item id: {e}")))?,
            job_name: self.job_name,
            file_name: self.file_name,
            category: self.category,
            status: parse_status(&self.status)?,
            nzb_contents: self.nzb_contents,
            bytes: self.bytes,
            download_time: Duration::from_millis(self.download_time_ms.max(0) as u64),
            completed_at: super::ts_to_datetime(self.completed_at),
            is_archived: self.is_archived,
            archived_at: self.archived_at.map(super::ts_to_datetime),
            failure_reason: self.failure_reason,
        })
    }
}

fn status_str(status: HistoryStatus) -> &'static str {
    match status {
        HistoryStatus::Completed => "completed",
        HistoryStatus::Failed => "failed",
    }
}

fn parse_status(s: &str) -> Result<HistoryStatus> {
    Ok(match s {
        "completed" => HistoryStatus::Completed,
        "failed" => HistoryStatus::Failed,
        other => return Err(Error::Other(format!("unknown history status {other}"))),
    })
}

impl Database {
    /// Promote a queue item to history and remove it from the queue, in one
    /// transaction. `nzb_contents` is read back from `queue_nzb_contents` so
    /// the caller doesn't need to carry it separately.
    pub async fn promote_queue_to_history(
        &self,
        queue_item: &QueueItem,
        status: HistoryStatus,
        download_time: Duration,
        failure_reason: Option<String>,
    ) -> Result<HistoryItem> {
        let mut tx = self.pool().begin().await?;

        let nzb_contents: Option<String> =
            sqlx::query_scalar("SELECT nzb_contents FROM queue_nzb_contents WHERE id = ?")
                .bind(queue_item.id.to_string())
                .fetch_optional(&mut *tx)
                .await?;
        let nzb_contents = nzb_contents
            .ok_or_else(|| Error::NotFound(format!("queue nzb contents for {}", queue_item.id)))?;

        let history = HistoryItem {
            id: uuid::Uuid::new_v4(),
            job_name: queue_item.job_name.clone(),
            file_name: queue_item.file_name.clone(),
            category: queue_item.category.clone(),
            status,
            nzb_contents,
            bytes: queue_item.total_segment_bytes,
            download_time,
            completed_at: chrono::Utc::now(),
            is_archived: false,
            archived_at: None,
            failure_reason,
        };

        sqlx::query(
            "INSERT INTO history_items (
                id, job_name, file_name, category, status, nzb_contents, bytes,
                download_time_ms, completed_at, is_archived, archived_at, failure_reason
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, NULL, ?)",
        )
        .bind(history.id.to_string())
        .bind(&history.job_name)
        .bind(&history.file_name)
        .bind(&history.category)
        .bind(status_str(history.status))
        .bind(&history.nzb_contents)
        .bind(history.bytes)
        .bind(history.download_time.as_millis() as i64)
        .bind(history.completed_at.timestamp())
        .bind(&history.failure_reason)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM queue_items WHERE id = ?")
            .bind(queue_item.id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(history)
    }

    /// List history entries (most recently completed first), optionally
    /// excluding already-archived rows.
    pub async fn list_history(&self, include_archived: bool) -> Result<Vec<HistoryItem>> {
        let rows = if include_archived {
            sqlx::query_as::<_, HistoryItemRow>(
                "SELECT id, job_name, file_name, category, status, nzb_contents, bytes,
                        download_time_ms, completed_at, is_archived, archived_at, failure_reason
                 FROM history_items ORDER BY completed_at DESC",
            )
            .fetch_all(self.pool())
            .await?
        } else {
            sqlx::query_as::<_, HistoryItemRow>(
                "SELECT id, job_name, file_name, category, status, nzb_contents, bytes,
                        download_time_ms, completed_at, is_archived, archived_at, failure_reason
                 FROM history_items WHERE is_archived = 0 ORDER BY completed_at DESC",
            )
            .fetch_all(self.pool())
            .await?
        };
        rows.into_iter().map(HistoryItemRow::into_history_item).collect()
    }

    /// Fetch one history entry by id.
    pub async fn get_history_item(&self, id: JobId) -> Result<Option<HistoryItem>> {
        let row = sqlx::query_as::<_, HistoryItemRow>(
            "SELECT id, job_name, file_name, category, status, nzb_contents, bytes,
                    download_time_ms, completed_at, is_archived, archived_at, failure_reason
             FROM history_items WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(self.pool())
        .await?;
        row.map(HistoryItemRow::into_history_item).transpose()
    }

    /// Remove a history entry. The operator UI always hard-deletes
    /// immediately; a third-party client's request instead archives the
    /// entry (made invisible to `list_history(false)`, hard-deleted later
    /// by the retention sweep) — see `DESIGN.md` for why this crate
    /// disambiguates on `Requester` rather than inferring from user-agent.
    pub async fn delete_history(&self, id: JobId, requester: Requester) -> Result<()> {
        match requester {
            Requester::Ui => {
                let result = sqlx::query("DELETE FROM history_items WHERE id = ?")
                    .bind(id.to_string())
                    .execute(self.pool())
                    .await?;
                if result.rows_affected() == 0 {
                    return Err(Error::NotFound(format!("history item {id}")));
                }
            }
            Requester::ExternalClient => {
                let result = sqlx::query(
                    "UPDATE history_items SET is_archived = 1, archived_at = ?
                     WHERE id = ? AND is_archived = 0",
                )
                .bind(super::now_ts())
                .bind(id.to_string())
                .execute(self.pool())
                .await?;
                if result.rows_affected() == 0 {
                    return Err(Error::NotFound(format!("history item {id}")));
                }
            }
        }
        Ok(())
    }

    /// Hard-delete every archived history row whose retention window has
    /// elapsed. Returns the number of rows removed.
    pub async fn sweep_expired_history(&self, retention: Duration) -> Result<u64> {
        let cutoff = super::now_ts() - retention.as_secs() as i64;
        let result = sqlx::query(
            "DELETE FROM history_items WHERE is_archived = 1 AND archived_at <= ?",
        )
        .bind(cutoff)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Requeue a history item: re-insert its NZB contents as a fresh queue
    /// item (new id, `Normal` priority, created now) and remove the history
    /// row. If `file_name` collides with a job already in the queue, retries
    /// with `.requeue1`, `.requeue2`, ... appended until one is free.
    pub async fn retry_history_item(&self, id: JobId) -> Result<QueueItem> {
        let history = self
            .get_history_item(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("history item {id}")))?;

        let mut attempt = 0u32;
        let requeued = loop {
            let file_name = if attempt == 0 {
                history.file_name.clone()
            } else {
                format!("{}.requeue{attempt}", history.file_name)
            };

            let candidate = QueueItem {
                id: uuid::Uuid::new_v4(),
                file_name,
                job_name: history.job_name.clone(),
                created_at: chrono::Utc::now(),
                category: history.category.clone(),
                priority: Priority::Normal,
                pause_until: None,
                post_processing: 0,
                total_segment_bytes: history.bytes,
            };

            match self.add_queue_item(&candidate, &history.nzb_contents).await {
                Ok(()) => break candidate,
                Err(Error::StoreConflict(_)) if attempt < 1000 => {
                    attempt += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }
        };

        sqlx::query("DELETE FROM history_items WHERE id = ?")
            .bind(id.to_string())
            .execute(self.pool())
            .await?;

        Ok(requeued)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_db() -> Database {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        Database::from_pool(pool).await.unwrap()
    }

    fn sample_queue_item(file_name: &str) -> QueueItem {
        QueueItem {
            id: uuid::Uuid::new_v4(),
            file_name: file_name.into(),
            job_name: file_name.into(),
            created_at: chrono::Utc::now(),
            category: Some("movies".into()),
            priority: Priority::Normal,
            pause_until: None,
            post_processing: 0,
            total_segment_bytes: 2048,
        }
    }

    #[tokio::test]
    async fn promote_moves_item_from_queue_to_history() {
        let db = test_db().await;
        let item = sample_queue_item("a.nzb");
        db.add_queue_item(&item, "<nzb/>").await.unwrap();

        let history = db
            .promote_queue_to_history(&item, HistoryStatus::Completed, Duration::from_millis(500), None)
            .await
            .unwrap();

        assert!(db.get_queue_item(item.id).await.unwrap().is_none());
        assert_eq!(db.get_history_item(history.id).await.unwrap().unwrap().bytes, 2048);
    }

    #[tokio::test]
    async fn ui_delete_is_immediate_external_client_archives() {
        let db = test_db().await;
        let item = sample_queue_item("a.nzb");
        db.add_queue_item(&item, "<nzb/>").await.unwrap();
        let history = db
            .promote_queue_to_history(&item, HistoryStatus::Completed, Duration::from_millis(1), None)
            .await
            .unwrap();

        db.delete_history(history.id, Requester::ExternalClient)
            .await
            .unwrap();
        let archived = db.get_history_item(history.id).await.unwrap().unwrap();
        assert!(archived.is_archived);
        assert!(db.list_history(false).await.unwrap().is_empty());

        db.delete_history(history.id, Requester::Ui).await.unwrap();
        assert!(db.get_history_item(history.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_archived_rows() {
        let db = test_db().await;
        let item = sample_queue_item("a.nzb");
        db.add_queue_item(&item, "<nzb/>").await.unwrap();
        let history = db
            .promote_queue_to_history(&item, HistoryStatus::Completed, Duration::from_millis(1), None)
            .await
            .unwrap();
        db.delete_history(history.id, Requester::ExternalClient)
            .await
            .unwrap();

        let removed = db.sweep_expired_history(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(removed, 0);

        let removed = db.sweep_expired_history(Duration::from_secs(0)).await.unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn retry_reinserts_as_fresh_queue_item() {
        let db = test_db().await;
        let item = sample_queue_item("a.nzb");
        db.add_queue_item(&item, "<custom/>").await.unwrap();
        let history = db
            .promote_queue_to_history(
                &item,
                HistoryStatus::Failed,
                Duration::from_millis(1),
                Some("article missing".into()),
            )
            .await
            .unwrap();

        let requeued = db.retry_history_item(history.id).await.unwrap();
        assert_eq!(requeued.file_name, "a.nzb");
        assert_eq!(requeued.priority, Priority::Normal);
        assert!(db.get_history_item(history.id).await.unwrap().is_none());
        assert_eq!(
            db.get_queue_nzb_contents(requeued.id).await.unwrap().unwrap(),
            "<custom/>"
        );
    }
}
