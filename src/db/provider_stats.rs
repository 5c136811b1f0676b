//! Per-`(job, provider)` accounting and the append-only missing-article log.

use crate::error::Result;
use crate::types::{MissingArticleEvent, NzbProviderStat};

use super::Database;

impl Database {
    /// Record one fetch attempt's outcome for a `(job_name, provider_index)`
    /// pair, updating the exponential moving average of transfer speed.
    ///
    /// `alpha` (the EMA smoothing factor) is fixed at 0.3, the same weight
    /// the client's failover ordering tolerates well in practice: recent
    /// fetches dominate without one slow segment swinging the average wildly.
    pub async fn record_provider_fetch(
        &self,
        job_name: &str,
        provider_index: usize,
        bytes: i64,
        time_ms: i64,
        succeeded: bool,
    ) -> Result<()> {
        const ALPHA: f64 = 0.3;
        let now = super::now_ts();
        let instantaneous_bps = if time_ms > 0 {
            bytes as f64 / time_ms as f64
        } else {
            0.0
        };

        let existing: Option<f64> = sqlx::query_scalar(
            "SELECT recent_avg_speed_bps FROM provider_stats WHERE job_name = ? AND provider_index = ?",
        )
        .bind(job_name)
        .bind(provider_index as i64)
        .fetch_optional(self.pool())
        .await?;

        let new_avg = match existing {
            Some(prev) => ALPHA * instantaneous_bps + (1.0 - ALPHA) * prev,
            None => instantaneous_bps,
        };

        let (success_inc, fail_inc) = if succeeded { (1, 0) } else { (0, 1) };

        sqlx::query(
            "INSERT INTO provider_stats (
                job_name, provider_index, successful_segments, failed_segments,
                total_bytes, total_time_ms, last_used, recent_avg_speed_bps
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(job_name, provider_index) DO UPDATE SET
                successful_segments = successful_segments + excluded.successful_segments,
                failed_segments = failed_segments + excluded.failed_segments,
                total_bytes = total_bytes + excluded.total_bytes,
                total_time_ms = total_time_ms + excluded.total_time_ms,
                last_used = excluded.last_used,
                recent_avg_speed_bps = excluded.recent_avg_speed_bps",
        )
        .bind(job_name)
        .bind(provider_index as i64)
        .bind(success_inc)
        .bind(fail_inc)
        .bind(bytes)
        .bind(time_ms)
        .bind(now)
        .bind(new_avg)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// All provider accounting rows for a job, for diagnostics/analysis.
    pub async fn list_provider_stats(&self, job_name: &str) -> Result<Vec<NzbProviderStat>> {
        let rows: Vec<(String, i64, i64, i64, i64, i64, i64, f64)> = sqlx::query_as(
            "SELECT job_name, provider_index, successful_segments, failed_segments,
                    total_bytes, total_time_ms, last_used, recent_avg_speed_bps
             FROM provider_stats WHERE job_name = ? ORDER BY provider_index ASC",
        )
        .bind(job_name)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(job_name, provider_index, successful_segments, failed_segments, total_bytes, total_time_ms, last_used, recent_avg_speed_bps)| {
                    NzbProviderStat {
                        job_name,
                        provider_index: provider_index as usize,
                        successful_segments,
                        failed_segments,
                        total_bytes,
                        total_time_ms,
                        last_used: super::ts_to_datetime(last_used),
                        recent_avg_speed_bps,
                    }
                },
            )
            .collect())
    }

    /// Append a permanent "article not found" record.
    pub async fn record_missing_article_event(&self, event: &MissingArticleEvent) -> Result<()> {
        sqlx::query(
            "INSERT INTO missing_article_events (filename, message_id, provider_index, timestamp, operation)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&event.filename)
        .bind(&event.message_id)
        .bind(event.provider_index as i64)
        .bind(event.timestamp.timestamp())
        .bind(&event.operation)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Most recent missing-article events, newest first, for diagnostics.
    pub async fn recent_missing_article_events(&self, limit: i64) -> Result<Vec<MissingArticleEvent>> {
        let rows: Vec<(String, String, i64, i64, String)> = sqlx::query_as(
            "SELECT filename, message_id, provider_index, timestamp, operation
             FROM missing_article_events ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|(filename, message_id, provider_index, timestamp, operation)| {
                MissingArticleEvent {
                    filename,
                    message_id,
                    provider_index: provider_index as usize,
                    timestamp: super::ts_to_datetime(timestamp),
                    operation,
                }
            })
            .collect())
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

    #[tokio::test]
    async fn record_provider_fetch_accumulates_counts() {
        let db = test_db().await;
        db.record_provider_fetch("job-a", 0, 1000, 100, true).await.unwrap();
        db.record_provider_fetch("job-a", 0, 2000, 100, true).await.unwrap();
        db.record_provider_fetch("job-a", 0, 0, 50, false).await.unwrap();

        let stats = db.list_provider_stats("job-a").await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].successful_segments, 2);
        assert_eq!(stats[0].failed_segments, 1);
        assert_eq!(stats[0].total_bytes, 3000);
    }

    #[tokio::test]
    async fn missing_article_events_recorded_and_listed_newest_first() {
        let db = test_db().await;
        let event_a = MissingArticleEvent {
            filename: "a.mkv".into(),
            message_id: "<a@example>".into(),
            provider_index: 0,
            timestamp: chrono::Utc::now(),
            operation: "import".into(),
        };
        let event_b = MissingArticleEvent {
            filename: "b.mkv".into(),
            message_id: "<b@example>".into(),
            provider_index: 1,
            timestamp: chrono::Utc::now(),
            operation: "stream_read".into(),
        };
        db.record_missing_article_event(&event_a).await.unwrap();
        db.record_missing_article_event(&event_b).await.unwrap();

        let events = db.recent_missing_article_events(10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].filename, "b.mkv");
    }
}
