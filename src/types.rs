//! Core data model: items, queue/history entries, events, and the enums
//! that tag them. Mirrors the entity table of the design: `Item` nodes form
//! the logical file tree, `QueueItem`/`HistoryItem` track ingest jobs, and
//! `Event` is the tagged notification shape fanned out on the event bus.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Primary key for every node in the logical file tree (directories and files alike).
pub type ItemId = Uuid;

/// Primary key for a queue/history job, carried across the SAB-compatible API as `nzo_id`.
pub type JobId = Uuid;

/// What an [`Item`] represents in the logical file tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// A directory node; has children but no segment data of its own.
    Directory,
    /// A plain file backed directly by one NZB file's segment list.
    NzbFile,
    /// A file backed by an indexed (not extracted) RAR volume set.
    RarFile,
    /// A file assembled from `name.NNN` / `name.partNN.rar` multipart segments.
    MultipartFile,
    /// A symbolic link to another item (reserved for future post-import aliasing).
    SymLink,
}

/// A node in the logical file tree: a directory or one of the file kinds.
///
/// `NzbFile`/`RarFile`/`MultipartFile` descriptor rows carry the per-kind
/// segment data and are looked up by `Item.id` when a streaming reader
/// opens the item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    /// Unique identifier, stable for the lifetime of the item.
    pub id: ItemId,
    /// Parent directory, or `None` for the root.
    pub parent_id: Option<ItemId>,
    /// Display name (the final path component).
    pub name: String,
    /// Full `/`-joined path from root; unique across the tree.
    pub path: String,
    /// What kind of node this is.
    pub kind: ItemKind,
    /// Total decoded size in bytes; `None` for directories.
    pub file_size: Option<i64>,
    /// When the underlying NZB was released (best-effort, from NZB metadata).
    pub release_date: chrono::DateTime<chrono::Utc>,
    /// Set by the (out-of-scope) health-check collaborator when a segment
    /// is confirmed unreachable; never toggled by the read path itself.
    pub is_corrupted: bool,
    /// Human-readable reason for `is_corrupted`, if any.
    pub corruption_reason: Option<String>,
    /// Last time a health check inspected this item.
    pub last_health_check: Option<chrono::DateTime<chrono::Utc>>,
    /// Next time a health check should inspect this item.
    pub next_health_check: Option<chrono::DateTime<chrono::Utc>>,
}

/// Segment descriptor shared by every archive/file kind: one article's
/// worth of a logical file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegmentRef {
    /// Usenet message-id of the article carrying this segment.
    pub message_id: String,
    /// Decoded size of this segment in bytes.
    pub size: i64,
}

/// Descriptor for an [`ItemKind::NzbFile`]: a straight ordered segment list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NzbFileDescriptor {
    /// Owning item id.
    pub item_id: ItemId,
    /// Segments in file order.
    pub segments: Vec<SegmentRef>,
}

/// One RAR volume's segment list, as discovered by the RAR inspector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RarPart {
    /// Segments carrying this volume's bytes, in order.
    pub segments: Vec<SegmentRef>,
}

/// Maps one inner file's byte range inside a RAR set to the outer volumes
/// that carry it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RarInnerRange {
    /// Index into `RarFileDescriptor::rar_parts`.
    pub outer_volume_index: usize,
    /// Byte offset into the outer volume's concatenated segment stream.
    pub outer_byte_start: i64,
    /// Exclusive end offset into the outer volume's concatenated segment stream.
    pub outer_byte_end: i64,
    /// Byte offset into the inner (decompressed-equivalent, since only
    /// stored/uncompressed volumes are supported) file.
    pub inner_byte_start: i64,
    /// Exclusive end offset into the inner file.
    pub inner_byte_end: i64,
}

/// Descriptor for an [`ItemKind::RarFile`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RarFileDescriptor {
    /// Owning item id.
    pub item_id: ItemId,
    /// RAR volumes in order.
    pub rar_parts: Vec<RarPart>,
    /// Inner-file byte ranges, sorted by `inner_byte_start`.
    pub inner_offset_map: Vec<RarInnerRange>,
}

/// Descriptor for an [`ItemKind::MultipartFile`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultipartFileDescriptor {
    /// Owning item id.
    pub item_id: ItemId,
    /// Contiguous pieces in order; `file_parts[i]` is the segment list of the i-th piece.
    pub file_parts: Vec<RarPart>,
}

/// Priority of a queued ingest job. Ordering is `Force > High > Normal > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Lowest priority; "move to bottom" pushes an item here.
    Low = 0,
    /// Default priority for newly ingested jobs.
    Normal = 1,
    /// Above normal.
    High = 2,
    /// Highest priority; "move to top" promotes an item here.
    Force = 3,
}

impl Priority {
    /// Parse from the SAB-compatible priority action name used by `queue&name=priority`.
    pub fn from_action(action: &str) -> Option<Self> {
        match action {
            "low" => Some(Priority::Low),
            "normal" => Some(Priority::Normal),
            "high" => Some(Priority::High),
            "top" => Some(Priority::Force),
            "bottom" => Some(Priority::Low),
            _ => None,
        }
    }
}

/// Workload category used by the connection pool for admission control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageContext {
    /// Header/body fetches performed by the queue's import pipeline.
    Queue,
    /// Interactive byte-range reads from an open streaming reader.
    Streaming,
    /// Read-ahead prefetch performed speculatively on behalf of a streaming reader.
    BufferedStreaming,
    /// Periodic provider/article health checks (out-of-scope collaborator).
    HealthCheck,
    /// Par2 repair fetches (out-of-scope collaborator).
    Repair,
    /// Ad-hoc analysis/diagnostic fetches.
    Analysis,
}

/// State machine stage of a `QueueItem` as it moves through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Waiting to be picked up by the queue manager.
    Queued,
    /// NZB contents are being parsed into a `ParsedNzb`.
    Parsing,
    /// Item tree is being built and inserted into the metadata store.
    Importing,
    /// Header segments for RAR/multipart sets are being fetched and verified.
    Verifying,
    /// Import succeeded; job has been promoted to history.
    Done,
    /// Import failed; job has been promoted to history with a failure reason.
    Failed,
}

/// Terminal status recorded on a `HistoryItem`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    /// Import completed successfully.
    Completed,
    /// Import failed; see the accompanying failure reason.
    Failed,
}

/// A job waiting in the priority queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    /// Unique id, used externally as `nzo_id`.
    pub id: JobId,
    /// Unique display/file name for this job (conflict-checked on ingest and requeue).
    pub file_name: String,
    /// Human-readable job name, usually derived from the NZB metadata.
    pub job_name: String,
    /// Creation/enqueue timestamp; used as the FIFO tie-break and mutated by
    /// the "move to top/bottom" priority actions.
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Category label (e.g. "movies", "tv"), used for organizing the import path.
    pub category: Option<String>,
    /// Scheduling priority.
    pub priority: Priority,
    /// If set, the job is not eligible for processing until this time.
    pub pause_until: Option<chrono::DateTime<chrono::Utc>>,
    /// Post-processing bit flags, preserved from the ingest request but not
    /// acted on by this crate (post-processing is an out-of-scope collaborator).
    pub post_processing: i32,
    /// Sum of all segment sizes declared by the NZB; used for progress reporting.
    pub total_segment_bytes: i64,
}

/// A completed or failed job, as recorded in history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryItem {
    /// Unique id. Distinct from the originating `QueueItem::id` — promotion creates a new identity.
    pub id: JobId,
    /// Human-readable job name.
    pub job_name: String,
    /// File name as it appeared in the queue.
    pub file_name: String,
    /// Category label, carried over from the queue item.
    pub category: Option<String>,
    /// Completed or Failed.
    pub status: HistoryStatus,
    /// Raw NZB XML, retained for the `retry` operation.
    pub nzb_contents: String,
    /// Total bytes described by the NZB.
    pub bytes: i64,
    /// Wall-clock duration of the import (not download — no payload is downloaded here).
    pub download_time: std::time::Duration,
    /// Completion timestamp.
    pub completed_at: chrono::DateTime<chrono::Utc>,
    /// Set once an external client archives this item rather than deleting it outright.
    pub is_archived: bool,
    /// When the item was archived, used by the retention sweep.
    pub archived_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Why the job failed, if `status == Failed`.
    pub failure_reason: Option<String>,
}

/// Per-`(job, provider)` accounting, upserted by the usenet client on every fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NzbProviderStat {
    /// Job this accounting row belongs to.
    pub job_name: String,
    /// Index into the configured provider list.
    pub provider_index: usize,
    /// Segments successfully fetched from this provider for this job.
    pub successful_segments: i64,
    /// Segments that failed (permanently or after exhausting retries) on this provider.
    pub failed_segments: i64,
    /// Total bytes transferred.
    pub total_bytes: i64,
    /// Total time spent fetching, in milliseconds.
    pub total_time_ms: i64,
    /// Last time this provider was used for this job.
    pub last_used: chrono::DateTime<chrono::Utc>,
    /// Exponential moving average of bytes/ms, used for weighted provider selection.
    pub recent_avg_speed_bps: f64,
}

/// Append-only record of a permanent "article not found" response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissingArticleEvent {
    /// Logical file name the article belonged to.
    pub filename: String,
    /// The article's message-id.
    pub message_id: String,
    /// Which configured provider returned the permanent error.
    pub provider_index: usize,
    /// When the miss was recorded.
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// What operation was in flight (e.g. "import", "stream_read").
    pub operation: String,
}

/// Who is asking for a history deletion; the core's canonical disambiguation
/// of the "archive vs. hard-delete" open question (see `DESIGN.md`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Requester {
    /// The operator UI; deletion is always permitted immediately.
    Ui,
    /// A third-party client (Sonarr/Radarr-style); always archives instead of deleting.
    ExternalClient,
}

/// Tagged notification fanned out on the event bus. Mirrors the SAB-style
/// topic names from the design's external-interfaces section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A new job was added to the queue.
    QueueItemAdded {
        /// The newly queued job id.
        id: JobId,
        /// Its display name.
        file_name: String,
    },
    /// A job was removed from the queue (cancelled or promoted).
    QueueItemRemoved {
        /// The removed job id.
        id: JobId,
    },
    /// A job's priority or position changed.
    QueueItemPriorityChanged {
        /// The affected job id.
        id: JobId,
        /// Its new priority.
        priority: Priority,
    },
    /// Progress update while a job is being imported.
    QueueItemProgress {
        /// The job being processed.
        id: JobId,
        /// Header segments fetched so far.
        segments_done: u64,
        /// Total header segments to inspect.
        segments_total: u64,
    },
    /// A job finished processing and was promoted to history.
    HistoryItemAdded {
        /// The new history entry id.
        id: JobId,
        /// Whether it completed or failed.
        status: HistoryStatus,
    },
    /// A history entry was deleted (hard-deleted, not merely archived).
    HistoryItemRemoved {
        /// The removed history entry id.
        id: JobId,
    },
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_matches_force_high_normal_low() {
        assert!(Priority::Force > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn priority_from_action() {
        assert_eq!(Priority::from_action("top"), Some(Priority::Force));
        assert_eq!(Priority::from_action("bottom"), Some(Priority::Low));
        assert_eq!(Priority::from_action("high"), Some(Priority::High));
        assert_eq!(Priority::from_action("nonsense"), None);
    }

    #[test]
    fn event_serializes_with_tagged_type_field() {
        let event = Event::QueueItemAdded {
            id: Uuid::nil(),
            file_name: "movie.nzb".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "queue_item_added");
        assert_eq!(json["file_name"], "movie.nzb");
    }

    #[test]
    fn item_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ItemKind::MultipartFile).unwrap();
        assert_eq!(json, "\"multipart_file\"");
    }
}
