//! On-demand byte-range reads over a logical file's segment list.
//!
//! A [`StreamingReader`] translates `read(offset, length)` into the ordered
//! set of Usenet articles needed to cover that range, fetches them
//! concurrently (bounded by `streaming_prefetch`), yEnc-decodes each one, and
//! assembles the exact requested byte window. `NzbFile` and `MultipartFile`
//! items read directly off their segment list; `RarFile` items are
//! additionally translated through the `inner_offset_map` built by
//! [`crate::rar`] before the same segment-fetch machinery applies.
//!
//! Grounded on the teacher's `downloader::download_task` for the
//! "concurrent bounded fetch with a semaphore, then reassemble" shape
//! (`futures::stream::buffer_unordered` driven by its own concurrency
//! permit), generalized here from "download every segment to disk" to
//! "fetch only the segments covering one byte range, into memory".

use crate::client::UsenetClient;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::types::{ItemId, ItemKind, RarInnerRange, RarPart, SegmentRef, UsageContext};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One article's placement within a flattened byte stream.
#[derive(Debug, Clone)]
struct GlobalSegment {
    message_id: String,
    start: i64,
    end: i64,
}

fn flatten(parts_segments: impl Iterator<Item = SegmentRef>) -> Vec<GlobalSegment> {
    let mut out = Vec::new();
    let mut cursor = 0i64;
    for seg in parts_segments {
        let end = cursor + seg.size;
        out.push(GlobalSegment {
            message_id: seg.message_id,
            start: cursor,
            end,
        });
        cursor = end;
    }
    out
}

fn flatten_parts(parts: &[RarPart]) -> Vec<GlobalSegment> {
    flatten(parts.iter().flat_map(|p| p.segments.iter().cloned()))
}

/// A single inner-byte-range-to-outer-byte-range translation, precomputed
/// once at [`StreamingReader::open`] time from a `RarFileDescriptor`'s
/// `inner_offset_map` so every subsequent `read` is a pure binary search.
#[derive(Debug, Clone)]
struct RarRangeMap {
    inner_start: i64,
    inner_end: i64,
    outer_start: i64,
}

/// How a reader maps logical byte offsets onto [`GlobalSegment`]s.
enum SegmentPlan {
    /// `NzbFile` or `MultipartFile`: the logical stream *is* the segment stream.
    Flat(Vec<GlobalSegment>),
    /// `RarFile`: logical (inner) offsets are translated through `ranges`
    /// before landing on a position in `global`.
    Rar {
        global: Vec<GlobalSegment>,
        ranges: Vec<RarRangeMap>,
    },
}

impl SegmentPlan {
    /// Split a logical `[offset, offset+length)` request into one or more
    /// `(output_offset, global_start, global_end)` spans to fetch.
    fn translate(&self, offset: i64, length: i64) -> Result<Vec<(i64, i64, i64)>> {
        match self {
            SegmentPlan::Flat(_) => Ok(vec![(0, offset, offset + length)]),
            SegmentPlan::Rar { ranges, .. } => {
                let end = offset + length;
                let start_idx = ranges.partition_point(|r| r.inner_end <= offset);
                let mut spans = Vec::new();
                for range in &ranges[start_idx..] {
                    if range.inner_start >= end {
                        break;
                    }
                    let overlap_start = offset.max(range.inner_start);
                    let overlap_end = end.min(range.inner_end);
                    if overlap_end <= overlap_start {
                        continue;
                    }
                    let delta = overlap_start - range.inner_start;
                    let global_start = range.outer_start + delta;
                    let global_end = global_start + (overlap_end - overlap_start);
                    spans.push((overlap_start - offset, global_start, global_end));
                }
                if spans.is_empty() {
                    return Err(Error::ValidationError(format!(
                        "requested range [{offset}, {end}) is outside the indexed rar set"
                    )));
                }
                Ok(spans)
            }
        }
    }

    fn global(&self) -> &[GlobalSegment] {
        match self {
            SegmentPlan::Flat(g) => g,
            SegmentPlan::Rar { global, .. } => global,
        }
    }
}

fn build_rar_ranges(rar_parts: &[RarPart], inner_offset_map: &[RarInnerRange]) -> Vec<RarRangeMap> {
    let mut volume_starts = Vec::with_capacity(rar_parts.len());
    let mut cursor = 0i64;
    for part in rar_parts {
        volume_starts.push(cursor);
        cursor += part.segments.iter().map(|s| s.size).sum::<i64>();
    }

    inner_offset_map
        .iter()
        .map(|range| RarRangeMap {
            inner_start: range.inner_byte_start,
            inner_end: range.inner_byte_end,
            outer_start: volume_starts
                .get(range.outer_volume_index)
                .copied()
                .unwrap_or(0)
                + range.outer_byte_start,
        })
        .collect()
}

/// A per-open-file cursor over a logical item's segment list.
pub struct StreamingReader {
    item_id: ItemId,
    job_name: String,
    total_size: i64,
    plan: SegmentPlan,
    client: Arc<UsenetClient>,
    db: Arc<Database>,
    prefetch: usize,
    cancel: CancellationToken,
}

impl StreamingReader {
    /// Open a reader for `item_id`, loading whichever descriptor its
    /// [`ItemKind`] carries and building the segment plan once up front.
    pub async fn open(
        db: Arc<Database>,
        client: Arc<UsenetClient>,
        item_id: ItemId,
        prefetch: usize,
    ) -> Result<Self> {
        let item = db
            .get_item_by_id(item_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("item {item_id}")))?;

        let total_size = item
            .file_size
            .ok_or_else(|| Error::ValidationError(format!("item {item_id} is a directory")))?;

        let plan = match item.kind {
            ItemKind::NzbFile => {
                let descriptor = db
                    .get_nzb_descriptor(item_id)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("nzb descriptor for {item_id}")))?;
                SegmentPlan::Flat(flatten(descriptor.segments.into_iter()))
            }
            ItemKind::MultipartFile => {
                let descriptor = db
                    .get_multipart_descriptor(item_id)
                    .await?
                    .ok_or_else(|| {
                        Error::NotFound(format!("multipart descriptor for {item_id}"))
                    })?;
                SegmentPlan::Flat(flatten_parts(&descriptor.file_parts))
            }
            ItemKind::RarFile => {
                let descriptor = db
                    .get_rar_descriptor(item_id)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("rar descriptor for {item_id}")))?;
                let global = flatten_parts(&descriptor.rar_parts);
                let ranges = build_rar_ranges(&descriptor.rar_parts, &descriptor.inner_offset_map);
                SegmentPlan::Rar { global, ranges }
            }
            ItemKind::Directory | ItemKind::SymLink => {
                return Err(Error::ValidationError(format!(
                    "item {item_id} has no streamable segment data"
                )));
            }
        };

        Ok(Self {
            item_id,
            job_name: item.path.clone(),
            total_size,
            plan,
            client,
            db,
            prefetch: prefetch.max(1),
            cancel: CancellationToken::new(),
        })
    }

    /// Total decoded size of the underlying logical file.
    pub fn total_size(&self) -> i64 {
        self.total_size
    }

    /// Read exactly `length` bytes starting at `offset`.
    ///
    /// Concurrently fetches and decodes every article covering the
    /// requested range, bounded by `streaming_prefetch = min(segments
    /// needed, configured_max)`, and assembles them into the exact byte
    /// window regardless of which article completes first.
    pub async fn read(&self, offset: i64, length: i64) -> Result<Vec<u8>> {
        if length == 0 {
            return Ok(Vec::new());
        }
        if offset < 0 || offset + length > self.total_size {
            return Err(Error::ValidationError(format!(
                "read [{offset}, {}) out of bounds for item {} of size {}",
                offset + length,
                self.item_id,
                self.total_size
            )));
        }

        let spans = self.plan.translate(offset, length)?;
        let global = self.plan.global();
        let mut fetches = Vec::new();

        for (output_offset, global_start, global_end) in spans {
            let first = global.partition_point(|s| s.end <= global_start);
            let last = global.partition_point(|s| s.start < global_end);
            for segment in &global[first..last] {
                let overlap_start = global_start.max(segment.start);
                let overlap_end = global_end.min(segment.end);
                if overlap_end <= overlap_start {
                    continue;
                }
                let buf_offset = output_offset + (overlap_start - global_start);
                fetches.push((
                    segment.message_id.clone(),
                    segment.start,
                    (overlap_start - segment.start) as usize,
                    (overlap_end - segment.start) as usize,
                    buf_offset as usize,
                ));
            }
        }

        let prefetch = self.prefetch.min(fetches.len().max(1));
        let client = Arc::clone(&self.client);
        let db = Arc::clone(&self.db);
        let job_name = self.job_name.clone();
        let cancel = self.cancel.clone();

        let mut out = vec![0u8; length as usize];
        let mut results = stream::iter(fetches.into_iter().map(|job| {
            let client = Arc::clone(&client);
            let db = Arc::clone(&db);
            let job_name = job_name.clone();
            let cancel = cancel.clone();
            async move {
                let (message_id, _segment_start, lo, hi, buf_offset) = job;
                if cancel.is_cancelled() {
                    return Err(Error::Other("streaming reader closed".into()));
                }
                let article = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Other("streaming reader closed".into())),
                    result = client.fetch_article_for_job(&db, &job_name, &message_id, UsageContext::Streaming) => result?,
                };
                let decoded = crate::yenc::decode(&message_id, &article.data)?;
                Ok::<_, Error>((buf_offset, decoded.data[lo..hi].to_vec()))
            }
        }))
        .buffer_unordered(prefetch);

        while let Some(result) = results.next().await {
            let (buf_offset, bytes) = result?;
            out[buf_offset..buf_offset + bytes.len()].copy_from_slice(&bytes);
        }

        Ok(out)
    }

    /// Cancel any outstanding fetches. Safe to call more than once.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for StreamingReader {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RarFileDescriptor;

    fn seg(id: &str, size: i64) -> SegmentRef {
        SegmentRef {
            message_id: id.into(),
            size,
        }
    }

    #[test]
    fn flat_plan_translates_whole_request_as_one_span() {
        let plan = SegmentPlan::Flat(flatten(vec![seg("a", 100), seg("b", 100)].into_iter()));
        let spans = plan.translate(50, 100).unwrap();
        assert_eq!(spans, vec![(0, 50, 150)]);
    }

    #[test]
    fn global_segment_lookup_finds_overlapping_range() {
        let global = flatten(vec![seg("a", 700_000), seg("b", 700_000), seg("c", 200_000)].into_iter());
        // A request for the last 200_000 bytes should only touch segment "c".
        let first = global.partition_point(|s| s.end <= 1_400_000);
        let last = global.partition_point(|s| s.start < 1_600_000);
        assert_eq!(last - first, 1);
        assert_eq!(global[first].message_id, "c");
    }

    fn rar_descriptor() -> RarFileDescriptor {
        // Volume 0: 10 header bytes + 90 data bytes. Volume 1: 100 data bytes.
        // Inner file is the 90+100 = 190 data bytes, header stripped.
        RarFileDescriptor {
            item_id: uuid::Uuid::nil(),
            rar_parts: vec![
                RarPart {
                    segments: vec![seg("v0", 100)],
                },
                RarPart {
                    segments: vec![seg("v1", 100)],
                },
            ],
            inner_offset_map: vec![
                RarInnerRange {
                    outer_volume_index: 0,
                    outer_byte_start: 10,
                    outer_byte_end: 100,
                    inner_byte_start: 0,
                    inner_byte_end: 90,
                },
                RarInnerRange {
                    outer_volume_index: 1,
                    outer_byte_start: 0,
                    outer_byte_end: 100,
                    inner_byte_start: 90,
                    inner_byte_end: 190,
                },
            ],
        }
    }

    #[test]
    fn rar_plan_translates_inner_offset_across_volume_boundary() {
        let descriptor = rar_descriptor();
        let ranges = build_rar_ranges(&descriptor.rar_parts, &descriptor.inner_offset_map);
        let plan = SegmentPlan::Rar {
            global: flatten_parts(&descriptor.rar_parts),
            ranges,
        };

        // Read straddling the volume boundary: inner bytes [85, 95).
        let spans = plan.translate(85, 10).unwrap();
        assert_eq!(spans.len(), 2);
        // First span: inner [85,90) -> volume 0 local [95,100) -> global [95,100).
        assert_eq!(spans[0], (0, 95, 100));
        // Second span: inner [90,95) -> volume 1 local [0,5) -> global [100,105).
        assert_eq!(spans[1], (5, 100, 105));
    }

    #[test]
    fn rar_plan_rejects_out_of_range_request() {
        let descriptor = rar_descriptor();
        let ranges = build_rar_ranges(&descriptor.rar_parts, &descriptor.inner_offset_map);
        let plan = SegmentPlan::Rar {
            global: flatten_parts(&descriptor.rar_parts),
            ranges,
        };
        let err = plan.translate(1000, 10).unwrap_err();
        assert!(matches!(err, Error::ValidationError(_)));
    }

    #[tokio::test]
    async fn open_rejects_directory_items() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let db = Arc::new(Database::from_pool(pool).await.unwrap());
        let dir_id = uuid::Uuid::new_v4();
        db.insert_item_tree(&[crate::db::NewItem {
            id: dir_id,
            parent_id: None,
            name: "root".into(),
            path: "/root".into(),
            file_size: None,
            release_date: chrono::Utc::now(),
            is_corrupted: false,
            corruption_reason: None,
            descriptor: crate::db::NewFileDescriptor::Directory,
        }])
        .await
        .unwrap();

        let client = Arc::new(UsenetClient::new(&crate::config::Config::default()).await.unwrap());
        let err = StreamingReader::open(db, client, dir_id, 4).await.unwrap_err();
        assert!(matches!(err, Error::ValidationError(_)));
    }
}
