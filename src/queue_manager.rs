//! Single-writer ingest pipeline: pulls the next eligible `QueueItem`,
//! parses its NZB, classifies and indexes its files, builds the item tree,
//! and promotes the job to history.
//!
//! Grounded on the teacher's `downloader::{queue, queue_processor,
//! download_task}` split: `start_queue_processor` becomes [`QueueManager::run`],
//! `restore_queue` is called once at startup the same way, and the
//! `QueuedDownload`/`BinaryHeap` in-memory ordering is replaced here by
//! `Database::next_eligible_queue_item`'s `(priority DESC, created_at ASC)`
//! query — the persisted `stage` column already gives the single worker
//! everything the teacher's in-memory heap existed to provide, so there is
//! no separate in-memory structure to keep in sync with the store.

use crate::client::UsenetClient;
use crate::db::{Database, NewFileDescriptor, NewItem};
use crate::error::Result;
use crate::events::EventBus;
use crate::multipart::{self, MultipartGroup};
use crate::nzb::{self, ParsedFile};
use crate::rar::{self, RarVolume};
use crate::types::{Event, HistoryStatus, ItemId, JobId, QueueItem, Stage};
use regex::Regex;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

static PART_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\.part\d{1,4}\.rar$").unwrap());
static OLD_STYLE_CONTINUATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(?P<base>.+)\.r(?P<num>\d{2})$").unwrap());

/// Pulls classic `archive.rar` / `archive.r00` / `archive.r01` ... sets out
/// of `files`, leaving everything else (including `.partNN.rar` sets, which
/// [`multipart::group_multipart_files`] already groups correctly) untouched.
fn classify_rar_extension_groups(files: &[&ParsedFile]) -> (Vec<MultipartGroup>, Vec<ParsedFile>) {
    use std::collections::BTreeMap;

    let mut by_base: BTreeMap<String, Vec<(u32, &ParsedFile)>> = BTreeMap::new();
    let mut remaining = Vec::new();

    for file in files {
        let lower = file.filename.to_lowercase();
        if PART_MARKER.is_match(&lower) {
            remaining.push((*file).clone());
            continue;
        }
        if let Some(stem) = lower.strip_suffix(".rar") {
            by_base.entry(stem.to_string()).or_default().push((0, file));
            continue;
        }
        if let Some(caps) = OLD_STYLE_CONTINUATION.captures(&lower) {
            let base = caps["base"].to_string();
            let num: u32 = caps["num"].parse().unwrap_or(0);
            by_base.entry(base).or_default().push((num + 1, file));
            continue;
        }
        remaining.push((*file).clone());
    }

    let mut groups = Vec::new();
    for (base, mut pieces) in by_base {
        // A continuation-only group with no bare `.rar` piece (index 0) is an
        // incomplete archive fragment; import its pieces as plain files
        // instead of guessing at a missing first volume.
        if !pieces.iter().any(|(idx, _)| *idx == 0) {
            remaining.extend(pieces.into_iter().map(|(_, f)| f.clone()));
            continue;
        }
        pieces.sort_by_key(|(idx, _)| *idx);
        let file_parts: Vec<crate::types::RarPart> = pieces
            .iter()
            .map(|(_, f)| crate::types::RarPart {
                segments: f
                    .segments
                    .iter()
                    .map(|s| crate::types::SegmentRef {
                        message_id: s.message_id.clone(),
                        size: s.bytes,
                    })
                    .collect(),
            })
            .collect();
        let total_size = file_parts.iter().flat_map(|p| p.segments.iter()).map(|s| s.size).sum();
        groups.push(MultipartGroup {
            base_name: base,
            total_size,
            file_parts,
        });
    }

    (groups, remaining)
}

/// Outcome of importing one recognized group of files (a real RAR set, a
/// fallback opaque multipart file, or a plain single file).
enum Classified {
    Rar {
        name: String,
        rar_parts: Vec<crate::types::RarPart>,
        inner_offset_map: Vec<crate::types::RarInnerRange>,
        file_size: i64,
    },
    Multipart {
        group: MultipartGroup,
        is_corrupted: bool,
        corruption_reason: Option<String>,
    },
    Single {
        name: String,
        segments: Vec<crate::types::SegmentRef>,
        file_size: i64,
    },
}

fn single_from_file(file: &ParsedFile) -> Classified {
    let segments: Vec<crate::types::SegmentRef> = file
        .segments
        .iter()
        .map(|s| crate::types::SegmentRef {
            message_id: s.message_id.clone(),
            size: s.bytes,
        })
        .collect();
    let file_size = segments.iter().map(|s| s.size).sum();
    Classified::Single {
        name: file.filename.clone(),
        segments,
        file_size,
    }
}

/// Considered a real corruption marker rather than "this group just isn't a
/// RAR archive at all".
fn is_genuine_rar_corruption(reason: &str) -> bool {
    reason != "not a recognized rar signature"
}

/// Owns the ingest pipeline's only worker. Cheap to hold behind an `Arc` and
/// spawn once; `notify()`/`cancellation_token()` are the facade's handles
/// onto it.
pub struct QueueManager {
    db: Arc<Database>,
    client: Arc<UsenetClient>,
    events: EventBus,
    wake: Notify,
    cancel: CancellationToken,
}

impl QueueManager {
    pub fn new(db: Arc<Database>, client: Arc<UsenetClient>, events: EventBus) -> Self {
        Self {
            db,
            client,
            events,
            wake: Notify::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Wake the worker immediately instead of waiting for the next poll tick.
    pub fn notify(&self) {
        self.wake.notify_one();
    }

    /// A token that, once cancelled, stops [`Self::run`] after its current job.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Repopulate any in-flight stages left over from an unclean shutdown,
    /// then run the worker loop until cancelled. Intended to be
    /// `tokio::spawn`ed once by the facade.
    pub async fn run(&self) {
        match self.db.restore_queue().await {
            Ok(count) if count > 0 => {
                tracing::info!(count, "restored in-flight queue items to queued");
            }
            Ok(_) => {}
            Err(error) => tracing::error!(%error, "failed to restore queue on startup"),
        }

        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            match self.db.next_eligible_queue_item().await {
                Ok(Some(item)) => {
                    let id = item.id;
                    if let Err(error) = self.process(item).await {
                        tracing::error!(job = %id, %error, "queue job failed");
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(POLL_INTERVAL) => {}
                        _ = self.cancel.cancelled() => return,
                    }
                }
                Err(error) => {
                    tracing::error!(%error, "failed to poll queue for next eligible item");
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }
    }

    /// True once the item has disappeared from the queue out from under us
    /// (removed or already promoted), meaning this worker should abandon the
    /// job rather than finish it.
    async fn was_withdrawn(&self, id: JobId) -> Result<bool> {
        Ok(self.db.get_queue_item(id).await?.is_none())
    }

    async fn process(&self, item: QueueItem) -> Result<()> {
        let started = Instant::now();
        let job_id = item.id;

        self.db.set_queue_stage(job_id, Stage::Parsing).await?;
        if self.was_withdrawn(job_id).await? {
            return Ok(());
        }

        let nzb_contents = match self.db.get_queue_nzb_contents(job_id).await? {
            Some(contents) => contents,
            None => return Ok(()),
        };

        let parsed = match nzb::parse(nzb_contents.as_bytes()) {
            Ok(parsed) => parsed,
            Err(error) => {
                return self.fail(&item, started, error.to_string()).await;
            }
        };

        self.db.set_queue_stage(job_id, Stage::Importing).await?;
        if self.was_withdrawn(job_id).await? {
            return Ok(());
        }

        let file_refs: Vec<&ParsedFile> = parsed.files.iter().collect();
        let (rar_ext_groups, rest) = classify_rar_extension_groups(&file_refs);
        let (generic_groups, singles) = multipart::group_multipart_files(&rest);

        let candidate_groups: Vec<MultipartGroup> =
            rar_ext_groups.into_iter().chain(generic_groups).collect();

        self.db.set_queue_stage(job_id, Stage::Verifying).await?;
        if self.was_withdrawn(job_id).await? {
            return Ok(());
        }

        let segments_total = candidate_groups.len() as u64;
        let mut segments_done = 0u64;
        let mut classified = Vec::with_capacity(candidate_groups.len() + singles.len());

        for group in &candidate_groups {
            let volumes: Vec<RarVolume> = group
                .file_parts
                .iter()
                .map(|p| RarVolume {
                    segments: p.segments.clone(),
                })
                .collect();

            let result = rar::index_rar_set(
                &self.client,
                &self.db,
                &item.job_name,
                Uuid::new_v4(),
                &volumes,
            )
            .await;
            segments_done += 1;
            self.events.publish(Event::QueueItemProgress {
                id: job_id,
                segments_done,
                segments_total,
            });

            match result {
                Ok(indexed) => match indexed.descriptor {
                    Some(descriptor) => {
                        let file_size = descriptor
                            .inner_offset_map
                            .last()
                            .map(|r| r.inner_byte_end)
                            .unwrap_or(0);
                        classified.push(Classified::Rar {
                            name: group.base_name.clone(),
                            rar_parts: descriptor.rar_parts,
                            inner_offset_map: descriptor.inner_offset_map,
                            file_size,
                        });
                    }
                    None => {
                        let reason = indexed.unsupported_reason.unwrap_or_default();
                        let is_corrupted = is_genuine_rar_corruption(&reason);
                        classified.push(Classified::Multipart {
                            group: MultipartGroup {
                                base_name: group.base_name.clone(),
                                total_size: group.total_size,
                                file_parts: group.file_parts.clone(),
                            },
                            is_corrupted,
                            corruption_reason: is_corrupted.then_some(reason),
                        });
                    }
                },
                Err(error) => {
                    return self.fail(&item, started, error.to_string()).await;
                }
            }
        }

        for file in &singles {
            classified.push(single_from_file(file));
        }

        if self.was_withdrawn(job_id).await? {
            return Ok(());
        }

        match self.import(&item, classified).await {
            Ok(()) => self.complete(&item, started).await,
            Err(error) => self.fail(&item, started, error.to_string()).await,
        }
    }

    async fn import(&self, item: &QueueItem, classified: Vec<Classified>) -> Result<()> {
        let category = item.category.clone().unwrap_or_else(|| "misc".to_string());
        let path_segments = ["downloads".to_string(), category, item.job_name.clone()];

        let mut parent_id: Option<ItemId> = None;
        let mut path = String::new();
        for segment in &path_segments {
            path.push('/');
            path.push_str(segment);
            parent_id = Some(match self.db.get_item(&path).await? {
                Some(existing) => existing.id,
                None => {
                    let id = Uuid::new_v4();
                    self.db
                        .insert_item_tree(&[NewItem {
                            id,
                            parent_id,
                            name: segment.clone(),
                            path: path.clone(),
                            file_size: None,
                            release_date: chrono::Utc::now(),
                            is_corrupted: false,
                            corruption_reason: None,
                            descriptor: NewFileDescriptor::Directory,
                        }])
                        .await?;
                    id
                }
            });
        }

        let mut new_items = Vec::with_capacity(classified.len());
        for entry in classified {
            let id = Uuid::new_v4();
            let (name, file_size, is_corrupted, corruption_reason, descriptor) = match entry {
                Classified::Rar {
                    name,
                    rar_parts,
                    inner_offset_map,
                    file_size,
                } => (
                    name,
                    file_size,
                    false,
                    None,
                    NewFileDescriptor::Rar {
                        rar_parts,
                        inner_offset_map,
                    },
                ),
                Classified::Multipart {
                    group,
                    is_corrupted,
                    corruption_reason,
                } => {
                    let name = group.base_name.clone();
                    let file_size = group.total_size;
                    let descriptor = multipart::descriptor_for(id, &group);
                    (
                        name,
                        file_size,
                        is_corrupted,
                        corruption_reason,
                        NewFileDescriptor::Multipart(descriptor.file_parts),
                    )
                }
                Classified::Single {
                    name,
                    segments,
                    file_size,
                } => (name, file_size, false, None, NewFileDescriptor::Nzb(segments)),
            };

            new_items.push(NewItem {
                id,
                parent_id,
                name: name.clone(),
                path: format!("{path}/{name}"),
                file_size: Some(file_size),
                release_date: chrono::Utc::now(),
                is_corrupted,
                corruption_reason,
                descriptor,
            });
        }

        self.db.insert_item_tree(&new_items).await
    }

    async fn complete(&self, item: &QueueItem, started: Instant) -> Result<()> {
        let history = self
            .db
            .promote_queue_to_history(item, HistoryStatus::Completed, started.elapsed(), None)
            .await?;
        self.events.publish(Event::QueueItemRemoved { id: item.id });
        self.events.publish(Event::HistoryItemAdded {
            id: history.id,
            status: HistoryStatus::Completed,
        });
        Ok(())
    }

    async fn fail(&self, item: &QueueItem, started: Instant, reason: String) -> Result<()> {
        let history = self
            .db
            .promote_queue_to_history(
                item,
                HistoryStatus::Failed,
                started.elapsed(),
                Some(reason),
            )
            .await?;
        self.events.publish(Event::QueueItemRemoved { id: item.id });
        self.events.publish(Event::HistoryItemAdded {
            id: history.id,
            status: HistoryStatus::Failed,
        });
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::nzb::ParsedSegment;

    fn file(name: &str, size: i64) -> ParsedFile {
        ParsedFile {
            filename: name.to_string(),
            subject: format!("\"{name}\""),
            groups: vec!["alt.binaries.test".to_string()],
            segments: vec![ParsedSegment {
                number: 1,
                bytes: size,
                message_id: format!("<{name}@example>"),
            }],
        }
    }

    #[test]
    fn groups_old_style_rar_split_by_base_name() {
        let files = vec![file("movie.rar", 100), file("movie.r00", 100), file("movie.r01", 50)];
        let refs: Vec<&ParsedFile> = files.iter().collect();
        let (groups, remaining) = classify_rar_extension_groups(&refs);
        assert_eq!(groups.len(), 1);
        assert!(remaining.is_empty());
        assert_eq!(groups[0].file_parts.len(), 3);
        assert_eq!(groups[0].total_size, 250);
    }

    #[test]
    fn lone_bare_rar_file_is_its_own_group() {
        let files = vec![file("movie.rar", 100)];
        let refs: Vec<&ParsedFile> = files.iter().collect();
        let (groups, remaining) = classify_rar_extension_groups(&refs);
        assert_eq!(groups.len(), 1);
        assert!(remaining.is_empty());
    }

    #[test]
    fn continuation_without_first_volume_is_left_unclassified() {
        let files = vec![file("movie.r00", 100), file("movie.r01", 50)];
        let refs: Vec<&ParsedFile> = files.iter().collect();
        let (groups, remaining) = classify_rar_extension_groups(&refs);
        assert!(groups.is_empty());
        assert_eq!(remaining.len(), 2);
    }

    #[test]
    fn part_rar_files_are_left_for_the_generic_grouper() {
        let files = vec![file("movie.part01.rar", 100), file("movie.part02.rar", 100)];
        let refs: Vec<&ParsedFile> = files.iter().collect();
        let (groups, remaining) = classify_rar_extension_groups(&refs);
        assert!(groups.is_empty());
        assert_eq!(remaining.len(), 2);
    }

    #[test]
    fn genuine_rar_corruption_heuristic() {
        assert!(is_genuine_rar_corruption("unsupported rar"));
        assert!(!is_genuine_rar_corruption("not a recognized rar signature"));
    }
}
