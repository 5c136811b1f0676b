//! Multipart filename-pattern recognition.
//!
//! Groups NZB files whose names follow the `name.001`/`name.002` or
//! `name.partNN.rar` conventions into a single logical [`MultipartFile`],
//! with `file_parts[i]` holding the i-th contiguous piece's segment list.
//!
//! Pattern recognition is grounded on the teacher's
//! `downloader::direct_unpack::rar_detection` (same `.to_lowercase()` then
//! `rfind`/`strip_suffix` style used for `is_first_rar_volume`), generalized
//! from "is this the first RAR volume" to "which base name and piece index
//! does this filename belong to".

use crate::nzb::ParsedFile;
use crate::types::{MultipartFileDescriptor, RarPart, SegmentRef};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

fn segment_refs(file: &ParsedFile) -> Vec<SegmentRef> {
    file.segments
        .iter()
        .map(|s| SegmentRef {
            message_id: s.message_id.clone(),
            size: s.bytes as i64,
        })
        .collect()
}

static NUMERIC_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<base>.+)\.(?P<num>\d{2,4})$").unwrap());

static PART_RAR_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(?P<base>.+)\.part(?P<num>\d{1,4})\.rar$").unwrap());

/// A recognized multipart filename: which logical base it belongs to and
/// its 1-based piece index.
struct PieceMatch<'a> {
    base: String,
    index: u32,
    file: &'a ParsedFile,
}

fn match_piece(file: &ParsedFile) -> Option<PieceMatch<'_>> {
    if let Some(caps) = PART_RAR_SUFFIX.captures(&file.filename) {
        let base = caps["base"].to_lowercase();
        let index: u32 = caps["num"].parse().ok()?;
        return Some(PieceMatch { base, index, file });
    }
    if let Some(caps) = NUMERIC_SUFFIX.captures(&file.filename) {
        let base = caps["base"].to_lowercase();
        let index: u32 = caps["num"].parse().ok()?;
        return Some(PieceMatch { base, index, file });
    }
    None
}

/// One recognized multipart group, ready to become an `Item` + descriptor.
pub struct MultipartGroup {
    /// Display name for the assembled file (the shared base name).
    pub base_name: String,
    /// Total size across every piece.
    pub total_size: i64,
    /// Piece segment lists in index order.
    pub file_parts: Vec<RarPart>,
}

/// Scan an NZB's files for multipart groups. Files matching a recognized
/// pattern are grouped and consumed; everything else is returned untouched
/// for the caller to import as plain `NzbFile` items.
///
/// A "group" of exactly one piece is not treated as multipart — it's left
/// in `remaining` so a lone `archive.001` with no sibling still imports as
/// a regular file rather than a single-piece `MultipartFile`.
pub fn group_multipart_files(files: &[ParsedFile]) -> (Vec<MultipartGroup>, Vec<&ParsedFile>) {
    let mut by_base: BTreeMap<String, Vec<PieceMatch<'_>>> = BTreeMap::new();
    let mut unmatched: Vec<&ParsedFile> = Vec::new();

    for file in files {
        match match_piece(file) {
            Some(piece) => by_base.entry(piece.base.clone()).or_default().push(piece),
            None => unmatched.push(file),
        }
    }

    let mut groups = Vec::new();
    for (base, mut pieces) in by_base {
        if pieces.len() < 2 {
            unmatched.extend(pieces.into_iter().map(|p| p.file));
            continue;
        }
        pieces.sort_by_key(|p| p.index);

        let file_parts: Vec<RarPart> = pieces
            .iter()
            .map(|p| RarPart {
                segments: segment_refs(p.file),
            })
            .collect();
        let total_size = file_parts
            .iter()
            .flat_map(|p| p.segments.iter())
            .map(|s| s.size)
            .sum();

        groups.push(MultipartGroup {
            base_name: base,
            total_size,
            file_parts,
        });
    }

    (groups, unmatched)
}

/// Build the persistable descriptor for a recognized group.
pub fn descriptor_for(item_id: uuid::Uuid, group: &MultipartGroup) -> MultipartFileDescriptor {
    MultipartFileDescriptor {
        item_id,
        file_parts: group.file_parts.clone(),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SegmentRef;

    fn file(name: &str, size: i64) -> ParsedFile {
        ParsedFile {
            filename: name.to_string(),
            subject: format!("\"{name}\""),
            groups: vec!["alt.binaries.test".to_string()],
            segments: vec![crate::nzb::ParsedSegment {
                number: 1,
                bytes: size,
                message_id: format!("<{name}@example>"),
            }],
        }
    }

    fn parsed_file_with_segment_ref(name: &str, size: i64) -> ParsedFile {
        file(name, size)
    }

    #[test]
    fn groups_numeric_suffix_pieces_in_order() {
        let files = vec![
            parsed_file_with_segment_ref("movie.002", 100),
            parsed_file_with_segment_ref("movie.001", 100),
            parsed_file_with_segment_ref("movie.003", 50),
        ];
        let (groups, unmatched) = group_multipart_files(&files);
        assert_eq!(groups.len(), 1);
        assert!(unmatched.is_empty());
        assert_eq!(groups[0].file_parts.len(), 3);
        assert_eq!(groups[0].total_size, 250);
    }

    #[test]
    fn groups_part_rar_pieces_case_insensitively() {
        let files = vec![
            file("Movie.Part01.RAR", 100),
            file("Movie.Part02.RAR", 100),
        ];
        let (groups, _) = group_multipart_files(&files);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].base_name, "movie");
    }

    #[test]
    fn lone_numeric_suffix_file_is_left_unmatched() {
        let files = vec![file("sample.001", 10)];
        let (groups, unmatched) = group_multipart_files(&files);
        assert!(groups.is_empty());
        assert_eq!(unmatched.len(), 1);
    }

    #[test]
    fn plain_filenames_are_unmatched() {
        let files = vec![file("readme.txt", 10), file("movie.mkv", 10)];
        let (groups, unmatched) = group_multipart_files(&files);
        assert!(groups.is_empty());
        assert_eq!(unmatched.len(), 2);
    }
}
