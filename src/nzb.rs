//! NZB ingest: parsing, validation, and filename recovery.
//!
//! Delegates the actual XML parsing and round-trip serialization to
//! `nntp_rs::{parse_nzb, Nzb}` — this module adds the filename-from-subject
//! heuristic and the job-level validation the import pipeline needs.

use crate::error::{Error, Result};

/// A fully parsed and validated NZB, ready for import into the metadata store.
#[derive(Debug, Clone)]
pub struct ParsedNzb {
    /// Title from the NZB `<head>` metadata, if present.
    pub title: Option<String>,
    /// Archive password from the NZB `<head>` metadata, if present.
    pub password: Option<String>,
    /// One entry per `<file>` element, in document order.
    pub files: Vec<ParsedFile>,
}

/// A single file entry within a parsed NZB.
#[derive(Debug, Clone)]
pub struct ParsedFile {
    /// Filename recovered from the subject line (or a stable fallback).
    pub filename: String,
    /// The raw subject line, kept for diagnostics.
    pub subject: String,
    /// Newsgroups this file was posted to.
    pub groups: Vec<String>,
    /// Segments making up this file, in document order.
    pub segments: Vec<ParsedSegment>,
}

impl ParsedFile {
    /// Total size across all segments.
    pub fn total_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.bytes).sum()
    }
}

/// A single segment reference within a parsed NZB file.
#[derive(Debug, Clone)]
pub struct ParsedSegment {
    /// 1-based segment number within the file.
    pub number: u32,
    /// Declared size of this segment in bytes (the encoded size on the wire,
    /// not necessarily the exact decoded size).
    pub bytes: u64,
    /// Usenet message-id used to fetch this segment's article.
    pub message_id: String,
}

/// Parse and validate raw NZB bytes.
///
/// Rejects anything that isn't well-formed UTF-8 XML, anything
/// `nntp_rs::Nzb::validate` rejects (duplicate segment numbers, empty
/// segment lists), and NZBs that declare zero files — all mapped to
/// [`Error::MalformedNzb`].
pub fn parse(content: &[u8]) -> Result<ParsedNzb> {
    let text = std::str::from_utf8(content)
        .map_err(|e| Error::MalformedNzb(format!("not valid UTF-8: {e}")))?;

    let nzb =
        nntp_rs::parse_nzb(text).map_err(|e| Error::MalformedNzb(format!("parse failed: {e}")))?;

    nzb.validate()
        .map_err(|e| Error::MalformedNzb(format!("validation failed: {e}")))?;

    if nzb.files.is_empty() {
        return Err(Error::MalformedNzb("NZB declares zero files".into()));
    }

    let title = nzb.meta.get("title").cloned();
    let password = nzb.meta.get("password").cloned();

    let files = nzb
        .files
        .iter()
        .map(|file| ParsedFile {
            filename: filename_from_subject(&file.subject),
            subject: file.subject.clone(),
            groups: file.groups.clone(),
            segments: file
                .segments
                .iter()
                .map(|segment| ParsedSegment {
                    number: segment.number,
                    bytes: segment.bytes,
                    message_id: segment.message_id.clone(),
                })
                .collect(),
        })
        .collect();

    Ok(ParsedNzb {
        title,
        password,
        files,
    })
}

/// Recover a filename from a Usenet subject line.
///
/// Subjects typically embed the real filename in quotes, e.g.
/// `Some.Movie.2024 [01/50] - "Some.Movie.2024.part01.rar" yEnc (1/100)`.
/// Falls back to a stable hash-derived name when no quoted filename is
/// present, so repeated parses of the same subject always agree.
pub fn filename_from_subject(subject: &str) -> String {
    if let Some(start) = subject.find('"')
        && let Some(end) = subject[start + 1..].find('"')
    {
        let candidate = &subject[start + 1..start + 1 + end];
        if !candidate.is_empty() {
            return candidate.to_string();
        }
    }

    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    subject.hash(&mut hasher);
    format!("file_{:x}", hasher.finish())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_NZB: &str = r#"<?xml version="1.0" encoding="iso-8859-1"?>
<!DOCTYPE nzb PUBLIC "-//newzBin//DTD NZB 1.1//EN" "http://www.newzbin.com/DTD/nzb/nzb-1.1.dtd">
<nzb xmlns="http://www.newzbin.com/DTD/2003/nzb">
<head>
<meta type="title">Example.Release.2024</meta>
<meta type="password">secret</meta>
</head>
<file poster="poster@example.com" date="1700000000" subject='Example.Release.2024 [01/01] - "example.release.2024.r00" yEnc (1/2)'>
<groups>
<group>alt.binaries.test</group>
</groups>
<segments>
<segment bytes="500000" number="1">abc123@example</segment>
<segment bytes="500000" number="2">def456@example</segment>
</segments>
</file>
</nzb>
"#;

    #[test]
    fn parses_title_password_and_files() {
        let parsed = parse(SAMPLE_NZB.as_bytes()).expect("should parse");
        assert_eq!(parsed.title.as_deref(), Some("Example.Release.2024"));
        assert_eq!(parsed.password.as_deref(), Some("secret"));
        assert_eq!(parsed.files.len(), 1);
        assert_eq!(parsed.files[0].filename, "example.release.2024.r00");
        assert_eq!(parsed.files[0].segments.len(), 2);
        assert_eq!(parsed.files[0].total_bytes(), 1_000_000);
    }

    #[test]
    fn rejects_non_utf8() {
        let bytes = vec![0xff, 0xfe, 0xfd];
        let err = parse(&bytes).unwrap_err();
        assert!(matches!(err, Error::MalformedNzb(_)));
    }

    #[test]
    fn rejects_non_xml() {
        let err = parse(b"not xml at all").unwrap_err();
        assert!(matches!(err, Error::MalformedNzb(_)));
    }

    #[test]
    fn filename_from_subject_extracts_quoted_name() {
        let subject = r#"Release [01/10] - "my.file.part01.rar" yEnc (1/50)"#;
        assert_eq!(filename_from_subject(subject), "my.file.part01.rar");
    }

    #[test]
    fn filename_from_subject_falls_back_to_stable_hash() {
        let subject = "no quotes here at all";
        let first = filename_from_subject(subject);
        let second = filename_from_subject(subject);
        assert_eq!(first, second);
        assert!(first.starts_with("file_"));
    }
}
