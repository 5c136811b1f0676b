//! yEnc article decoding.
//!
//! Thin wrapper over `nntp_rs::yenc::decode` that maps size/CRC mismatches
//! to [`Error::CorruptArticle`] instead of a generic decode error, so
//! callers upstream (the streaming reader, the import pipeline) can treat
//! "decoded but wrong" the same way as "failed to decode".

use crate::error::{Error, Result};

/// A decoded article body, trimmed to just what the rest of the crate needs.
#[derive(Debug, Clone)]
pub struct DecodedArticle {
    /// Decoded binary payload.
    pub data: Vec<u8>,
    /// Byte offset within the original file where this part begins, if the
    /// article carried a multipart `=ypart` header.
    pub begin: Option<u64>,
    /// Byte offset within the original file where this part ends (exclusive
    /// of the next part), if the article carried a multipart `=ypart` header.
    pub end: Option<u64>,
}

/// Decode a single yEnc-encoded article body and verify it against its own
/// trailer.
///
/// Returns [`Error::CorruptArticle`] when the decoded length doesn't match
/// the `=yend size=` field, or when the CRC32 the trailer declares doesn't
/// match the CRC32 actually computed over the decoded bytes.
pub fn decode(message_id: &str, body: &[u8]) -> Result<DecodedArticle> {
    let decoded = nntp_rs::yenc::decode(body).map_err(|e| Error::CorruptArticle {
        message_id: message_id.to_string(),
        reason: format!("yenc decode failed: {e}"),
    })?;

    if decoded.verify_crc32() == Some(false) {
        return Err(Error::CorruptArticle {
            message_id: message_id.to_string(),
            reason: "CRC32 mismatch".to_string(),
        });
    }

    let declared_size = decoded.trailer.size;
    if declared_size != decoded.data.len() as u64 {
        return Err(Error::CorruptArticle {
            message_id: message_id.to_string(),
            reason: format!(
                "size mismatch: trailer declares {declared_size}, decoded {}",
                decoded.data.len()
            ),
        });
    }

    let (begin, end) = match &decoded.part {
        Some(part) => (Some(part.begin), Some(part.end)),
        None => (None, None),
    };

    Ok(DecodedArticle {
        data: decoded.data,
        begin,
        end,
    })
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn encode_sample(data: &[u8], name: &str) -> Vec<u8> {
        nntp_rs::yenc::encode(data, name, 128, None).expect("encode should succeed")
    }

    #[test]
    fn decodes_well_formed_article() {
        let payload = b"hello world, this is yenc test payload data".to_vec();
        let encoded = encode_sample(&payload, "test.bin");
        let decoded = decode("<abc@example>", &encoded).expect("should decode");
        assert_eq!(decoded.data, payload);
    }

    #[test]
    fn rejects_garbage_input() {
        let err = decode("<abc@example>", b"not yenc at all").unwrap_err();
        assert!(matches!(err, Error::CorruptArticle { .. }));
    }

    #[test]
    fn rejects_truncated_article() {
        let payload = b"a somewhat longer payload so truncation is meaningful".to_vec();
        let encoded = encode_sample(&payload, "test.bin");
        let truncated = &encoded[..encoded.len() - 20];
        let err = decode("<abc@example>", truncated).unwrap_err();
        assert!(matches!(err, Error::CorruptArticle { .. }));
    }
}
