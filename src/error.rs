//! Error types for usenetdav
//!
//! This module provides the error taxonomy used throughout the crate:
//! - Content-level errors (malformed NZB, corrupt or missing articles)
//! - Transport-level errors (unhealthy providers, pool exhaustion, timeouts)
//! - Validation and storage-conflict errors for the ingest API
//! - HTTP status code mapping for an embedding API layer

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for usenetdav operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for usenetdav.
///
/// Every variant maps to exactly one entry in the error taxonomy from the
/// design: content-level errors are surfaced to callers, transport-level
/// errors are retried internally up to configured bounds before surfacing,
/// and `StoreConflict`/`ValidationError` are handled by the ingest layer.
#[derive(Debug, Error)]
pub enum Error {
    /// The NZB document is not well-formed XML, or declares zero files.
    #[error("malformed NZB: {0}")]
    MalformedNzb(String),

    /// A decoded article's length or CRC32 did not match its yEnc trailer.
    #[error("corrupt article {message_id}: {reason}")]
    CorruptArticle {
        /// The article's Usenet message-id
        message_id: String,
        /// Why the article was rejected (size mismatch, CRC mismatch, ...)
        reason: String,
    },

    /// Every candidate provider returned a permanent "no such article" response.
    #[error("article {message_id} missing from all providers")]
    ArticleMissing {
        /// The article's Usenet message-id
        message_id: String,
    },

    /// At least one candidate provider failed transiently (timeout, reset)
    /// and no provider served the article.
    #[error("article {message_id} unavailable: {reason}")]
    ArticleUnavailable {
        /// The article's Usenet message-id
        message_id: String,
        /// Summary of the last transient failure
        reason: String,
    },

    /// A provider has exceeded its failure budget and is in cooldown.
    #[error("provider {provider} is unhealthy: {reason}")]
    ProviderUnhealthy {
        /// Provider host:port identifier
        provider: String,
        /// Why the provider was marked unhealthy
        reason: String,
    },

    /// No connection slot became available before the caller's deadline.
    #[error("connection pool exhausted for provider {provider}")]
    PoolExhausted {
        /// Provider host:port identifier
        provider: String,
    },

    /// An operation exceeded its configured time budget.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Request failed input validation; surfaced directly to the ingest API.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// An optimistic transaction conflict on the metadata store.
    #[error("store conflict: {0}")]
    StoreConflict(String),

    /// Requested item, queue entry, or history entry does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Metadata store error not otherwise classified above.
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Underlying NNTP protocol or connection error.
    #[error("NNTP error: {0}")]
    Nntp(#[from] nntp_rs::NntpError),

    /// I/O error (database file creation, etc).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error with context about which setting is invalid.
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "providers[0].host")
        key: Option<String>,
    },

    /// Shutdown in progress - not accepting new ingest requests.
    #[error("shutdown in progress: not accepting new jobs")]
    ShuttingDown,

    /// Catch-all for errors outside the domain taxonomy above.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for errors the design calls "transient": worth retrying on a
    /// different provider or after a short backoff, as opposed to permanent
    /// content-level failures.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::ArticleUnavailable { .. }
                | Error::ProviderUnhealthy { .. }
                | Error::PoolExhausted { .. }
                | Error::Timeout(_)
                | Error::StoreConflict(_)
        )
    }
}

/// API error response format.
///
/// Returned by an embedding API layer when an error occurs. Follows a
/// standard shape with a machine-readable code, human-readable message, and
/// optional contextual details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    /// The error details
    pub error: ErrorDetail,
}

/// Detailed error information for API responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Machine-readable error code (e.g., "article_missing", "validation_error")
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Optional additional context about the error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// Create a new API error with code and message
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                details: None,
            },
        }
    }

    /// Create an API error with additional details
    pub fn with_details(
        code: impl Into<String>,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                details: Some(details),
            },
        }
    }
}

/// Convert domain errors to HTTP status codes for an embedding API layer.
pub trait ToHttpStatus {
    /// Get the HTTP status code for this error
    fn status_code(&self) -> u16;
    /// Get the machine-readable error code
    fn error_code(&self) -> &'static str;
}

impl ToHttpStatus for Error {
    fn status_code(&self) -> u16 {
        match self {
            Error::MalformedNzb(_) => 422,
            Error::CorruptArticle { .. } => 422,
            Error::ArticleMissing { .. } => 404,
            Error::ArticleUnavailable { .. } => 502,
            Error::ProviderUnhealthy { .. } => 503,
            Error::PoolExhausted { .. } => 503,
            Error::Timeout(_) => 504,
            Error::ValidationError(_) => 400,
            Error::StoreConflict(_) => 409,
            Error::NotFound(_) => 404,
            Error::Sqlx(_) => 500,
            Error::Nntp(_) => 502,
            Error::Io(_) => 500,
            Error::Config { .. } => 400,
            Error::ShuttingDown => 503,
            Error::Other(_) => 500,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Error::MalformedNzb(_) => "malformed_nzb",
            Error::CorruptArticle { .. } => "corrupt_article",
            Error::ArticleMissing { .. } => "article_missing",
            Error::ArticleUnavailable { .. } => "article_unavailable",
            Error::ProviderUnhealthy { .. } => "provider_unhealthy",
            Error::PoolExhausted { .. } => "pool_exhausted",
            Error::Timeout(_) => "timeout",
            Error::ValidationError(_) => "validation_error",
            Error::StoreConflict(_) => "store_conflict",
            Error::NotFound(_) => "not_found",
            Error::Sqlx(_) => "database_error",
            Error::Nntp(_) => "nntp_error",
            Error::Io(_) => "io_error",
            Error::Config { .. } => "config_error",
            Error::ShuttingDown => "shutting_down",
            Error::Other(_) => "internal_error",
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        let code = error.error_code().to_string();
        let message = error.to_string();

        let details = match &error {
            Error::CorruptArticle { message_id, .. }
            | Error::ArticleMissing { message_id }
            | Error::ArticleUnavailable { message_id, .. } => Some(serde_json::json!({
                "message_id": message_id,
            })),
            Error::ProviderUnhealthy { provider, .. } | Error::PoolExhausted { provider } => {
                Some(serde_json::json!({ "provider": provider }))
            }
            Error::Config { key, .. } => key
                .as_ref()
                .map(|k| serde_json::json!({ "key": k })),
            _ => None,
        };

        ApiError {
            error: ErrorDetail {
                code,
                message,
                details,
            },
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn all_error_variants() -> Vec<(Error, u16, &'static str)> {
        vec![
            (Error::MalformedNzb("zero files".into()), 422, "malformed_nzb"),
            (
                Error::CorruptArticle {
                    message_id: "<abc@example>".into(),
                    reason: "crc mismatch".into(),
                },
                422,
                "corrupt_article",
            ),
            (
                Error::ArticleMissing {
                    message_id: "<abc@example>".into(),
                },
                404,
                "article_missing",
            ),
            (
                Error::ArticleUnavailable {
                    message_id: "<abc@example>".into(),
                    reason: "timeout".into(),
                },
                502,
                "article_unavailable",
            ),
            (
                Error::ProviderUnhealthy {
                    provider: "news.example:563".into(),
                    reason: "auth failed".into(),
                },
                503,
                "provider_unhealthy",
            ),
            (
                Error::PoolExhausted {
                    provider: "news.example:563".into(),
                },
                503,
                "pool_exhausted",
            ),
            (Error::Timeout("lease acquire".into()), 504, "timeout"),
            (
                Error::ValidationError("missing nzb file".into()),
                400,
                "validation_error",
            ),
            (
                Error::StoreConflict("queue_items version mismatch".into()),
                409,
                "store_conflict",
            ),
            (Error::NotFound("item 123".into()), 404, "not_found"),
            (
                Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone")),
                500,
                "io_error",
            ),
            (
                Error::Config {
                    message: "bad value".into(),
                    key: Some("providers[0].host".into()),
                },
                400,
                "config_error",
            ),
            (Error::ShuttingDown, 503, "shutting_down"),
            (Error::Other("unknown".into()), 500, "internal_error"),
        ]
    }

    #[test]
    fn status_and_code_match_for_every_variant() {
        for (err, expected_status, expected_code) in all_error_variants() {
            assert_eq!(err.status_code(), expected_status, "{err}");
            assert_eq!(err.error_code(), expected_code, "{err}");
        }
    }

    #[test]
    fn transient_classification() {
        assert!(
            Error::ArticleUnavailable {
                message_id: "<a@b>".into(),
                reason: "reset".into()
            }
            .is_transient()
        );
        assert!(Error::Timeout("x".into()).is_transient());
        assert!(Error::StoreConflict("x".into()).is_transient());
        assert!(!Error::ArticleMissing {
            message_id: "<a@b>".into()
        }
        .is_transient());
        assert!(!Error::MalformedNzb("x".into()).is_transient());
    }

    #[test]
    fn api_error_round_trips_through_json() {
        let err = Error::ArticleMissing {
            message_id: "<abc@example>".into(),
        };
        let api: ApiError = err.into();
        let json = serde_json::to_value(&api).unwrap();
        assert_eq!(json["error"]["code"], "article_missing");
        assert_eq!(json["error"]["details"]["message_id"], "<abc@example>");
    }

    #[test]
    fn config_error_without_key_has_no_details() {
        let err = Error::Config {
            message: "bad".into(),
            key: None,
        };
        let api: ApiError = err.into();
        assert!(api.error.details.is_none());
    }
}
