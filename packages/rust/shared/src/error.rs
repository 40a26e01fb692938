//! Error types for GeoHarvest.
//!
//! Library crates use [`HarvestError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// How far an error reaches when it happens inside a harvest job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Fatal to the whole job (endpoint unreachable, nothing discovered, ...).
    Gather,
    /// Recorded against a single tracking record; the job carries on.
    Object,
}

/// Top-level error type for all GeoHarvest operations.
#[derive(Debug, thiserror::Error)]
pub enum HarvestError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// A remote document or page could not be retrieved.
    #[error("retrieval error for {url}: {reason}")]
    Retrieval {
        url: String,
        status: Option<u16>,
        reason: String,
    },

    /// The raw bytes are not a parseable XML document.
    #[error("malformed document: {message}")]
    MalformedDocument { message: String },

    /// The tracking record reached import without retrieved content.
    #[error("no content available for GUID {guid}")]
    NoContent { guid: String },

    /// Neither accepted date format matched the metadata date.
    #[error("could not extract reference date for GUID {guid} ({value})")]
    MissingReferenceDate { guid: String, value: String },

    /// Schema-profile validation failed and the reject policy is on.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// The gather stage produced nothing to harvest.
    #[error("no records received: {message}")]
    NoRecords { message: String },

    /// Every candidate slug for a record name is already taken.
    #[error("could not generate a unique name from {title:?}, please choose a more unique title")]
    NameExhausted { title: String },

    /// Metadata date unchanged but the document bytes differ.
    #[error(
        "the contents of document with GUID {guid} changed, but the metadata date has not been updated\nDiff:\n{diff}"
    )]
    Inconsistency { guid: String, diff: String },

    /// Job-level failure of the gather stage.
    #[error("gather error: {0}")]
    Gather(String),

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, HarvestError>;

impl HarvestError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a malformed-document error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::MalformedDocument {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a retrieval error that never got an HTTP status.
    pub fn retrieval(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Retrieval {
            url: url.into(),
            status: None,
            reason: reason.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Classify the error for the job runner.
    pub fn severity(&self) -> Severity {
        match self {
            Self::Config { .. } | Self::NoRecords { .. } | Self::Gather(_) | Self::Storage(_) => {
                Severity::Gather
            }
            Self::Io { .. } => Severity::Gather,
            _ => Severity::Object,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = HarvestError::config("unknown profile");
        assert_eq!(err.to_string(), "config error: unknown profile");

        let err = HarvestError::Retrieval {
            url: "http://x/csw".into(),
            status: Some(503),
            reason: "Service Unavailable".into(),
        };
        assert!(err.to_string().contains("http://x/csw"));
    }

    #[test]
    fn inconsistency_carries_diff() {
        let err = HarvestError::Inconsistency {
            guid: "abc".into(),
            diff: "-old\n+new".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("GUID abc"));
        assert!(msg.contains("-old\n+new"));
    }

    #[test]
    fn severity_split() {
        assert_eq!(
            HarvestError::NoRecords {
                message: "empty".into()
            }
            .severity(),
            Severity::Gather
        );
        assert_eq!(HarvestError::parse("bad xml").severity(), Severity::Object);
        assert_eq!(
            HarvestError::NameExhausted {
                title: "t".into()
            }
            .severity(),
            Severity::Object
        );
    }
}
