//! Error types for Multiflex
//!
//! This module defines the common error type surfaced by the format and
//! store crates. Every condition a caller can observe has its own variant.

use crate::types::Encoding;
use thiserror::Error;

/// Common result type for Multiflex operations
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error coming out of the backing engine
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Common error type for Multiflex
#[derive(Debug, Error)]
pub enum Error {
    // Lifecycle errors
    #[error("store has already been opened")]
    AlreadyOpened,

    #[error("store is closed")]
    StoreClosed,

    #[error("store is not writable")]
    NotWritable,

    // Schema and identity errors
    #[error("schema version too old: {version}, expected: {expected}")]
    SchemaTooOld { version: i32, expected: i32 },

    #[error("migration from version {from_version} failed (script {script})")]
    MigrationFailed {
        from_version: i32,
        script: String,
        #[source]
        source: Box<Error>,
    },

    #[error("invalid store identity: {0}")]
    InvalidStoreIdentity(String),

    // Metadata errors
    #[error("epoch has already been set and can only be set once")]
    EpochAlreadySet,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("reserved meta key can't be set: {0}")]
    ReservedKey(String),

    // Builder errors
    #[error("track {0} is not registered with the descriptor")]
    UnknownTrack(i32),

    #[error("value for track {0} has already been set")]
    DuplicateField(i32),

    #[error("track {0} has been added to the descriptor more than once")]
    DuplicateTrack(i32),

    #[error("timestamp not set")]
    MissingTimestamp,

    #[error("track {track} has encoding {encoding}, which can't hold {kind} values")]
    EncodingMismatch {
        track: i32,
        encoding: Encoding,
        kind: &'static str,
    },

    #[error("encoding {0} is not supported for field data")]
    UnsupportedEncoding(Encoding),

    // Decoding errors
    #[error("unknown encoding tag: {0}")]
    UnknownEncoding(i32),

    #[error("corrupt data: {0}")]
    DecodeCorrupt(String),

    #[error("descriptor not found: {0}")]
    DescriptorNotFound(u64),

    // Backing engine errors
    #[error("backing store error while trying to {op}: {source}")]
    BackingStore {
        op: String,
        #[source]
        source: BoxError,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    /// An error that occurred while a secondary cleanup failed as well.
    #[error("{source} (cleanup failed as well: {suppressed})")]
    WithSuppressed {
        #[source]
        source: Box<Error>,
        suppressed: Box<Error>,
    },
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a decode corruption error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::DecodeCorrupt(msg.into())
    }

    /// Create an invalid store identity error
    pub fn invalid_identity(msg: impl Into<String>) -> Self {
        Self::InvalidStoreIdentity(msg.into())
    }

    /// Wrap a backing engine failure with the operation that was attempted
    pub fn backing(op: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::BackingStore {
            op: op.into(),
            source: source.into(),
        }
    }

    /// Attach a secondary failure without losing the original cause
    #[must_use]
    pub fn with_suppressed(self, suppressed: Self) -> Self {
        Self::WithSuppressed {
            source: Box::new(self),
            suppressed: Box::new(suppressed),
        }
    }

    /// The original cause, looking through attached secondary failures
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::WithSuppressed { source, .. } => source.root(),
            other => other,
        }
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Self::DescriptorNotFound(_))
    }

    /// Check if this error indicates inconsistent persisted data
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self.root(),
            Self::DecodeCorrupt(_) | Self::UnknownEncoding(_) | Self::InvalidStoreIdentity(_)
        )
    }

    /// Check if this error was caused by API misuse rather than the store's state
    #[must_use]
    pub fn is_misuse(&self) -> bool {
        matches!(
            self.root(),
            Self::AlreadyOpened
                | Self::StoreClosed
                | Self::NotWritable
                | Self::EpochAlreadySet
                | Self::InvalidArgument(_)
                | Self::ReservedKey(_)
                | Self::UnknownTrack(_)
                | Self::DuplicateField(_)
                | Self::DuplicateTrack(_)
                | Self::MissingTimestamp
                | Self::EncodingMismatch { .. }
                | Self::UnsupportedEncoding(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_misuse() {
        assert!(Error::StoreClosed.is_misuse());
        assert!(Error::DuplicateField(3).is_misuse());
        assert!(!Error::corrupt("short index").is_misuse());
    }

    #[test]
    fn test_error_corruption() {
        assert!(Error::corrupt("bad").is_corruption());
        assert!(Error::UnknownEncoding(42).is_corruption());
        assert!(!Error::MissingTimestamp.is_corruption());
    }

    #[test]
    fn test_with_suppressed_keeps_cause() {
        let err = Error::SchemaTooOld {
            version: 1,
            expected: 2,
        }
        .with_suppressed(Error::backing("close database", "disk gone"));

        assert!(matches!(err.root(), Error::SchemaTooOld { .. }));
        assert!(err.source().is_some());
        assert!(err.to_string().contains("disk gone"));
    }

    #[test]
    fn test_backing_error_names_operation() {
        let err = Error::backing("select chunk", "boom");
        assert_eq!(
            err.to_string(),
            "backing store error while trying to select chunk: boom"
        );
    }
}
