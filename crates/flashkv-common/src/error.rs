//! Error types for FlashKV
//!
//! One error enum is shared by every layer of the engine. Variants are grouped
//! by how the caller is expected to react: corruption and replay-consistency
//! failures are fatal, I/O failures propagate, exhaustion is back-pressure and
//! protocol conflicts are ordinary refusals.

use thiserror::Error;

/// Common result type for FlashKV operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for FlashKV
#[derive(Debug, Error)]
pub enum Error {
    // I/O errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    // Corruption of trusted metadata
    #[error("{structure} checksum mismatch: stored {stored:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        structure: &'static str,
        stored: u32,
        computed: u32,
    },

    #[error("{structure} has bad magic {found:08x}")]
    BadMagic { structure: &'static str, found: u32 },

    #[error("{structure} version {version} is not supported")]
    UnsupportedVersion {
        structure: &'static str,
        version: u16,
    },

    #[error("no valid copy of {region} survives on any device")]
    NoQuorum { region: String },

    #[error("metadata corruption: {0}")]
    Corruption(String),

    // Log replay invariants
    #[error("replay consistency violation: {0}")]
    Consistency(String),

    // Resource exhaustion
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    // Protocol and state conflicts
    #[error("busy: {0}")]
    Busy(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("shard not found: {0}")]
    ShardNotFound(u32),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("engine is shutting down")]
    ShuttingDown,
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a corruption error
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Create a replay consistency error
    pub fn consistency(msg: impl Into<String>) -> Self {
        Self::Consistency(msg.into())
    }

    /// Errors after which the engine must not keep serving data.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. }
                | Self::BadMagic { .. }
                | Self::UnsupportedVersion { .. }
                | Self::NoQuorum { .. }
                | Self::Corruption(_)
                | Self::Consistency(_)
        )
    }

    /// Check if this error is a corrupted-metadata error
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. } | Self::BadMagic { .. } | Self::Corruption(_)
        )
    }

    /// Check if the caller may retry the same request later
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy(_) | Self::OutOfMemory(_))
    }

    /// Status code reported to the surrounding engine
    #[must_use]
    pub const fn status_code(&self) -> i32 {
        match self {
            Self::DiskIo(_) | Self::Storage(_) => -5, // EIO
            Self::OutOfMemory(_) => -12,              // ENOMEM
            Self::Busy(_) => -16,                     // EBUSY
            Self::AlreadyExists(_) => -17,            // EEXIST
            Self::InvalidArgument(_) | Self::Configuration(_) => -22, // EINVAL
            Self::ShardNotFound(_) => -2,             // ENOENT
            Self::ShuttingDown => -108,               // ESHUTDOWN
            Self::ChecksumMismatch { .. }
            | Self::BadMagic { .. }
            | Self::UnsupportedVersion { .. }
            | Self::NoQuorum { .. }
            | Self::Corruption(_)
            | Self::Consistency(_)
            | Self::Internal(_) => -117, // EUCLEAN
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_fatal() {
        assert!(Error::corruption("descriptor").is_fatal());
        assert!(Error::consistency("lsn gap").is_fatal());
        assert!(
            Error::NoQuorum {
                region: "flash descriptor".into()
            }
            .is_fatal()
        );
        assert!(!Error::Busy("backup running".into()).is_fatal());
        assert!(!Error::storage("short read").is_fatal());
    }

    #[test]
    fn test_error_retryable() {
        assert!(Error::Busy("restore".into()).is_retryable());
        assert!(Error::OutOfMemory("pool".into()).is_retryable());
        assert!(!Error::invalid_argument("seqno").is_retryable());
    }

    #[test]
    fn test_error_status_code() {
        assert_eq!(Error::Busy("x".into()).status_code(), -16);
        assert_eq!(Error::AlreadyExists("x".into()).status_code(), -17);
        assert_eq!(Error::invalid_argument("x").status_code(), -22);
        assert_eq!(Error::corruption("x").status_code(), -117);
    }
}
