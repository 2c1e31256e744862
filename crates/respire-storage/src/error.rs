//! Error types for the storage layer

use thiserror::Error;

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur in the storage layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A binary file did not carry the expected magic number
    #[error("invalid magic number (expected {expected:?})")]
    InvalidMagic {
        /// The magic the reader expected
        expected: [u8; 4],
    },

    /// A binary file's version is newer than this build reads
    #[error("unsupported format version {version} (supported: {supported})")]
    UnsupportedVersion {
        /// Version found in the file
        version: u32,
        /// Version this build supports
        supported: u32,
    },

    /// A checksum did not match the stored value
    #[error("checksum mismatch in {section}")]
    ChecksumMismatch {
        /// Which part of the file failed
        section: &'static str,
    },

    /// A file was shorter than its headers claim
    #[error("file truncated: {reason}")]
    Truncated {
        /// What was missing
        reason: String,
    },

    /// A channel index is out of range for the file
    #[error("no such channel {channel}")]
    NoSuchChannel {
        /// The offending channel number
        channel: u32,
    },

    /// A textual record did not scan
    #[error("malformed record at line {line}: {reason}")]
    MalformedRecord {
        /// 1-based line number
        line: usize,
        /// What went wrong
        reason: String,
    },

    /// Caller misuse of a writer (row outside a block and the like)
    #[error("writer misuse: {reason}")]
    Misuse {
        /// What went wrong
        reason: &'static str,
    },
}

impl StorageError {
    /// Create a truncation error
    pub fn truncated(reason: impl Into<String>) -> Self {
        Self::Truncated {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::NoSuchChannel { channel: 9 };
        assert!(format!("{}", err).contains("9"));
    }
}
