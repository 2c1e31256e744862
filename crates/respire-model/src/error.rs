//! Error types for description and script parsing

use thiserror::Error;

/// Result type for model operations
pub type Result<T> = std::result::Result<T, ModelError>;

/// Errors raised while parsing the description or run script
#[derive(Error, Debug)]
pub enum ModelError {
    /// Lexical or structural error in a description file
    #[error("parse error at line {line}: {reason}")]
    Parse {
        /// 1-based line number of the offending input
        line: usize,
        /// What went wrong
        reason: String,
    },

    /// The file's version header is missing or newer than this build reads
    #[error("unsupported description version {found} (this build reads {supported})")]
    UnsupportedVersion {
        /// Version found in the header
        found: u32,
        /// Version this build supports
        supported: u32,
    },

    /// A required field was absent and has no default
    #[error("record {record}: required field {field} is missing")]
    MissingField {
        /// Record the field belongs to
        record: String,
        /// Field name
        field: String,
    },

    /// A field value could not be coerced to its schema type
    #[error("record {record}, field {field}: {reason}")]
    BadField {
        /// Record the field belongs to
        record: String,
        /// Field name
        field: String,
        /// What went wrong
        reason: String,
    },

    /// The run script ended before a required line
    #[error("run script truncated: expected {expected}")]
    ScriptTruncated {
        /// Description of the missing line
        expected: String,
    },

    /// A run script line did not scan
    #[error("run script line {line}: {reason}")]
    ScriptLine {
        /// 1-based line number
        line: usize,
        /// What went wrong
        reason: String,
    },

    /// Cross-record validation failure (dangling indices and the like)
    #[error("invalid description: {reason}")]
    Invalid {
        /// What went wrong
        reason: String,
    },

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ModelError {
    /// Create a parse error
    pub fn parse(line: usize, reason: impl Into<String>) -> Self {
        Self::Parse {
            line,
            reason: reason.into(),
        }
    }

    /// Create a cross-record validation error
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid {
            reason: reason.into(),
        }
    }

    /// Create a bad-field error
    pub fn bad_field(
        record: impl Into<String>,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::BadField {
            record: record.into(),
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ModelError::parse(7, "unexpected token");
        assert!(format!("{}", err).contains("line 7"));

        let err = ModelError::MissingField {
            record: "cellpop".into(),
            field: "count".into(),
        };
        assert!(format!("{}", err).contains("count"));
    }
}
