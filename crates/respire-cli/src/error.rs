//! Error handling for the respire CLI

use thiserror::Error;

/// Result type for CLI operations
pub type CliResult<T> = Result<T, CliError>;

/// CLI-specific errors
#[derive(Error, Debug)]
pub enum CliError {
    /// Model layer error
    #[error("description error: {0}")]
    Model(#[from] respire_model::ModelError),

    /// Storage layer error
    #[error("storage error: {0}")]
    Storage(#[from] respire_storage::StorageError),

    /// Engine layer error
    #[error("engine error: {0}")]
    Engine(#[from] respire_engine::EngineError),

    /// Bad command-line or script/flag combination
    #[error("configuration error: {0}")]
    Config(String),

    /// Socket setup or peer failure
    #[error("connection error: {0}")]
    Connection(String),

    /// IO error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl CliError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }
}
