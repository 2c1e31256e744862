//! Error types for the simulation engine

use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur while building or running a simulation
#[derive(Error, Debug)]
pub enum EngineError {
    /// Description-level failure surfaced by the model crate
    #[error("description error: {0}")]
    Model(#[from] respire_model::ModelError),

    /// Storage-level failure (archives, event tables)
    #[error("storage error: {0}")]
    Storage(#[from] respire_storage::StorageError),

    /// Bad wiring discovered while building the runtime graph
    #[error("network build error: {reason}")]
    Build {
        /// What went wrong
        reason: String,
    },

    /// Semantic misconfiguration (missing motor pools and the like)
    #[error("configuration error: {reason}")]
    Config {
        /// What went wrong
        reason: String,
    },

    /// Expression parse or evaluation failure
    #[error("expression error in {context:?}: {reason}")]
    Expression {
        /// The offending expression text or its role
        context: String,
        /// What went wrong
        reason: String,
    },

    /// Abdominal volume fell below the physiological bound
    #[error(
        "the abdominal volume has gotten too small (Vab = {vab:.6}); \
         perhaps the lumbar drive is too strong"
    )]
    AbdominalVolumeLimit {
        /// The offending volume in liters
        vab: f64,
    },

    /// A numerical solver failed to converge
    #[error("numerical failure in {context}: {reason}")]
    Numerical {
        /// Which solver or subsystem failed
        context: &'static str,
        /// Failure detail including the offending state
        reason: String,
    },

    /// The control peer went away while the engine was waiting on it
    #[error("control peer disconnected: {reason}")]
    PeerLost {
        /// What was being waited for
        reason: String,
    },

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Create a build error
    pub fn build(reason: impl Into<String>) -> Self {
        Self::Build {
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Create a numerical error
    pub fn numerical(context: &'static str, reason: impl Into<String>) -> Self {
        Self::Numerical {
            context,
            reason: reason.into(),
        }
    }

    /// Create an expression error
    pub fn expression(context: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Expression {
            context: context.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::AbdominalVolumeLimit { vab: 0.5 };
        assert!(format!("{}", err).contains("0.5"));

        let err = EngineError::numerical("lung ODE", "step size underflow");
        assert!(format!("{}", err).contains("lung ODE"));
    }
}
