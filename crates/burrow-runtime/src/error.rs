//! Run-stage errors and their process exit codes.

use burrow_common::error::BurrowError;
use thiserror::Error;

/// Failure of one stage of a container run.
#[derive(Debug, Error)]
pub enum RunError {
    /// The container could not be prepared for execution.
    #[error("container setup failed: {0}")]
    Init(#[source] BurrowError),

    /// No runtime or emulator executable could be located.
    #[error("executable not found: {0}")]
    RuntimeNotFound(#[source] BurrowError),

    /// The execution spec could not be generated, loaded or saved.
    #[error("execution spec failed: {0}")]
    Spec(#[source] BurrowError),

    /// The container environment contains an invalid entry.
    #[error("invalid environment: {0}")]
    Environment(#[source] BurrowError),

    /// The runtime process could not be launched or supervised.
    #[error("failed to launch {program}: {source}")]
    Launch {
        /// Program that failed to start.
        program: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

impl RunError {
    /// Returns the process exit code reported for this failure.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Init(_) => 2,
            Self::RuntimeNotFound(_) | Self::Launch { .. } => 1,
            Self::Spec(_) => 4,
            Self::Environment(_) => 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_the_failing_stage() {
        let err = || BurrowError::Config {
            message: "x".into(),
        };
        assert_eq!(RunError::Init(err()).exit_code(), 2);
        assert_eq!(RunError::RuntimeNotFound(err()).exit_code(), 1);
        assert_eq!(RunError::Spec(err()).exit_code(), 4);
        assert_eq!(RunError::Environment(err()).exit_code(), 5);
    }
}
