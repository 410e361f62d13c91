//! The top-level error type and its mapping to process exit codes.

use thiserror::Error;

/// The process exit codes of krait.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(i32)]
pub enum ExitStatus {
    /// Everything worked.
    Success = 0,
    /// A generic failure.
    Error = 1,
    /// The solver found the request unsatisfiable.
    Unsatisfiable = 2,
    /// The user interrupted the operation.
    Interrupted = 3,
    /// Trust metadata validation failed.
    TrustError = 4,
}

/// The error type tying all subsystems together.
#[derive(Debug, Error)]
pub enum KraitError {
    /// A match spec could not be parsed.
    #[error(transparent)]
    InvalidSpec(#[from] krait_conda_types::ParseMatchSpecError),

    /// A channel could not be resolved, or is not whitelisted.
    #[error(transparent)]
    Channel(#[from] krait_conda_types::ParseChannelError),

    /// Fetching repodata failed.
    #[error(transparent)]
    Subdir(#[from] krait_fetch::SubdirError),

    /// A download failed.
    #[error(transparent)]
    Download(#[from] krait_fetch::DownloadError),

    /// The solver found no solution; the report is pre-rendered from the
    /// problem graph.
    #[error("the request is unsatisfiable\n{report}")]
    Unsatisfiable {
        /// The rendered problem report.
        report: String,
    },

    /// A pin excludes every candidate.
    #[error(transparent)]
    UnsatisfiablePin(#[from] krait_solve::UnsatisfiablePin),

    /// Trust metadata was rejected.
    #[error(transparent)]
    Trust(#[from] krait_trust::TrustError),

    /// Executing the transaction failed (after rollback).
    #[error(transparent)]
    Execute(#[from] crate::install::driver::ExecuteError),

    /// Any other io error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl KraitError {
    /// Maps the error onto the exit code contract.
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            KraitError::Unsatisfiable { .. } | KraitError::UnsatisfiablePin(_) => {
                ExitStatus::Unsatisfiable
            }
            KraitError::Trust(_) => ExitStatus::TrustError,
            KraitError::Download(krait_fetch::DownloadError::Interrupted) => {
                ExitStatus::Interrupted
            }
            KraitError::Execute(e) if e.is_interrupted() => ExitStatus::Interrupted,
            _ => ExitStatus::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_the_contract() {
        assert_eq!(
            KraitError::Unsatisfiable {
                report: String::new()
            }
            .exit_status(),
            ExitStatus::Unsatisfiable
        );
        assert_eq!(
            KraitError::Trust(krait_trust::TrustError::RoleFile("x".into())).exit_status(),
            ExitStatus::TrustError
        );
        assert_eq!(
            KraitError::Download(krait_fetch::DownloadError::Interrupted).exit_status(),
            ExitStatus::Interrupted
        );
        assert_eq!(ExitStatus::Success as i32, 0);
        assert_eq!(ExitStatus::Unsatisfiable as i32, 2);
        assert_eq!(ExitStatus::Interrupted as i32, 3);
        assert_eq!(ExitStatus::TrustError as i32, 4);
    }
}
