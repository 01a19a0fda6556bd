//! Errors produced by the calibration pipeline.
use thiserror::Error;

use crate::ensemble::ProjectorId;

/// Why a projector could not be calibrated.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    /// Every sampled subset was coplanar and the projector has no intrinsics to fall back on.
    Coplanar,
    /// No trial produced a fit with enough inliers in every view.
    NoConsensus { trials: usize },
    /// The projector is not observed by any camera.
    NoObservations,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Coplanar => write!(f, "no non-coplanar point subset found"),
            FailureReason::NoConsensus { trials } => {
                write!(f, "no accepted fit after {} trials", trials)
            }
            FailureReason::NoObservations => write!(f, "projector is not observed by any camera"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Calibration failed for projector {projector}: {reason}")]
    CalibrationFailed {
        projector: ProjectorId,
        reason: FailureReason,
    },

    #[error("Degenerate configuration: {0}")]
    Degenerate(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calibration_failed_display() {
        let err = Error::CalibrationFailed {
            projector: 2,
            reason: FailureReason::NoConsensus { trials: 40 },
        };
        assert_eq!(
            err.to_string(),
            "Calibration failed for projector 2: no accepted fit after 40 trials"
        );

        let err = Error::CalibrationFailed {
            projector: 0,
            reason: FailureReason::Coplanar,
        };
        assert_eq!(
            err.to_string(),
            "Calibration failed for projector 0: no non-coplanar point subset found"
        );
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert!(matches!(err, Error::IOError(_)));
    }
}
