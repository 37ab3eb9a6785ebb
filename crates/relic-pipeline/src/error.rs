//! Error types for the restoration pipeline.
//!
//! Three layers:
//!
//! - [`ValidationError`]: file or dimension checks, carrying fatal
//!   errors and non-fatal warnings side by side.
//! - [`StageError`]: anything that goes wrong inside a single stage.
//! - [`PipelineError`]: what the controller and [`crate::process`]
//!   return, attributing stage failures to the stage that raised them.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pipeline::StageId;

/// Outcome of a validation pass: fatal errors block, warnings do not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    /// Fatal problems. A non-empty list fails the run.
    pub errors: Vec<String>,
    /// Non-fatal observations, logged and carried forward.
    pub warnings: Vec<String>,
}

impl ValidationError {
    /// `true` when there are no fatal errors.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Record a fatal error.
    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    /// Record a warning.
    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Append another result's errors and warnings.
    pub fn extend(&mut self, other: Self) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Convert into `Err(self)` when any fatal error was recorded,
    /// otherwise return the warnings.
    ///
    /// # Errors
    ///
    /// Returns `self` when [`is_valid`](Self::is_valid) is `false`.
    pub fn into_result(self) -> Result<Vec<String>, Self> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            f.write_str("validation passed")
        } else {
            write!(f, "validation failed: {}", self.errors.join("; "))
        }
    }
}

impl std::error::Error for ValidationError {}

/// Errors raised inside a single pipeline stage.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// Input bytes are malformed or in a format the decoder cannot read.
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),

    /// The restored raster could not be encoded to the output format.
    #[error("failed to encode output: {0}")]
    Encode(String),

    /// Decoded dimensions fall outside the configured bounds.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// An inpainting primitive was handed inconsistent inputs.
    #[error("inpainting failed: {0}")]
    Inpaint(String),

    /// The configuration is inconsistent.
    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),
}

/// Errors returned by [`crate::Controller::process`] and
/// [`crate::process`].
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A stage failed. The run was aborted and no partial result exists.
    #[error("stage {stage} failed after {elapsed:?}: {source}")]
    Stage {
        /// The stage that raised the error.
        stage: StageId,
        /// Time from the start of the run to the failure.
        elapsed: Duration,
        /// The underlying stage error.
        #[source]
        source: StageError,
    },

    /// The run was cancelled at a stage boundary.
    #[error("pipeline cancelled")]
    Cancelled,

    /// `process` was called while another run was in flight.
    #[error("pipeline is already processing")]
    AlreadyProcessing,

    /// File-level validation failed before any stage ran.
    #[error(transparent)]
    Validation(ValidationError),

    /// The configuration is inconsistent.
    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),
}

impl PipelineError {
    /// The stage a failure is attributed to, if any.
    #[must_use]
    pub const fn stage(&self) -> Option<StageId> {
        match self {
            Self::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Whether this is the cancellation outcome rather than a failure.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_with_only_warnings_is_valid() {
        let mut v = ValidationError::default();
        v.warn("large image");
        assert!(v.is_valid());
        assert_eq!(v.into_result(), Ok(vec!["large image".to_string()]));
    }

    #[test]
    fn validation_with_errors_is_invalid() {
        let mut v = ValidationError::default();
        v.error("file is empty");
        v.warn("unknown extension");
        assert!(!v.is_valid());
        let err = v.clone().into_result();
        assert_eq!(err, Err(v));
    }

    #[test]
    fn validation_display_joins_errors() {
        let mut v = ValidationError::default();
        v.error("a");
        v.error("b");
        assert_eq!(v.to_string(), "validation failed: a; b");
    }

    #[test]
    fn stage_error_carries_stage() {
        let err = PipelineError::Stage {
            stage: StageId::Restoration,
            elapsed: Duration::from_millis(5),
            source: StageError::Encode("boom".to_string()),
        };
        assert_eq!(err.stage(), Some(StageId::Restoration));
        assert!(err.to_string().contains("restoration"));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn cancelled_is_not_attributed() {
        assert_eq!(PipelineError::Cancelled.stage(), None);
        assert!(PipelineError::Cancelled.is_cancelled());
        assert!(!PipelineError::AlreadyProcessing.is_cancelled());
    }
}
