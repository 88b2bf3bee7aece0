//! Error taxonomy for the training loop.
//!
//! Fatal conditions are [`TrainError`] values raised through `anyhow`, so callers
//! can recover the category with `downcast_ref`. Per-batch problems that only
//! cause a batch to be skipped are [`SkipReason`] values and never leave the
//! step executor as errors.

use thiserror::Error;

/// Fatal errors that terminate the whole run.
#[derive(Debug, Error)]
pub enum TrainError {
    /// A required configuration field is absent.
    #[error("missing required configuration field `{field}`")]
    MissingConfig { field: String },
    /// A configuration value is present but unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The total generator loss was NaN or infinite.
    #[error("non-finite generator loss {value} at step {step}")]
    NonFiniteLoss { step: usize, value: f32 },
    /// Attention and validity mask disagree in shape.
    #[error("alignment shape mismatch: attention {attention:?} vs mask {mask:?}")]
    AlignmentShape {
        attention: Vec<usize>,
        mask: Vec<usize>,
    },
    /// A checkpoint archive is malformed.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
    /// Another worker failed, so this one stopped at a collective.
    #[error("worker {rank} aborted because a peer failed")]
    WorkerAborted { rank: usize },
    /// Workers reached different collectives at the same time.
    #[error("worker {rank} reached collective `{found}` while peers were at `{expected}`")]
    CollectiveMismatch {
        rank: usize,
        expected: String,
        found: String,
    },
}

impl TrainError {
    /// Shorthand for [`TrainError::MissingConfig`].
    pub fn missing(field: impl Into<String>) -> Self {
        Self::MissingConfig {
            field: field.into(),
        }
    }
}

/// Reasons a single batch is skipped without aborting training.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SkipReason {
    /// Per-example lengths are zero or exceed the padded tensor extents.
    #[error("invalid lengths: {0}")]
    InvalidLengths(String),
    /// The aligner produced NaN or infinite attention weights.
    #[error("aligner produced non-finite attention")]
    NonFiniteAttention,
    /// The shortest example is too short for a loss window.
    #[error("segment too short: window {window}, shortest valid length {valid}")]
    SegmentTooShort { window: usize, valid: usize },
}
