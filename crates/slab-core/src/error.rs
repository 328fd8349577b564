//! Error types for the slicing and transfer engine.

use thiserror::Error;

/// Errors that can occur while planning or executing a processing stage.
#[derive(Error, Debug)]
pub enum SlabError {
    /// The preview specification is malformed or out of range.
    #[error("invalid preview on dimension {dim}: {message}")]
    Preview { dim: usize, message: String },

    /// Padding requested on a dimension that is neither core nor the fast slice dimension.
    #[error("cannot pad dimension {dim} of pattern {pattern}: {reason}")]
    InvalidPaddingDimension {
        dim: usize,
        pattern: String,
        reason: String,
    },

    /// Pattern missing from a dataset, or its dimensions do not cover the rank.
    #[error("pattern mismatch: {0}")]
    PatternMismatch(String),

    /// Pattern name outside the registry.
    #[error("unknown pattern: {0}")]
    UnknownPattern(String),

    /// The frame processing callback failed.
    #[error("frame processing failed in stage '{stage}'")]
    FrameProcessing {
        stage: String,
        #[source]
        source: anyhow::Error,
    },

    /// A collective barrier did not complete in time.
    #[error("rank {rank} timed out waiting on barrier '{tag}'")]
    BarrierTimeout { tag: String, rank: usize },

    /// Ranks reached a barrier with different tags.
    #[error("barrier tag mismatch: {0}")]
    BarrierMismatch(String),

    /// Collective communication failed.
    #[error("communication error: {0}")]
    Communication(String),

    /// Backing store error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Array shapes do not agree.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Checkpoint could not be read or written.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Dataset not registered in the pipeline context.
    #[error("dataset not found: {0}")]
    DatasetNotFound(String),
}

impl SlabError {
    /// Create a Preview error.
    pub fn preview(dim: usize, message: impl Into<String>) -> Self {
        Self::Preview {
            dim,
            message: message.into(),
        }
    }

    /// Create an InvalidPaddingDimension error.
    pub fn invalid_padding(dim: usize, pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPaddingDimension {
            dim,
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }

    /// Create a PatternMismatch error.
    pub fn pattern_mismatch(msg: impl Into<String>) -> Self {
        Self::PatternMismatch(msg.into())
    }

    /// Create a Storage error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a ShapeMismatch error.
    pub fn shape_mismatch(msg: impl Into<String>) -> Self {
        Self::ShapeMismatch(msg.into())
    }

    /// Create a Checkpoint error.
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create a Communication error.
    pub fn communication(msg: impl Into<String>) -> Self {
        Self::Communication(msg.into())
    }

    /// Whether the error is fatal for every rank of the run, not only the caller.
    pub fn is_collective(&self) -> bool {
        matches!(
            self,
            Self::BarrierTimeout { .. } | Self::BarrierMismatch(_) | Self::Communication(_)
        )
    }
}

impl From<std::io::Error> for SlabError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for SlabError {
    fn from(err: serde_json::Error) -> Self {
        Self::Checkpoint(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, SlabError>;
