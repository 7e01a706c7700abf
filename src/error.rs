use thiserror::Error;

#[derive(Debug, Error)]
pub enum MorphError {
    #[error("failed to load model '{model_id}': {reason}")]
    ModelLoad { model_id: String, reason: String },

    #[error("unknown model '{0}'")]
    UnknownModel(String),

    #[error("latent dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("cannot aggregate an empty set of projections")]
    EmptyAggregation,

    #[error("no projection has completed yet")]
    NotReady,

    #[error("degenerate spectrum sample (std = {std})")]
    DegenerateSample { std: f32 },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl MorphError {
    /// Errors after which the live stream keeps running with its last good state.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::DegenerateSample { .. } | Self::NotReady | Self::EmptyAggregation
        )
    }
}

pub type Result<T> = std::result::Result<T, MorphError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degenerate_sample_is_recoverable() {
        assert!(MorphError::DegenerateSample { std: 0.0 }.is_recoverable());
        assert!(MorphError::NotReady.is_recoverable());
        assert!(!MorphError::DimensionMismatch {
            expected: 128,
            actual: 64
        }
        .is_recoverable());
    }

    #[test]
    fn test_display_mentions_model() {
        let err = MorphError::ModelLoad {
            model_id: "dcgan64".to_string(),
            reason: "missing file".to_string(),
        };
        assert!(err.to_string().contains("dcgan64"));
    }
}
