use std::time::Duration;

use thiserror::Error;

/// Instantiation of one heavy sub-stage failed during `load()`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to load {sub_stage}: {message}")]
pub struct LoadError {
    pub sub_stage: String,
    pub message: String,
}

impl LoadError {
    pub fn new(sub_stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            sub_stage: sub_stage.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("failed to evict output folder {path}: {message}")]
    EvictionIo { path: String, message: String },
    #[error("failed to create output folder {path}: {message}")]
    Create { path: String, message: String },
}

/// Everything a pipeline run or export can fail with.
///
/// The `Display` text is what reaches HTTP callers, so variants carry a
/// stage name and a one-line cause and nothing else.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    LoadFailed(#[from] LoadError),
    #[error("{stage}: {message}")]
    StageFailed { stage: String, message: String },
    #[error("{stage}: timed out after {:.1}s", timeout.as_secs_f32())]
    StageTimeout { stage: String, timeout: Duration },
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl PipelineError {
    pub fn stage_failed(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StageFailed {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Stage the error is attributed to, if any.
    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::StageFailed { stage, .. } | Self::StageTimeout { stage, .. } => Some(stage),
            Self::LoadFailed(err) => Some(&err.sub_stage),
            Self::InvalidRequest(_) | Self::Cache(_) => None,
        }
    }

    /// Short machine-readable discriminator used in JSON error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::LoadFailed(_) => "load_failed",
            Self::StageFailed { .. } => "stage_failed",
            Self::StageTimeout { .. } => "stage_timeout",
            Self::Cache(_) => "cache",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_failed_display_names_stage() {
        let err = PipelineError::stage_failed("shape generation", "no foreground");
        assert_eq!(err.to_string(), "shape generation: no foreground");
        assert_eq!(err.stage(), Some("shape generation"));
        assert_eq!(err.kind(), "stage_failed");
    }

    #[test]
    fn test_load_error_converts_into_load_failed() {
        let err: PipelineError = LoadError::new("image-to-3D", "weights missing").into();
        assert!(matches!(err, PipelineError::LoadFailed(_)));
        assert_eq!(err.to_string(), "failed to load image-to-3D: weights missing");
        assert_eq!(err.stage(), Some("image-to-3D"));
    }

    #[test]
    fn test_timeout_display() {
        let err = PipelineError::StageTimeout {
            stage: "texture generation".into(),
            timeout: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "texture generation: timed out after 1.5s");
    }
}
