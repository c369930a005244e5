use crate::cache::CacheConsistencyError;
use crate::config::ConfigError;
use captioner_core::{CaptionError, LandmarkError};
use captioner_store::StoreError;
use thiserror::Error;

/// Failure of one pipeline run, delivered to the requester and to every
/// waiter on the same fingerprint.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("landmark extraction exceeded {timeout_ms} ms")]
    ExtractionTimeout { timeout_ms: u64 },
    #[error("caption generation exceeded {timeout_ms} ms")]
    GenerationTimeout { timeout_ms: u64 },
    #[error("landmark extraction failed: {0}")]
    Extraction(LandmarkError),
    #[error("caption generation failed: {0}")]
    Generation(CaptionError),
    #[error(transparent)]
    CacheConsistency(#[from] CacheConsistencyError),
    #[error("failed to persist result: {0}")]
    Persist(String),
    #[error("computation aborted before producing a result")]
    Aborted,
}

impl PipelineError {
    /// Whether resubmitting the same image may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            PipelineError::InvalidImage(_) | PipelineError::CacheConsistency(_)
        )
    }
}

/// Failure to bring an orchestrator up.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
