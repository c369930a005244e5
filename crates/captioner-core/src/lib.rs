//! captioner-core — Image fingerprinting, landmark extraction and captioning.
//!
//! Landmark extraction and caption generation are pluggable capabilities
//! ([`LandmarkExtractor`], [`CaptionGenerator`]). The bundled backends are an
//! SCRFD face landmark model running on ONNX Runtime and a geometry captioner.

pub mod caption;
pub mod describer;
pub mod detector;
pub mod fingerprint;
pub mod frame;
pub mod landmarks;
pub mod types;

use std::path::PathBuf;

pub use caption::{CaptionError, CaptionGenerator, CaptionPolicy};
pub use describer::GeometryCaptioner;
pub use detector::ScrfdExtractor;
pub use fingerprint::{fingerprint, Fingerprint, Image, InvalidImageError};
pub use frame::probe_bounds;
pub use landmarks::{LandmarkError, LandmarkExtractor};
pub use types::{CacheEntry, CaptionRecord, ImageBounds, LandmarkRecord, LandmarkSchema, Point};

/// Directory searched for ONNX model files when none is configured.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("/usr/share/captioner/models")
}
