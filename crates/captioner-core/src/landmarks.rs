//! Landmark extraction capability.
//!
//! Backends (model families) are interchangeable implementers of
//! [`LandmarkExtractor`]. Output must depend on the image bytes alone so that
//! cached results stay valid.

use crate::fingerprint::{Fingerprint, Image};
use crate::types::{ImageBounds, LandmarkRecord, LandmarkSchema, Point};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LandmarkError {
    #[error("no landmarks found in image")]
    NoLandmarksFound,
    #[error("image could not be decoded: {0}")]
    InvalidImage(String),
    #[error("landmark backend failed: {0}")]
    Backend(String),
    #[error("schema {schema} expects {expected} landmarks, got {actual}")]
    Arity {
        schema: String,
        expected: usize,
        actual: usize,
    },
    #[error("landmark {index} has a non-finite coordinate")]
    NonFinite { index: usize },
    #[error("landmark {index} at ({x}, {y}) lies outside the {width}x{height} image")]
    OutOfBounds {
        index: usize,
        x: f32,
        y: f32,
        width: u32,
        height: u32,
    },
}

/// Produces a fixed-schema set of 2D landmarks from an image.
pub trait LandmarkExtractor: Send + Sync {
    /// Layout of every record this extractor returns.
    fn schema(&self) -> LandmarkSchema;

    /// Extract landmarks, or report [`LandmarkError::NoLandmarksFound`] when the
    /// expected structure is absent. Never returns an empty record.
    fn extract_landmarks(&self, image: &Image) -> Result<LandmarkRecord, LandmarkError>;
}

impl LandmarkRecord {
    /// Build a record, checking arity, finiteness and (when known) image bounds.
    pub fn new(
        fingerprint: Fingerprint,
        points: Vec<Point>,
        schema: &LandmarkSchema,
        bounds: Option<ImageBounds>,
    ) -> Result<Self, LandmarkError> {
        let record = Self {
            fingerprint,
            points,
            schema_version: schema.version.clone(),
        };
        record.validate(schema, bounds)?;
        Ok(record)
    }

    pub fn validate(
        &self,
        schema: &LandmarkSchema,
        bounds: Option<ImageBounds>,
    ) -> Result<(), LandmarkError> {
        if self.points.len() != schema.arity {
            return Err(LandmarkError::Arity {
                schema: schema.version.clone(),
                expected: schema.arity,
                actual: self.points.len(),
            });
        }

        for (index, p) in self.points.iter().enumerate() {
            if !p.is_finite() {
                return Err(LandmarkError::NonFinite { index });
            }
            if let Some(b) = bounds {
                if !b.contains(*p) {
                    return Err(LandmarkError::OutOfBounds {
                        index,
                        x: p.x,
                        y: p.y,
                        width: b.width,
                        height: b.height,
                    });
                }
            }
        }
        Ok(())
    }
}
