use crate::fingerprint::Fingerprint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A 2D landmark coordinate in source image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl From<(f32, f32)> for Point {
    fn from((x, y): (f32, f32)) -> Self {
        Self { x, y }
    }
}

/// Pixel dimensions of a decoded source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBounds {
    pub width: u32,
    pub height: u32,
}

impl ImageBounds {
    /// Inclusive on both edges: a landmark on the last pixel boundary is valid.
    pub fn contains(&self, p: Point) -> bool {
        p.x >= 0.0 && p.y >= 0.0 && p.x <= self.width as f32 && p.y <= self.height as f32
    }

    /// Clamp a point into the image. Non-finite coordinates are left untouched
    /// so that validation still rejects them.
    pub fn clamp(&self, p: Point) -> Point {
        Point {
            x: p.x.clamp(0.0, self.width as f32),
            y: p.y.clamp(0.0, self.height as f32),
        }
    }
}

/// The fixed layout a landmark extractor produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LandmarkSchema {
    /// Version tag stored with every record (e.g., "face5/v1").
    pub version: String,
    /// Number of points every record of this schema carries.
    pub arity: usize,
}

impl LandmarkSchema {
    pub fn new(version: impl Into<String>, arity: usize) -> Self {
        Self {
            version: version.into(),
            arity,
        }
    }
}

/// Landmarks extracted from one image.
///
/// Construct through [`LandmarkRecord::new`], which enforces the schema arity
/// and coordinate bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LandmarkRecord {
    pub fingerprint: Fingerprint,
    pub points: Vec<Point>,
    pub schema_version: String,
}

/// Caption generated for one image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptionRecord {
    pub fingerprint: Fingerprint,
    pub text: String,
    /// Backend version that produced the text (e.g., "geometry/v1").
    pub generator_version: String,
}

/// A completed pipeline result.
///
/// `landmarks` is `None` only for the captions-only outcome, where extraction
/// found nothing to report. An entry is never half-populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub landmarks: Option<LandmarkRecord>,
    pub caption: CaptionRecord,
    pub completed_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(
        caption: CaptionRecord,
        landmarks: Option<LandmarkRecord>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            fingerprint: caption.fingerprint,
            landmarks,
            caption,
            completed_at,
        }
    }

    pub fn has_landmarks(&self) -> bool {
        self.landmarks.is_some()
    }

    /// Content equality, ignoring when the entry was completed.
    pub fn same_content(&self, other: &CacheEntry) -> bool {
        self.fingerprint == other.fingerprint
            && self.landmarks == other.landmarks
            && self.caption == other.caption
    }

    /// Every sub-record carries the entry's own fingerprint.
    pub fn is_coherent(&self) -> bool {
        self.caption.fingerprint == self.fingerprint
            && self
                .landmarks
                .as_ref()
                .map_or(true, |l| l.fingerprint == self.fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caption(fp: Fingerprint, text: &str) -> CaptionRecord {
        CaptionRecord {
            fingerprint: fp,
            text: text.into(),
            generator_version: "test/v1".into(),
        }
    }

    #[test]
    fn test_bounds_contains_edges() {
        let b = ImageBounds { width: 10, height: 5 };
        assert!(b.contains(Point::new(0.0, 0.0)));
        assert!(b.contains(Point::new(10.0, 5.0)));
        assert!(!b.contains(Point::new(10.5, 1.0)));
        assert!(!b.contains(Point::new(-0.1, 1.0)));
    }

    #[test]
    fn test_bounds_clamp() {
        let b = ImageBounds { width: 10, height: 5 };
        assert_eq!(b.clamp(Point::new(-3.0, 7.0)), Point::new(0.0, 5.0));
        assert!(!b.clamp(Point::new(f32::NAN, 1.0)).is_finite());
    }

    #[test]
    fn test_same_content_ignores_timestamp() {
        let fp = Fingerprint::of(b"FACE123");
        let a = CacheEntry::new(caption(fp, "a face"), None, Utc::now());
        let mut b = a.clone();
        b.completed_at = a.completed_at + chrono::Duration::seconds(30);
        assert!(a.same_content(&b));

        b.caption.text = "another face".into();
        assert!(!a.same_content(&b));
    }

    #[test]
    fn test_entry_coherence() {
        let fp = Fingerprint::of(b"FACE123");
        let other = Fingerprint::of(b"NOFACE");
        let mut entry = CacheEntry::new(caption(fp, "a face"), None, Utc::now());
        assert!(entry.is_coherent());

        entry.landmarks = Some(LandmarkRecord {
            fingerprint: other,
            points: vec![],
            schema_version: "x".into(),
        });
        assert!(!entry.is_coherent());
    }
}
