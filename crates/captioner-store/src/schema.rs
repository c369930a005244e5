//! Table layouts and the row projections of pipeline records.

use crate::error::StoreError;
use captioner_core::{CacheEntry, CaptionRecord, Fingerprint, LandmarkRecord, Point};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Default landmarks table schema.
pub const LANDMARKS_SCHEMA_VERSION: &str = "landmarks/v1";
/// Default captions table schema. Caption rows may exist without a landmark
/// row; the `has_landmarks` column says which.
pub const CAPTIONS_SCHEMA_VERSION: &str = "captions/v1+optional-landmarks";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    Landmarks,
    Captions,
}

impl TableKind {
    pub fn name(&self) -> &'static str {
        match self {
            TableKind::Landmarks => "landmarks",
            TableKind::Captions => "captions",
        }
    }

    /// CSV header columns, in row field order.
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            TableKind::Landmarks => &["fingerprint", "schema", "points"],
            TableKind::Captions => &[
                "fingerprint",
                "has_landmarks",
                "generator",
                "completed_at",
                "caption",
            ],
        }
    }
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A persisted row keyed by fingerprint.
pub trait Row: Serialize + DeserializeOwned {
    const KIND: TableKind;

    fn fingerprint(&self) -> Fingerprint;
}

/// Landmarks table row. `points` is a JSON array of `[x, y]` pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LandmarkRow {
    pub fingerprint: Fingerprint,
    pub schema: String,
    pub points: String,
}

impl Row for LandmarkRow {
    const KIND: TableKind = TableKind::Landmarks;

    fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }
}

impl LandmarkRow {
    pub fn from_record(record: &LandmarkRecord) -> Result<Self, StoreError> {
        let pairs: Vec<(f32, f32)> = record.points.iter().map(|p| (p.x, p.y)).collect();
        Ok(Self {
            fingerprint: record.fingerprint,
            schema: record.schema_version.clone(),
            points: serde_json::to_string(&pairs)?,
        })
    }

    pub fn to_record(&self) -> Result<LandmarkRecord, StoreError> {
        let pairs: Vec<(f32, f32)> = serde_json::from_str(&self.points)?;
        Ok(LandmarkRecord {
            fingerprint: self.fingerprint,
            points: pairs.into_iter().map(Point::from).collect(),
            schema_version: self.schema.clone(),
        })
    }
}

/// Captions table row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptionRow {
    pub fingerprint: Fingerprint,
    pub has_landmarks: bool,
    pub generator: String,
    pub completed_at: DateTime<Utc>,
    pub caption: String,
}

impl Row for CaptionRow {
    const KIND: TableKind = TableKind::Captions;

    fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }
}

impl CaptionRow {
    pub fn from_entry(entry: &CacheEntry) -> Self {
        Self {
            fingerprint: entry.fingerprint,
            has_landmarks: entry.has_landmarks(),
            generator: entry.caption.generator_version.clone(),
            completed_at: entry.completed_at,
            caption: entry.caption.text.clone(),
        }
    }

    pub fn to_record(&self) -> CaptionRecord {
        CaptionRecord {
            fingerprint: self.fingerprint,
            text: self.caption.clone(),
            generator_version: self.generator.clone(),
        }
    }
}

/// Reassemble cache entries from recovered rows.
///
/// Caption rows drive the join. A caption row that claims landmarks but has
/// no decodable landmark row is skipped, so a partial entry is never produced.
pub fn join_rows(landmarks: Vec<LandmarkRow>, captions: Vec<CaptionRow>) -> Vec<CacheEntry> {
    let mut by_fp: HashMap<Fingerprint, LandmarkRow> = HashMap::with_capacity(landmarks.len());
    for row in landmarks {
        by_fp.entry(row.fingerprint).or_insert(row);
    }

    let mut entries = Vec::with_capacity(captions.len());
    for row in captions {
        let landmarks = if row.has_landmarks {
            let decoded = by_fp.get(&row.fingerprint).map(LandmarkRow::to_record);
            match decoded {
                Some(Ok(record)) => Some(record),
                Some(Err(e)) => {
                    tracing::warn!(fingerprint = %row.fingerprint, error = %e, "undecodable landmark row; entry skipped");
                    continue;
                }
                None => {
                    tracing::warn!(fingerprint = %row.fingerprint, "caption row without landmark row; entry skipped");
                    continue;
                }
            }
        } else {
            None
        };
        entries.push(CacheEntry::new(row.to_record(), landmarks, row.completed_at));
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn landmark_record(fp: Fingerprint) -> LandmarkRecord {
        LandmarkRecord {
            fingerprint: fp,
            points: vec![Point::new(10.0, 10.0), Point::new(20.0, 10.0), Point::new(15.5, 20.25)],
            schema_version: "tri/v1".into(),
        }
    }

    fn caption_row(fp: Fingerprint, has_landmarks: bool) -> CaptionRow {
        CaptionRow {
            fingerprint: fp,
            has_landmarks,
            generator: "test/v1".into(),
            completed_at: Utc::now(),
            caption: "a face".into(),
        }
    }

    #[test]
    fn test_landmark_row_points_encoding() {
        let fp = Fingerprint::of(b"FACE123");
        let row = LandmarkRow::from_record(&landmark_record(fp)).unwrap();
        assert_eq!(row.points, "[[10.0,10.0],[20.0,10.0],[15.5,20.25]]");
        assert_eq!(row.to_record().unwrap(), landmark_record(fp));
    }

    #[test]
    fn test_columns_match_row_fields() {
        assert_eq!(TableKind::Landmarks.columns().len(), 3);
        assert_eq!(TableKind::Captions.columns().len(), 5);
        assert_eq!(TableKind::Captions.to_string(), "captions");
    }

    #[test]
    fn test_join_rows() {
        let with = Fingerprint::of(b"FACE123");
        let without = Fingerprint::of(b"NOFACE");
        let missing = Fingerprint::of(b"TORN");

        let landmarks = vec![LandmarkRow::from_record(&landmark_record(with)).unwrap()];
        let captions = vec![
            caption_row(with, true),
            caption_row(without, false),
            caption_row(missing, true),
        ];

        let entries = join_rows(landmarks, captions);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].fingerprint, with);
        assert_eq!(entries[0].landmarks.as_ref().unwrap().points.len(), 3);
        assert_eq!(entries[1].fingerprint, without);
        assert!(entries[1].landmarks.is_none());
    }
}
