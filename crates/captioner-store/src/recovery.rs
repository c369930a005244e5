//! Startup recovery: restore the cross-table invariant after a crash.
//!
//! Invariant: every landmark row has a caption row claiming landmarks, and
//! every caption row claiming landmarks has a landmark row. A fingerprint that
//! violates it is half of a torn pair and is purged from the table holding it.
//! The pipeline re-derives purged images on their next submission.

use crate::error::StoreError;
use crate::schema::{CaptionRow, LandmarkRow, Row};
use crate::table::{Scan, Table};
use captioner_core::Fingerprint;
use std::collections::HashSet;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Tables that ended mid-row.
    pub torn_tails: usize,
    pub malformed_rows: usize,
    /// Repeated fingerprints within one table (first row kept).
    pub duplicate_rows: usize,
    pub orphaned_landmarks: Vec<Fingerprint>,
    pub orphaned_captions: Vec<Fingerprint>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }

    /// Rows removed from either table.
    pub fn purged_rows(&self) -> usize {
        self.malformed_rows
            + self.duplicate_rows
            + self.orphaned_landmarks.len()
            + self.orphaned_captions.len()
    }
}

/// Scan both tables under exclusive locks and purge torn pairs.
///
/// Locks are always taken landmarks-first so concurrent recoveries cannot
/// deadlock.
pub fn recover(landmarks: &Table, captions: &Table) -> Result<RecoveryReport, StoreError> {
    let _landmarks_lock = landmarks.lock_exclusive()?;
    let _captions_lock = captions.lock_exclusive()?;

    let lm_scan: Scan<LandmarkRow> = landmarks.scan_locked()?;
    let cap_scan: Scan<CaptionRow> = captions.scan_locked()?;

    let mut report = RecoveryReport {
        torn_tails: usize::from(lm_scan.torn_bytes > 0) + usize::from(cap_scan.torn_bytes > 0),
        malformed_rows: lm_scan.malformed + cap_scan.malformed,
        ..Default::default()
    };

    let (lm_rows, lm_dups) = dedup(lm_scan.rows);
    let (cap_rows, cap_dups) = dedup(cap_scan.rows);
    report.duplicate_rows = lm_dups + cap_dups;

    let claimed: HashSet<Fingerprint> = cap_rows
        .iter()
        .filter(|r| r.has_landmarks)
        .map(|r| r.fingerprint)
        .collect();
    let present: HashSet<Fingerprint> = lm_rows.iter().map(|r| r.fingerprint).collect();

    let (kept_lm, orphan_lm): (Vec<_>, Vec<_>) = lm_rows
        .into_iter()
        .partition(|r| claimed.contains(&r.fingerprint));
    let (kept_cap, orphan_cap): (Vec<_>, Vec<_>) = cap_rows
        .into_iter()
        .partition(|r| !r.has_landmarks || present.contains(&r.fingerprint));

    for row in &orphan_lm {
        tracing::warn!(fingerprint = %row.fingerprint, "purging landmark row without caption (torn write)");
    }
    for row in &orphan_cap {
        tracing::warn!(fingerprint = %row.fingerprint, "purging caption row without landmarks (torn write)");
    }
    report.orphaned_landmarks = orphan_lm.iter().map(|r| r.fingerprint).collect();
    report.orphaned_captions = orphan_cap.iter().map(|r| r.fingerprint).collect();

    if lm_scan.torn_bytes > 0 || lm_scan.malformed > 0 || lm_dups > 0 || !orphan_lm.is_empty() {
        landmarks.rewrite_locked(&kept_lm)?;
    }
    if cap_scan.torn_bytes > 0 || cap_scan.malformed > 0 || cap_dups > 0 || !orphan_cap.is_empty() {
        captions.rewrite_locked(&kept_cap)?;
    }

    if report.is_clean() {
        tracing::debug!(
            landmarks = kept_lm.len(),
            captions = kept_cap.len(),
            "tables consistent"
        );
    } else {
        tracing::warn!(
            torn_tails = report.torn_tails,
            purged = report.purged_rows(),
            "recovered tables after unclean shutdown"
        );
    }

    Ok(report)
}

/// Keep the first row per fingerprint.
fn dedup<R: Row>(rows: Vec<R>) -> (Vec<R>, usize) {
    let mut seen = HashSet::with_capacity(rows.len());
    let total = rows.len();
    let kept: Vec<R> = rows.into_iter().filter(|r| seen.insert(r.fingerprint())).collect();
    let dups = total - kept.len();
    (kept, dups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{TableKind, CAPTIONS_SCHEMA_VERSION, LANDMARKS_SCHEMA_VERSION};
    use chrono::Utc;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::TempDir;

    fn tables(dir: &TempDir) -> (Table, Table) {
        let lm = Table::open(
            dir.path().join("landmarks.csv"),
            TableKind::Landmarks,
            LANDMARKS_SCHEMA_VERSION,
            false,
        )
        .unwrap();
        let cap = Table::open(
            dir.path().join("captions.csv"),
            TableKind::Captions,
            CAPTIONS_SCHEMA_VERSION,
            false,
        )
        .unwrap();
        (lm, cap)
    }

    fn lm_row(tag: &[u8]) -> LandmarkRow {
        LandmarkRow {
            fingerprint: Fingerprint::of(tag),
            schema: "tri/v1".into(),
            points: "[[10.0,10.0],[20.0,10.0],[15.0,20.0]]".into(),
        }
    }

    fn cap_row(tag: &[u8], has_landmarks: bool) -> CaptionRow {
        CaptionRow {
            fingerprint: Fingerprint::of(tag),
            has_landmarks,
            generator: "test/v1".into(),
            completed_at: Utc::now(),
            caption: "a face".into(),
        }
    }

    #[test]
    fn test_clean_tables_untouched() {
        let dir = TempDir::new().unwrap();
        let (lm, cap) = tables(&dir);
        lm.append(&lm_row(b"a")).unwrap();
        cap.append(&cap_row(b"a", true)).unwrap();
        cap.append(&cap_row(b"b", false)).unwrap();

        let report = recover(&lm, &cap).unwrap();
        assert!(report.is_clean(), "{report:?}");
        assert_eq!(cap.scan::<CaptionRow>().unwrap().rows.len(), 2);
    }

    #[test]
    fn test_orphaned_landmark_row_purged() {
        let dir = TempDir::new().unwrap();
        let (lm, cap) = tables(&dir);
        lm.append(&lm_row(b"a")).unwrap();
        cap.append(&cap_row(b"a", true)).unwrap();
        // Crash between the two appends for "b"
        lm.append(&lm_row(b"b")).unwrap();

        let report = recover(&lm, &cap).unwrap();
        assert_eq!(report.orphaned_landmarks, vec![Fingerprint::of(b"b")]);
        assert!(report.orphaned_captions.is_empty());

        let rows = lm.scan::<LandmarkRow>().unwrap().rows;
        assert_eq!(rows, vec![lm_row(b"a")]);
    }

    #[test]
    fn test_landmark_row_for_captions_only_entry_purged() {
        let dir = TempDir::new().unwrap();
        let (lm, cap) = tables(&dir);
        lm.append(&lm_row(b"a")).unwrap();
        cap.append(&cap_row(b"a", false)).unwrap();

        let report = recover(&lm, &cap).unwrap();
        assert_eq!(report.orphaned_landmarks, vec![Fingerprint::of(b"a")]);
        assert!(lm.scan::<LandmarkRow>().unwrap().rows.is_empty());
        assert_eq!(cap.scan::<CaptionRow>().unwrap().rows.len(), 1);
    }

    #[test]
    fn test_caption_claiming_missing_landmarks_purged() {
        let dir = TempDir::new().unwrap();
        let (lm, cap) = tables(&dir);
        cap.append(&cap_row(b"a", true)).unwrap();
        cap.append(&cap_row(b"b", false)).unwrap();

        let report = recover(&lm, &cap).unwrap();
        assert_eq!(report.orphaned_captions, vec![Fingerprint::of(b"a")]);
        let rows = cap.scan::<CaptionRow>().unwrap().rows;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fingerprint, Fingerprint::of(b"b"));
    }

    #[test]
    fn test_torn_tail_and_duplicates() {
        let dir = TempDir::new().unwrap();
        let (lm, cap) = tables(&dir);
        lm.append(&lm_row(b"a")).unwrap();
        lm.append(&lm_row(b"a")).unwrap();
        cap.append(&cap_row(b"a", true)).unwrap();
        let mut file = OpenOptions::new().append(true).open(cap.path()).unwrap();
        file.write_all(b"0123abcd,tru").unwrap();

        let report = recover(&lm, &cap).unwrap();
        assert_eq!(report.torn_tails, 1);
        assert_eq!(report.duplicate_rows, 1);
        assert!(report.orphaned_landmarks.is_empty());

        let cap_scan = cap.scan::<CaptionRow>().unwrap();
        assert_eq!(cap_scan.torn_bytes, 0);
        assert_eq!(cap_scan.rows.len(), 1);
        assert_eq!(lm.scan::<LandmarkRow>().unwrap().rows.len(), 1);

        // A second pass finds nothing left to repair
        assert!(recover(&lm, &cap).unwrap().is_clean());
    }

    #[test]
    fn test_subset_invariant_after_recovery() {
        let dir = TempDir::new().unwrap();
        let (lm, cap) = tables(&dir);
        for (tag, with) in [(&b"a"[..], true), (b"b", false), (b"c", true)] {
            if with {
                lm.append(&lm_row(tag)).unwrap();
            }
            cap.append(&cap_row(tag, with)).unwrap();
        }
        lm.append(&lm_row(b"d")).unwrap();

        recover(&lm, &cap).unwrap();

        let lm_fps: HashSet<_> = lm.scan::<LandmarkRow>().unwrap().rows.iter().map(|r| r.fingerprint).collect();
        let cap_fps: HashSet<_> = cap.scan::<CaptionRow>().unwrap().rows.iter().map(|r| r.fingerprint).collect();
        assert!(lm_fps.is_subset(&cap_fps));
        assert_eq!(lm_fps.len(), 2);
        assert_eq!(cap_fps.len(), 3);
    }
}
