//! Both output tables behind one handle.

use crate::error::StoreError;
use crate::recovery::{self, RecoveryReport};
use crate::schema::{
    join_rows, CaptionRow, LandmarkRow, TableKind, CAPTIONS_SCHEMA_VERSION,
    LANDMARKS_SCHEMA_VERSION,
};
use crate::table::Table;
use captioner_core::CacheEntry;
use std::path::PathBuf;

/// Where the tables live and which schema versions they must declare.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub dir: PathBuf,
    pub landmarks_file: String,
    pub captions_file: String,
    pub landmarks_version: String,
    pub captions_version: String,
    /// `fsync` every append.
    pub durable: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            landmarks_file: "landmarks.csv".into(),
            captions_file: "captions.csv".into(),
            landmarks_version: LANDMARKS_SCHEMA_VERSION.into(),
            captions_version: CAPTIONS_SCHEMA_VERSION.into(),
            durable: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub landmark_rows: usize,
    pub caption_rows: usize,
    pub captions_only: usize,
}

/// The landmarks and captions tables.
#[derive(Debug)]
pub struct TableStore {
    landmarks: Table,
    captions: Table,
}

impl TableStore {
    /// Open (or create) both tables and run crash recovery.
    pub fn open(config: &StoreConfig) -> Result<(Self, RecoveryReport), StoreError> {
        let store = Self::open_tables(config)?;
        let report = recovery::recover(&store.landmarks, &store.captions)?;
        tracing::info!(
            dir = %config.dir.display(),
            clean = report.is_clean(),
            "table store opened"
        );
        Ok((store, report))
    }

    /// Open both tables for reading without repairing them.
    ///
    /// Safe to run next to a live writer: no row is ever rewritten.
    pub fn inspect(config: &StoreConfig) -> Result<Self, StoreError> {
        Self::open_tables(config)
    }

    fn open_tables(config: &StoreConfig) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&config.dir)?;

        let landmarks = Table::open(
            config.dir.join(&config.landmarks_file),
            TableKind::Landmarks,
            &config.landmarks_version,
            config.durable,
        )?;
        let captions = Table::open(
            config.dir.join(&config.captions_file),
            TableKind::Captions,
            &config.captions_version,
            config.durable,
        )?;
        Ok(Self { landmarks, captions })
    }

    pub fn landmarks(&self) -> &Table {
        &self.landmarks
    }

    pub fn captions(&self) -> &Table {
        &self.captions
    }

    /// Every complete entry currently persisted.
    pub fn load(&self) -> Result<Vec<CacheEntry>, StoreError> {
        let landmarks = self.landmarks.scan::<LandmarkRow>()?;
        let captions = self.captions.scan::<CaptionRow>()?;
        Ok(join_rows(landmarks.rows, captions.rows))
    }

    /// Persist an entry: landmark row first (when present), then caption row.
    ///
    /// Both tables stay locked for the whole pair, landmarks first like
    /// recovery. If the caption append fails the landmark row is cut off
    /// again, so an error leaves neither row behind. A crash between the two
    /// leaves an orphaned landmark row, which recovery purges on the next start.
    pub fn append_entry(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        if !entry.is_coherent() {
            return Err(StoreError::IncoherentEntry(entry.fingerprint));
        }
        let landmark_row = entry
            .landmarks
            .as_ref()
            .map(LandmarkRow::from_record)
            .transpose()?;
        let caption_row = CaptionRow::from_entry(entry);

        let _landmarks_lock = self.landmarks.lock_exclusive()?;
        let _captions_lock = self.captions.lock_exclusive()?;

        let rollback = match &landmark_row {
            Some(row) => Some(self.landmarks.append_locked(row)?),
            None => None,
        };
        if let Err(e) = self.captions.append_locked(&caption_row) {
            if let Some(len) = rollback {
                if let Err(undo) = self.landmarks.truncate_locked(len) {
                    tracing::error!(
                        fingerprint = %entry.fingerprint,
                        error = %undo,
                        "failed to roll back landmark row; recovery will purge it"
                    );
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Flush both tables to stable storage.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.landmarks.sync()?;
        self.captions.sync()
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let landmarks = self.landmarks.scan::<LandmarkRow>()?;
        let captions = self.captions.scan::<CaptionRow>()?;
        Ok(StoreStats {
            landmark_rows: landmarks.rows.len(),
            caption_rows: captions.rows.len(),
            captions_only: captions.rows.iter().filter(|r| !r.has_landmarks).count(),
        })
    }
}
