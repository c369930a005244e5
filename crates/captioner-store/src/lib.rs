//! captioner-store — Append-safe landmark and caption tables.
//!
//! Two line-oriented CSV tables keyed by image fingerprint, appended under
//! advisory locks and repaired on startup so that they never disagree about
//! which images have been processed.

pub mod error;
pub mod lock;
pub mod recovery;
pub mod schema;
pub mod store;
pub mod table;

pub use error::StoreError;
pub use recovery::{recover, RecoveryReport};
pub use schema::{
    CaptionRow, LandmarkRow, Row, TableKind, CAPTIONS_SCHEMA_VERSION, LANDMARKS_SCHEMA_VERSION,
};
pub use store::{StoreConfig, StoreStats, TableStore};
pub use table::{Scan, Table};
