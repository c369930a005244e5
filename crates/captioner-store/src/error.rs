use captioner_core::Fingerprint;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("landmark points encoding: {0}")]
    Points(#[from] serde_json::Error),
    #[error("{}: table declares schema {found:?}, expected {expected:?}", path.display())]
    SchemaMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },
    #[error("{}: missing `#schema:` preamble", path.display())]
    MissingPreamble { path: PathBuf },
    #[error("lock {}: {source}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: nix::errno::Errno,
    },
    #[error("row for {0} does not encode to a single line")]
    MultilineRow(Fingerprint),
    #[error("entry for {0} has mismatched sub-record fingerprints")]
    IncoherentEntry(Fingerprint),
}
