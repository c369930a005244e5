//! Advisory file locks serializing table access across threads and processes.
//!
//! Locks are taken on a sidecar `<table>.lock` file rather than the table
//! itself, because recovery replaces the table file by rename.

use crate::error::StoreError;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::path::Path;

/// Held for the duration of a table operation; released on drop.
pub struct TableLock {
    _guard: Flock<File>,
}

impl TableLock {
    /// Writers: appends, rewrites, creation.
    pub fn exclusive(path: &Path) -> Result<Self, StoreError> {
        acquire(path, FlockArg::LockExclusive)
    }

    /// Readers: snapshots see only fully appended rows.
    pub fn shared(path: &Path) -> Result<Self, StoreError> {
        acquire(path, FlockArg::LockShared)
    }
}

fn acquire(path: &Path, arg: FlockArg) -> Result<TableLock, StoreError> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)?;
    let guard = Flock::lock(file, arg).map_err(|(_, errno)| StoreError::Lock {
        path: path.to_path_buf(),
        source: errno,
    })?;
    Ok(TableLock { _guard: guard })
}
