//! Append-safe CSV tables.
//!
//! File layout:
//! ```text
//! #schema:<version>
//! <csv header>
//! <row>\n
//! <row>\n
//! ```
//! Every row is exactly one line. An append writes the whole line with a
//! single `O_APPEND` write under an exclusive lock, so readers (holding a
//! shared lock) always see a prefix of complete rows. A trailing segment
//! without a newline is a torn write from a crash: readers ignore it and the
//! next append or recovery cuts it off.

use crate::error::StoreError;
use crate::lock::TableLock;
use crate::schema::{Row, TableKind};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const PREAMBLE_PREFIX: &str = "#schema:";
const TAIL_SCAN_CHUNK: u64 = 4096;

/// Rows read from a table snapshot.
#[derive(Debug)]
pub struct Scan<R> {
    pub rows: Vec<R>,
    /// Complete lines that failed to parse.
    pub malformed: usize,
    /// Bytes after the last newline.
    pub torn_bytes: usize,
}

/// One append-only table file.
#[derive(Debug)]
pub struct Table {
    path: PathBuf,
    lock_path: PathBuf,
    kind: TableKind,
    version: String,
    durable: bool,
}

impl Table {
    /// Open a table, creating it (preamble + header) when missing or empty.
    ///
    /// Fails with [`StoreError::SchemaMismatch`] when an existing file declares
    /// a different schema version.
    pub fn open(
        path: impl Into<PathBuf>,
        kind: TableKind,
        version: &str,
        durable: bool,
    ) -> Result<Self, StoreError> {
        let path = path.into();
        let table = Self {
            lock_path: sidecar(&path, "lock"),
            path,
            kind,
            version: version.to_string(),
            durable,
        };

        let _lock = table.lock_exclusive()?;
        match fs::metadata(&table.path) {
            Ok(meta) if meta.len() > 0 => {
                let found = read_preamble(&table.path)?;
                if found != table.version {
                    return Err(StoreError::SchemaMismatch {
                        path: table.path.clone(),
                        expected: table.version.clone(),
                        found,
                    });
                }
            }
            Ok(_) => table.write_atomic(&table.header())?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => table.write_atomic(&table.header())?,
            Err(e) => return Err(e.into()),
        }

        tracing::debug!(table = %kind, path = %table.path.display(), version, "table opened");
        Ok(table)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn lock_exclusive(&self) -> Result<TableLock, StoreError> {
        TableLock::exclusive(&self.lock_path)
    }

    /// Durably append one row.
    pub fn append<R: Row>(&self, row: &R) -> Result<(), StoreError> {
        let _lock = self.lock_exclusive()?;
        self.append_locked(row).map(|_| ())
    }

    /// Append without taking the lock; the caller must hold it exclusively.
    ///
    /// Returns the file length the row was written at, for
    /// [`truncate_locked`](Self::truncate_locked).
    pub(crate) fn append_locked<R: Row>(&self, row: &R) -> Result<u64, StoreError> {
        debug_assert_eq!(R::KIND, self.kind);
        let line = encode_row(row)?;
        if line.iter().filter(|&&b| b == b'\n').count() != 1 || line.last() != Some(&b'\n') {
            return Err(StoreError::MultilineRow(row.fingerprint()));
        }

        let mut file = OpenOptions::new().read(true).append(true).open(&self.path)?;

        let mut len = file.metadata()?.len();
        let torn = torn_tail_len(&mut file)?;
        if torn > 0 {
            tracing::warn!(table = %self.kind, bytes = torn, "cutting torn tail before append");
            len -= torn;
            file.set_len(len)?;
        }

        file.write_all(&line)?;
        if self.durable {
            file.sync_data()?;
        }
        Ok(len)
    }

    /// Cut the file back to `len` bytes. The caller must hold the exclusive lock.
    pub(crate) fn truncate_locked(&self, len: u64) -> Result<(), StoreError> {
        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(len)?;
        if self.durable {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Snapshot all complete rows.
    pub fn scan<R: Row>(&self) -> Result<Scan<R>, StoreError> {
        let _lock = TableLock::shared(&self.lock_path)?;
        self.scan_locked()
    }

    /// Snapshot without taking the lock; the caller must hold it.
    pub(crate) fn scan_locked<R: Row>(&self) -> Result<Scan<R>, StoreError> {
        let bytes = fs::read(&self.path)?;
        self.parse(&bytes)
    }

    /// Replace the table contents with `rows`. The caller must hold the
    /// exclusive lock.
    pub(crate) fn rewrite_locked<R: Row>(&self, rows: &[R]) -> Result<(), StoreError> {
        let mut buf = self.header();
        for row in rows {
            buf.extend_from_slice(&encode_row(row)?);
        }
        self.write_atomic(&buf)
    }

    /// Flush table data to stable storage.
    pub fn sync(&self) -> Result<(), StoreError> {
        File::open(&self.path)?.sync_all()?;
        Ok(())
    }

    fn header(&self) -> Vec<u8> {
        format!(
            "{PREAMBLE_PREFIX}{}\n{}\n",
            self.version,
            self.kind.columns().join(",")
        )
        .into_bytes()
    }

    fn parse<R: Row>(&self, bytes: &[u8]) -> Result<Scan<R>, StoreError> {
        let complete = bytes.iter().rposition(|&b| b == b'\n').map_or(0, |i| i + 1);
        let body = &bytes[..complete];

        let preamble_end = body
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| StoreError::MissingPreamble {
                path: self.path.clone(),
            })?;
        let found = parse_preamble(&body[..preamble_end]).ok_or_else(|| StoreError::MissingPreamble {
            path: self.path.clone(),
        })?;
        if found != self.version {
            return Err(StoreError::SchemaMismatch {
                path: self.path.clone(),
                expected: self.version.clone(),
                found,
            });
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(&body[preamble_end + 1..]);

        let mut rows = Vec::new();
        let mut malformed = 0;
        for result in reader.deserialize::<R>() {
            match result {
                Ok(row) => rows.push(row),
                Err(e) => {
                    malformed += 1;
                    tracing::warn!(table = %self.kind, error = %e, "skipping malformed row");
                }
            }
        }

        Ok(Scan {
            rows,
            malformed,
            torn_bytes: bytes.len() - complete,
        })
    }

    /// Write the whole file through a temp file and rename.
    fn write_atomic(&self, bytes: &[u8]) -> Result<(), StoreError> {
        let tmp = sidecar(&self.path, "tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(bytes)?;
            if self.durable {
                file.sync_all()?;
            }
        }
        fs::rename(&tmp, &self.path)?;

        if self.durable {
            let dir = match self.path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p,
                _ => Path::new("."),
            };
            File::open(dir)?.sync_all()?;
        }
        Ok(())
    }
}

/// `landmarks.csv` → `landmarks.csv.<suffix>`
fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

fn parse_preamble(line: &[u8]) -> Option<String> {
    let line = std::str::from_utf8(line).ok()?;
    line.trim_end_matches('\r')
        .strip_prefix(PREAMBLE_PREFIX)
        .map(|v| v.trim().to_string())
}

fn read_preamble(path: &Path) -> Result<String, StoreError> {
    let mut line = String::new();
    BufReader::new(File::open(path)?).read_line(&mut line)?;
    parse_preamble(line.trim_end_matches('\n').as_bytes()).ok_or_else(|| StoreError::MissingPreamble {
        path: path.to_path_buf(),
    })
}

fn encode_row<R: Row>(row: &R) -> Result<Vec<u8>, StoreError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer.serialize(row)?;
    writer.into_inner().map_err(|e| StoreError::Io(e.into_error()))
}

/// Number of bytes after the last newline of the file.
fn torn_tail_len(file: &mut File) -> io::Result<u64> {
    let len = file.metadata()?.len();
    let mut end = len;
    let mut buf = vec![0u8; TAIL_SCAN_CHUNK as usize];

    while end > 0 {
        let start = end.saturating_sub(TAIL_SCAN_CHUNK);
        let chunk = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(chunk)?;
        if let Some(i) = chunk.iter().rposition(|&b| b == b'\n') {
            return Ok(len - (start + i as u64 + 1));
        }
        end = start;
    }
    Ok(len)
}
