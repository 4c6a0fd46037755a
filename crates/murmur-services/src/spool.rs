//! Durable spool: an ordered, disk-backed queue of encoded packets.
//!
//! Records are stored one file per packet, named by sequence id:
//!   {spool_dir}/0000000042.bin
//!
//! The id is zero-padded to 10 digits so lexicographic order equals numeric
//! order, but listing always sorts by the parsed number. Writes are atomic:
//! write to `<name>.tmp`, fsync, rename, fsync the directory. A `.tmp` file
//! is never listed and is swept on open.
//!
//! Sequence ids restart at 1 with every process, so records left behind by a
//! previous run are moved into a `carryover-<millis>` subdirectory on startup
//! and drained before the current session's records.

use std::ffi::OsStr;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;

use murmur_core::SequenceId;

pub const RECORD_EXTENSION: &str = "bin";
const TMP_EXTENSION: &str = "tmp";
const ID_WIDTH: usize = 10;
const CARRYOVER_PREFIX: &str = "carryover-";

#[derive(Debug, thiserror::Error)]
pub enum SpoolError {
    #[error("spool I/O on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("spool task failed: {0}")]
    Task(String),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> SpoolError + '_ {
    move |source| SpoolError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// A spooled record, as returned by [`Spool::list_ordered`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHandle {
    pub sequence_id: SequenceId,
    path: PathBuf,
}

impl RecordHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Record file name for a sequence id, e.g. `0000000042.bin`.
pub fn record_file_name(sequence_id: SequenceId) -> String {
    format!("{sequence_id:0width$}.{RECORD_EXTENSION}", width = ID_WIDTH)
}

fn parse_record_name(name: &OsStr) -> Option<SequenceId> {
    let name = name.to_str()?;
    let stem = name.strip_suffix(RECORD_EXTENSION)?.strip_suffix('.')?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// One ordered queue of records in a single directory.
#[derive(Debug, Clone)]
pub struct Spool {
    dir: PathBuf,
    fsync: bool,
}

impl Spool {
    /// Open (creating if absent) a spool directory and sweep interrupted writes.
    pub fn open(dir: impl Into<PathBuf>, fsync: bool) -> Result<Self, SpoolError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        let spool = Self { dir, fsync };
        spool.sweep_partial()?;
        Ok(spool)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Durably store a record. It is visible to `list_ordered` only once complete.
    ///
    /// `Err` means the record is not listed. Once the rename has happened the
    /// append succeeds; a failed directory fsync after it is only logged.
    pub fn append(&self, record: &[u8], sequence_id: SequenceId) -> Result<(), SpoolError> {
        let path = self.dir.join(record_file_name(sequence_id));
        let tmp_path = path.with_extension(TMP_EXTENSION);
        let written = self
            .write_tmp(&tmp_path, record)
            .and_then(|()| fs::rename(&tmp_path, &path).map_err(io_err(&path)));
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }
        if self.fsync {
            if let Err(e) = self.sync_dir() {
                tracing::warn!(seq = sequence_id, error = %e, "directory fsync failed, record kept");
            }
        }
        tracing::trace!(seq = sequence_id, path = %path.display(), "record spooled");
        Ok(())
    }

    fn write_tmp(&self, tmp_path: &Path, record: &[u8]) -> Result<(), SpoolError> {
        let mut file = fs::File::create(tmp_path).map_err(io_err(tmp_path))?;
        file.write_all(record).map_err(io_err(tmp_path))?;
        if self.fsync {
            file.sync_all().map_err(io_err(tmp_path))?;
        }
        Ok(())
    }

    /// All complete records, ascending by sequence id.
    pub fn list_ordered(&self) -> Result<Vec<RecordHandle>, SpoolError> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(io_err(&self.dir))? {
            let entry = entry.map_err(io_err(&self.dir))?;
            let Some(sequence_id) = parse_record_name(&entry.file_name()) else {
                continue;
            };
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            records.push(RecordHandle {
                sequence_id,
                path: entry.path(),
            });
        }
        records.sort_by_key(|r| r.sequence_id);
        Ok(records)
    }

    pub fn read(&self, handle: &RecordHandle) -> Result<Bytes, SpoolError> {
        fs::read(&handle.path)
            .map(Bytes::from)
            .map_err(io_err(&handle.path))
    }

    /// Delete a record. Removing an already-removed record is not an error.
    pub fn remove(&self, handle: &RecordHandle) -> Result<(), SpoolError> {
        match fs::remove_file(&handle.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&handle.path)(e)),
        }
    }

    /// Number of complete records.
    pub fn count(&self) -> usize {
        self.list_ordered().map(|r| r.len()).unwrap_or(0)
    }

    /// Total bytes held by complete records (for stats).
    pub fn size(&self) -> u64 {
        self.list_ordered()
            .map(|records| {
                records
                    .iter()
                    .filter_map(|r| fs::metadata(&r.path).ok())
                    .map(|m| m.len())
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Remove the spool directory if it holds nothing. Returns whether it was removed.
    pub fn remove_dir_if_empty(&self) -> Result<bool, SpoolError> {
        let empty = fs::read_dir(&self.dir)
            .map_err(io_err(&self.dir))?
            .next()
            .is_none();
        if !empty {
            return Ok(false);
        }
        match fs::remove_dir(&self.dir) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(io_err(&self.dir)(e)),
        }
    }

    fn sweep_partial(&self) -> Result<(), SpoolError> {
        for entry in fs::read_dir(&self.dir).map_err(io_err(&self.dir))?.flatten() {
            let path = entry.path();
            if path.extension() == Some(OsStr::new(TMP_EXTENSION)) {
                tracing::warn!(path = %path.display(), "removing interrupted spool write");
                fs::remove_file(&path).map_err(io_err(&path))?;
            }
        }
        Ok(())
    }

    #[cfg(unix)]
    fn sync_dir(&self) -> Result<(), SpoolError> {
        fs::File::open(&self.dir)
            .and_then(|d| d.sync_all())
            .map_err(io_err(&self.dir))
    }

    #[cfg(not(unix))]
    fn sync_dir(&self) -> Result<(), SpoolError> {
        Ok(())
    }
}

// ── Carry-over between process runs ──────────────────────────────────────────

/// Move records left in `root` by a previous run into a fresh carry-over
/// directory. Returns the carry-over spool, or `None` if `root` held nothing.
///
/// Records move in ascending order, so an interrupted move leaves the lower
/// ids in the older carry-over directory.
pub fn seal_previous_session(root: &Path, fsync: bool) -> Result<Option<Spool>, SpoolError> {
    let current = Spool::open(root, fsync)?;
    let leftovers = current.list_ordered()?;
    if leftovers.is_empty() {
        return Ok(None);
    }

    let mut millis = murmur_core::wire::now_millis().max(0) as u64;
    let mut dir = root.join(format!("{CARRYOVER_PREFIX}{millis:020}"));
    while dir.exists() {
        millis += 1;
        dir = root.join(format!("{CARRYOVER_PREFIX}{millis:020}"));
    }
    let carryover = Spool::open(&dir, fsync)?;

    for record in &leftovers {
        let target = dir.join(record_file_name(record.sequence_id));
        fs::rename(&record.path, &target).map_err(io_err(&target))?;
    }
    if fsync {
        carryover.sync_dir()?;
        current.sync_dir()?;
    }

    tracing::info!(
        records = leftovers.len(),
        dir = %dir.display(),
        "sealed records from previous session"
    );
    Ok(Some(carryover))
}

/// Carry-over spools under `root`, oldest first.
pub fn carryover_spools(root: &Path, fsync: bool) -> Result<Vec<Spool>, SpoolError> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(root).map_err(io_err(root))?.flatten() {
        let is_carryover = entry
            .file_name()
            .to_str()
            .is_some_and(|n| n.starts_with(CARRYOVER_PREFIX));
        if is_carryover && entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    dirs.into_iter().map(|d| Spool::open(d, fsync)).collect()
}
