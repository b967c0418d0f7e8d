// SPDX-License-Identifier: Apache-2.0

//! The sincedb: a durable mapping of file identity to bytes already read.
//!
//! On disk it is UTF-8 text with one record per line:
//!
//! ```text
//! <ino> <dev_major> <dev_minor> <byte_offset>
//! ```
//!
//! Writes go to a temporary file in the same directory which is then renamed over the
//! destination. Device-backed destinations (e.g. `/dev/null`) cannot be replaced that way
//! and are written in place at offset 0 instead.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{Error, Result};
use crate::input::FileIdentity;

/// In-memory checkpoint mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinceDb {
    entries: BTreeMap<FileIdentity, u64>,
}

impl SinceDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the mapping stored at `path`.
    ///
    /// A missing or unreadable file yields an empty mapping. A record that does not have
    /// exactly four numeric fields is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) => {
                debug!(path = ?path, error = %e, "No existing sincedb to load");
                return Ok(Self::new());
            }
        };

        let mut db = Self::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    debug!(path = ?path, error = %e, "Failed reading sincedb, starting empty");
                    return Ok(Self::new());
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let (identity, offset) = parse_record(&line).map_err(|reason| Error::Checkpoint {
                path: path.to_path_buf(),
                line: idx + 1,
                reason,
            })?;
            debug!(identity = %identity, offset, "Loaded sincedb record");
            db.entries.insert(identity, offset);
        }

        Ok(db)
    }

    pub fn get(&self, identity: &FileIdentity) -> Option<u64> {
        self.entries.get(identity).copied()
    }

    pub fn contains(&self, identity: &FileIdentity) -> bool {
        self.entries.contains_key(identity)
    }

    pub fn set(&mut self, identity: FileIdentity, offset: u64) {
        self.entries.insert(identity, offset);
    }

    /// Advance the offset for `identity` by `bytes`, starting from 0 if unknown.
    /// Returns the new offset.
    pub fn advance(&mut self, identity: FileIdentity, bytes: u64) -> u64 {
        let offset = self.entries.entry(identity).or_insert(0);
        *offset += bytes;
        *offset
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FileIdentity, &u64)> {
        self.entries.iter()
    }

    /// Serialize to the on-disk text format.
    pub fn serialize(&self) -> String {
        let mut out = String::with_capacity(self.entries.len() * 32);
        for (id, offset) in &self.entries {
            out.push_str(&format!(
                "{} {} {} {}\n",
                id.ino(),
                id.dev_major(),
                id.dev_minor(),
                offset
            ));
        }
        out
    }
}

fn parse_record(line: &str) -> std::result::Result<(FileIdentity, u64), String> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 4 {
        return Err(format!("expected 4 fields, found {}", fields.len()));
    }

    let mut numbers = [0u64; 4];
    for (slot, field) in numbers.iter_mut().zip(&fields) {
        *slot = field
            .parse::<u64>()
            .map_err(|e| format!("invalid number {:?}: {}", field, e))?;
    }

    Ok((
        FileIdentity::new(numbers[0], numbers[1], numbers[2]),
        numbers[3],
    ))
}

/// Write `db` to `path` as a full snapshot.
pub fn write(path: impl AsRef<Path>, db: &SinceDb) -> Result<()> {
    let path = path.as_ref();
    let contents = db.serialize();

    if is_device(path) {
        debug!(path = ?path, "Writing sincedb in place to device-backed path");
        let mut file = OpenOptions::new().write(true).open(path)?;
        file.write_all(contents.as_bytes())?;
        file.flush()?;
        return Ok(());
    }

    atomic_write(path, contents.as_bytes())
}

/// Flush `db` only when something changed and at least `min_interval` has passed since
/// `last_write`. Returns the new last-write time, or `last_write` unchanged when skipped.
pub fn maybe_write(
    path: impl AsRef<Path>,
    db: &SinceDb,
    last_write: Option<Instant>,
    min_interval: Duration,
    now: Instant,
    changed: bool,
) -> Result<Option<Instant>> {
    if !changed {
        return Ok(last_write);
    }

    if let Some(last) = last_write {
        let delta = now.saturating_duration_since(last);
        if delta < min_interval {
            return Ok(last_write);
        }
        debug!(delta = ?delta, "Writing sincedb");
    }

    write(path, db)?;
    Ok(Some(now))
}

#[cfg(unix)]
fn is_device(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;

    fs::metadata(path)
        .map(|m| {
            let ft = m.file_type();
            ft.is_char_device() || ft.is_block_device() || ft.is_fifo()
        })
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_device(_path: &Path) -> bool {
    false
}

/// Write to a sibling temp file, sync it, then rename over `path`.
fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }

    // Unique per process and per write so concurrent writers never share a temp file
    let unique_id = COUNTER.fetch_add(1, Ordering::SeqCst);
    let temp_path = path.with_extension(format!("tmp.{}.{}", std::process::id(), unique_id));

    let result = (|| -> Result<()> {
        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(contents)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);
        fs::rename(&temp_path, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_db() -> SinceDb {
        let mut db = SinceDb::new();
        db.set(FileIdentity::new(1001, 8, 1), 0);
        db.set(FileIdentity::new(1002, 8, 1), 6);
        db.set(FileIdentity::new(77, 259, 3), 123_456_789);
        db
    }

    #[test]
    fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sincedb");

        let db = sample_db();
        write(&path, &db).unwrap();

        let loaded = SinceDb::load(&path).unwrap();
        assert_eq!(loaded, db);
    }

    #[test]
    fn test_serialized_format() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sincedb");

        let mut db = SinceDb::new();
        db.set(FileIdentity::new(42, 8, 1), 6);
        write(&path, &db).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "42 8 1 6\n");
    }

    #[test]
    fn test_unchanged_file_rewrites_identically() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sincedb");
        fs::write(&path, "5 8 1 100\n9 8 2 0\n").unwrap();

        let db = SinceDb::load(&path).unwrap();
        write(&path, &db).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "5 8 1 100\n9 8 2 0\n");
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let db = SinceDb::load(dir.path().join("does-not-exist")).unwrap();
        assert!(db.is_empty());
    }

    #[test]
    fn test_load_skips_blank_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sincedb");
        fs::write(&path, "\n1 2 3 4\n\n").unwrap();

        let db = SinceDb::load(&path).unwrap();
        assert_eq!(db.get(&FileIdentity::new(1, 2, 3)), Some(4));
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn test_load_rejects_malformed_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sincedb");
        fs::write(&path, "1 2 3 4\n1 2 3 4 5\n").unwrap();

        match SinceDb::load(&path) {
            Err(Error::Checkpoint { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected checkpoint error, got {:?}", other),
        }

        fs::write(&path, "1 2 x 4\n").unwrap();
        assert!(matches!(
            SinceDb::load(&path),
            Err(Error::Checkpoint { line: 1, .. })
        ));
    }

    #[test]
    fn test_write_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sincedb");

        write(&path, &sample_db()).unwrap();
        write(&path, &sample_db()).unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("sincedb")]);
    }

    #[test]
    fn test_write_creates_parent_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/state/sincedb");

        write(&path, &sample_db()).unwrap();
        assert!(path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_write_to_device_in_place() {
        // /dev/null cannot be renamed over; the in-place path must be taken
        write("/dev/null", &sample_db()).unwrap();
    }

    #[test]
    fn test_advance_starts_from_zero() {
        let mut db = SinceDb::new();
        let id = FileIdentity::new(1, 0, 0);
        assert_eq!(db.advance(id, 6), 6);
        assert_eq!(db.advance(id, 4), 10);
    }

    #[test]
    fn test_maybe_write_requires_change() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sincedb");
        let now = Instant::now();

        let last = maybe_write(&path, &sample_db(), None, Duration::ZERO, now, false).unwrap();
        assert_eq!(last, None);
        assert!(!path.exists());
    }

    #[test]
    fn test_maybe_write_respects_interval() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sincedb");
        let interval = Duration::from_secs(10);
        let start = Instant::now();

        // Never written before: flushes immediately
        let last = maybe_write(&path, &sample_db(), None, interval, start, true).unwrap();
        assert_eq!(last, Some(start));
        assert!(path.exists());

        fs::remove_file(&path).unwrap();

        // Too soon: skipped, last write unchanged
        let soon = start + Duration::from_secs(3);
        let last = maybe_write(&path, &sample_db(), last, interval, soon, true).unwrap();
        assert_eq!(last, Some(start));
        assert!(!path.exists());

        // Interval elapsed: flushed
        let later = start + interval;
        let last = maybe_write(&path, &sample_db(), last, interval, later, true).unwrap();
        assert_eq!(last, Some(later));
        assert!(path.exists());
    }
}
