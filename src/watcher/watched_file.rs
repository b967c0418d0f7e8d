// SPDX-License-Identifier: Apache-2.0

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use tracing::debug;

use super::state::{Discovery, FileState};
use super::tokenizer::{BufferedTokenizer, Token};
use crate::input::FileIdentity;

/// Snapshot of the stat data the engine cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub modified: SystemTime,
    pub identity: FileIdentity,
}

impl FileStat {
    pub fn of(path: &Path) -> io::Result<Self> {
        let metadata = fs::metadata(path)?;
        let identity = FileIdentity::from_metadata(path, &metadata)?;
        Ok(Self {
            size: metadata.len(),
            modified: metadata.modified().unwrap_or_else(|_| SystemTime::now()),
            identity,
        })
    }

    /// Time since last modification, zero for timestamps in the future.
    pub fn age(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.modified)
            .unwrap_or(Duration::ZERO)
    }
}

/// The engine's record of one matched path.
///
/// The engine owns state transitions; read strategies only open and close the handle,
/// feed the tokenizer and record how far they have read.
#[derive(Debug)]
pub struct WatchedFile {
    path: PathBuf,
    identity: FileIdentity,
    size: u64,
    read_position: u64,
    last_stat: FileStat,
    state: FileState,
    state_history: Vec<FileState>,
    discovery: Discovery,
    ignore_older: Option<Duration>,
    close_older: Option<Duration>,
    file: Option<File>,
    checkpoint_key: Option<FileIdentity>,
    tokenizer: BufferedTokenizer,
    last_activity: Instant,
    at_eof: bool,
    truncated: bool,
    open_failed: bool,
}

impl WatchedFile {
    pub fn new(
        path: PathBuf,
        stat: FileStat,
        discovery: Discovery,
        delimiter: &[u8],
        ignore_older: Option<Duration>,
        close_older: Option<Duration>,
    ) -> Self {
        Self {
            path,
            identity: stat.identity,
            size: 0,
            read_position: 0,
            last_stat: stat,
            state: FileState::Watched,
            state_history: Vec::new(),
            discovery,
            ignore_older,
            close_older,
            file: None,
            checkpoint_key: None,
            tokenizer: BufferedTokenizer::new(delimiter.to_vec()),
            last_activity: Instant::now(),
            at_eof: false,
            truncated: false,
            open_failed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Identity the file is currently tracked (and checkpointed) under.
    pub fn identity(&self) -> FileIdentity {
        self.identity
    }

    /// Stat size the engine last acknowledged.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Offset a reader has consumed up to in the current (or last) handle.
    pub fn read_position(&self) -> u64 {
        self.read_position
    }

    pub fn last_stat(&self) -> &FileStat {
        &self.last_stat
    }

    pub fn state(&self) -> FileState {
        self.state
    }

    pub fn state_history(&self) -> &[FileState] {
        &self.state_history
    }

    pub fn discovery(&self) -> Discovery {
        self.discovery
    }

    pub fn is_initial(&self) -> bool {
        self.discovery == Discovery::Initial
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn state_history_any(&self, states: &[FileState]) -> bool {
        self.state_history.iter().any(|s| states.contains(s))
    }

    /// True once a create event has been handed out for this file.
    pub fn was_activated(&self) -> bool {
        self.state.is_active() || self.state_history.iter().any(|s| s.is_active())
    }

    fn set_state(&mut self, state: FileState) {
        if self.state == state {
            return;
        }
        debug!(path = ?self.path, from = %self.state, to = %state, "File state change");
        self.state_history.push(self.state);
        self.state = state;
    }

    pub fn watch(&mut self) {
        self.set_state(FileState::Watched);
    }

    /// Promotion restarts the idle clock.
    pub fn activate(&mut self) {
        self.touch();
        self.set_state(FileState::Active);
    }

    pub fn mark_reading(&mut self) {
        self.set_state(FileState::Reading);
    }

    pub fn mark_reading_more(&mut self) {
        self.set_state(FileState::ReadingMore);
    }

    /// Skip existing content: the size jumps to the stat size so only later growth counts.
    pub fn ignore(&mut self) {
        self.size = self.last_stat.size;
        self.set_state(FileState::Ignored);
    }

    /// Release the handle and park the file until it changes.
    pub fn close(&mut self) {
        self.file_close();
        self.set_state(FileState::Closed);
    }

    /// Mark the file terminal. The handle is left for the caller to drain and release.
    pub fn unwatch(&mut self) {
        self.set_state(FileState::Unwatched);
    }

    /// Refresh the cached stat snapshot.
    pub fn restat(&mut self) -> io::Result<()> {
        self.last_stat = FileStat::of(&self.path)?;
        Ok(())
    }

    pub fn size_changed(&self) -> bool {
        self.last_stat.size != self.size
    }

    pub fn identity_changed(&self) -> bool {
        self.last_stat.identity != self.identity
    }

    /// Adopt the identity from the last stat, e.g. after rotation.
    pub fn update_identity(&mut self) {
        self.identity = self.last_stat.identity;
    }

    /// Adopt the size from the last stat. Any change counts as activity.
    pub fn update_size(&mut self) {
        if self.last_stat.size != self.size {
            self.last_activity = Instant::now();
        }
        self.size = self.last_stat.size;
    }

    /// Record the position a reader has consumed up to.
    pub fn update_read_position(&mut self, position: u64) {
        self.read_position = position;
        self.touch();
    }

    /// Set by the engine while it reports a truncation, so readers do not drain the
    /// handle into content that replaced what was read.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub(crate) fn set_truncated(&mut self, truncated: bool) {
        self.truncated = truncated;
    }

    /// The last attempt to open the file failed. The engine keeps re-reporting unread
    /// content until an open succeeds.
    pub fn open_failed(&self) -> bool {
        self.open_failed
    }

    pub fn set_open_failed(&mut self) {
        self.open_failed = true;
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Last modified longer ago than `ignore_older`.
    pub fn file_ignorable(&self) -> bool {
        self.ignore_older
            .is_some_and(|limit| self.last_stat.age() > limit)
    }

    /// Idle longer than `close_older`.
    pub fn file_closable(&self) -> bool {
        self.close_older
            .is_some_and(|limit| self.last_activity.elapsed() > limit)
    }

    pub fn ignore_older(&self) -> Option<Duration> {
        self.ignore_older
    }

    pub fn close_older(&self) -> Option<Duration> {
        self.close_older
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Attach an open handle. `key` is the identity of the opened file, under which
    /// everything read through this handle is checkpointed.
    pub fn file_open(&mut self, file: File, key: FileIdentity) {
        self.file = Some(file);
        self.checkpoint_key = Some(key);
        self.at_eof = false;
        self.open_failed = false;
    }

    /// Identity of the file behind the open handle. Differs from `identity()` between a
    /// rotation being detected and the old handle being released.
    pub fn checkpoint_key(&self) -> Option<FileIdentity> {
        self.checkpoint_key
    }

    pub fn file_mut(&mut self) -> Option<&mut File> {
        self.file.as_mut()
    }

    /// Drop the handle without changing state.
    ///
    /// A partial line is discarded with it; it was never checkpointed, so reopening at the
    /// checkpoint reads it again.
    pub fn file_close(&mut self) {
        if self.file.take().is_some() {
            let partial = self.tokenizer.flush();
            debug!(path = ?self.path, discarded = partial.len(), "Closed file handle");
        }
        self.checkpoint_key = None;
        self.at_eof = false;
    }

    /// Split freshly read bytes into completed lines.
    pub fn buffer_extract(&mut self, data: &[u8]) -> Vec<Token> {
        self.tokenizer.extract(data)
    }

    /// Cap on the length of a single line; zero removes it.
    pub fn set_max_line_size(&mut self, max_line_size: usize) {
        self.tokenizer.set_max_size(max_line_size);
    }

    pub fn at_eof(&self) -> bool {
        self.at_eof
    }

    pub fn set_at_eof(&mut self, at_eof: bool) {
        self.at_eof = at_eof;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn tracked(dir: &TempDir, name: &str, content: &[u8]) -> WatchedFile {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        let stat = FileStat::of(&path).unwrap();
        WatchedFile::new(path, stat, Discovery::Initial, b"\n", None, None)
    }

    #[test]
    fn test_new_file_is_watched_with_zero_size() {
        let dir = TempDir::new().unwrap();
        let wf = tracked(&dir, "a.log", b"hello\n");

        assert_eq!(wf.state(), FileState::Watched);
        assert_eq!(wf.size(), 0);
        assert_eq!(wf.last_stat().size, 6);
        assert!(wf.size_changed());
        assert!(wf.is_initial());
        assert!(wf.state_history().is_empty());
    }

    #[test]
    fn test_ignore_adopts_stat_size() {
        let dir = TempDir::new().unwrap();
        let mut wf = tracked(&dir, "a.log", b"0123456789");

        wf.ignore();
        assert_eq!(wf.state(), FileState::Ignored);
        assert_eq!(wf.size(), 10);
        assert!(!wf.size_changed());
    }

    #[test]
    fn test_state_history_records_transitions() {
        let dir = TempDir::new().unwrap();
        let mut wf = tracked(&dir, "a.log", b"");

        wf.activate();
        wf.mark_reading();
        wf.close();
        wf.watch();

        assert_eq!(
            wf.state_history(),
            &[
                FileState::Watched,
                FileState::Active,
                FileState::Reading,
                FileState::Closed
            ]
        );
        assert!(wf.state_history_any(&[FileState::Closed, FileState::Ignored]));
        assert!(wf.was_activated());
    }

    #[test]
    fn test_close_releases_handle() {
        let dir = TempDir::new().unwrap();
        let mut wf = tracked(&dir, "a.log", b"x");

        wf.activate();
        let key = wf.identity();
        wf.file_open(File::open(wf.path()).unwrap(), key);
        assert!(wf.is_open());
        assert_eq!(wf.checkpoint_key(), Some(key));

        wf.close();
        assert!(!wf.is_open());
        assert_eq!(wf.checkpoint_key(), None);
        assert_eq!(wf.state(), FileState::Closed);
    }

    #[test]
    fn test_restat_detects_growth_and_replacement() {
        let dir = TempDir::new().unwrap();
        let mut wf = tracked(&dir, "a.log", b"abc");
        wf.update_size();
        assert!(!wf.size_changed());

        let mut f = fs::OpenOptions::new().append(true).open(wf.path()).unwrap();
        f.write_all(b"def").unwrap();
        drop(f);

        wf.restat().unwrap();
        assert!(wf.size_changed());
        assert!(!wf.identity_changed());

        let path = wf.path().to_path_buf();
        fs::rename(&path, dir.path().join("a.log.1")).unwrap();
        fs::write(&path, b"new").unwrap();

        wf.restat().unwrap();
        assert!(wf.identity_changed());
        wf.update_identity();
        assert!(!wf.identity_changed());
    }

    #[test]
    fn test_restat_missing_file() {
        let dir = TempDir::new().unwrap();
        let mut wf = tracked(&dir, "a.log", b"abc");
        fs::remove_file(wf.path()).unwrap();

        let err = wf.restat().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_ignorable_and_closable_disabled_by_default() {
        let dir = TempDir::new().unwrap();
        let wf = tracked(&dir, "a.log", b"abc");
        assert!(!wf.file_ignorable());
        assert!(!wf.file_closable());
    }

    #[test]
    fn test_closable_after_idle() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, b"abc").unwrap();
        let stat = FileStat::of(&path).unwrap();
        let mut wf = WatchedFile::new(
            path,
            stat,
            Discovery::Ongoing,
            b"\n",
            None,
            Some(Duration::from_millis(20)),
        );

        assert!(!wf.file_closable());
        std::thread::sleep(Duration::from_millis(40));
        assert!(wf.file_closable());

        wf.touch();
        assert!(!wf.file_closable());
    }

    #[test]
    fn test_ignorable_uses_modification_age() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, b"abc").unwrap();
        let mut stat = FileStat::of(&path).unwrap();
        stat.modified = SystemTime::now() - Duration::from_secs(120);

        let wf = WatchedFile::new(
            path,
            stat,
            Discovery::Initial,
            b"\n",
            Some(Duration::from_secs(60)),
            None,
        );
        assert!(wf.file_ignorable());
    }

    #[test]
    fn test_read_position_tracked_apart_from_size() {
        let dir = TempDir::new().unwrap();
        let mut wf = tracked(&dir, "a.log", b"0123456789");
        wf.update_size();
        assert_eq!(wf.size(), 10);

        wf.update_read_position(4);
        assert_eq!(wf.read_position(), 4);
        assert_eq!(wf.size(), 10);
        assert!(!wf.size_changed());
    }
}
