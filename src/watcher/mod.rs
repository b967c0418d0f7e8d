// SPDX-License-Identifier: Apache-2.0

//! Poll-based discovery and per-file state machine.
//!
//! [`Watch`] owns every tracked file. `each` advances all of them once and hands the
//! resulting events to a callback; `subscribe` runs `each` on a timer until stopped. All
//! public operations hold the same lock for their full duration, so `watch`, `unwatch`
//! and `discover` may be called from other threads while the poll loop runs.

mod state;
mod tokenizer;
mod watched_file;

pub use state::{Discovery, FileState, WatchEvent};
pub use tokenizer::{BufferedTokenizer, Token};
pub use watched_file::{FileStat, WatchedFile};

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{self, TailConfig};
use crate::error::Result;
use crate::input::{FileFinder, FileIdentity};

/// Granularity at which sleeps re-check the stop flag.
pub(crate) const SLEEP_SLICE: Duration = Duration::from_millis(500);

struct WatchInner {
    patterns: Vec<String>,
    files: BTreeMap<PathBuf, WatchedFile>,
    /// Files unwatched one by one; discovery never tracks these identities again
    unwatched: BTreeSet<FileIdentity>,
    finder: FileFinder,
    delimiter: Vec<u8>,
    max_line_size: usize,
    ignore_older: Option<Duration>,
    close_older: Option<Duration>,
    max_active: usize,
}

pub struct Watch {
    inner: Mutex<WatchInner>,
    stop: CancellationToken,
}

impl Default for Watch {
    fn default() -> Self {
        Self::new()
    }
}

impl Watch {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(WatchInner {
                patterns: Vec::new(),
                files: BTreeMap::new(),
                unwatched: BTreeSet::new(),
                finder: FileFinder::default(),
                delimiter: b"\n".to_vec(),
                max_line_size: 0,
                ignore_older: None,
                close_older: None,
                max_active: config::process_max_open_files(),
            }),
            stop: CancellationToken::new(),
        }
    }

    /// Engine configured from the watch-related fields of `config`.
    pub fn from_config(config: &TailConfig) -> Result<Self> {
        let watch = Self::new();
        watch.exclude(&config.exclude)?;
        watch.set_max_open_files(config.max_open_files);
        watch.set_ignore_older(config.ignore_older);
        watch.set_close_older(config.close_older);
        watch.set_delimiter(config.delimiter.clone());
        watch.set_max_line_size(config.max_line_size);
        Ok(watch)
    }

    fn lock(&self) -> MutexGuard<'_, WatchInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add basename exclude patterns.
    pub fn exclude(&self, patterns: &[String]) -> Result<()> {
        self.lock().finder.add_excludes(patterns)
    }

    /// Cap on simultaneously active files. Zero is ignored.
    pub fn set_max_open_files(&self, value: usize) {
        if value == 0 {
            return;
        }
        self.lock().max_active = value;
    }

    pub fn max_open_files(&self) -> usize {
        self.lock().max_active
    }

    /// Applies to files discovered after the call.
    pub fn set_ignore_older(&self, value: Option<Duration>) {
        self.lock().ignore_older = value.filter(|d| !d.is_zero());
    }

    /// Applies to files discovered after the call.
    pub fn set_close_older(&self, value: Option<Duration>) {
        self.lock().close_older = value.filter(|d| !d.is_zero());
    }

    /// Applies to files discovered after the call.
    pub fn set_delimiter(&self, delimiter: Vec<u8>) {
        self.lock().delimiter = delimiter;
    }

    /// Applies to files discovered after the call. Zero means unlimited.
    pub fn set_max_line_size(&self, max_line_size: usize) {
        self.lock().max_line_size = max_line_size;
    }

    /// Register `pattern` and immediately discover what it matches. Files found now are
    /// treated as present at startup.
    pub fn watch(&self, pattern: &str) -> Result<()> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.patterns.iter().any(|p| p == pattern) {
            return Ok(());
        }
        // Reject malformed patterns before registering them
        inner.finder.find_files(pattern)?;
        inner.patterns.push(pattern.to_string());
        debug!(pattern, "Watching pattern");
        discover_pattern(inner, pattern, Discovery::Initial);
        Ok(())
    }

    /// Stop tracking a registered pattern (and every file it matches) or a single file.
    /// A single file stays unwatched for the life of the engine, even while a registered
    /// pattern still matches it; a new file at the same path is tracked again. Returns
    /// whether anything was found.
    pub fn unwatch(&self, path: &str) -> bool {
        let mut guard = self.lock();
        let inner = &mut *guard;

        if let Some(idx) = inner.patterns.iter().position(|p| p == path) {
            inner.patterns.remove(idx);
            let matched = inner.finder.find_files(path).unwrap_or_default();
            for file in matched {
                if let Some(wf) = inner.files.get_mut(&file) {
                    wf.unwatch();
                    wf.file_close();
                }
            }
            debug!(pattern = path, "Unwatched pattern");
            return true;
        }

        match inner.files.get_mut(Path::new(path)) {
            Some(wf) => {
                wf.unwatch();
                wf.file_close();
                inner.unwatched.insert(wf.identity());
                debug!(path, identity = %wf.identity(), "Unwatched file");
                true
            }
            None => false,
        }
    }

    /// Re-expand every registered pattern.
    pub fn discover(&self) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let patterns = inner.patterns.clone();
        for pattern in &patterns {
            discover_pattern(inner, pattern, Discovery::Ongoing);
        }
    }

    /// One evaluation pass over every tracked file.
    pub fn each<F>(&self, mut callback: F)
    where
        F: FnMut(WatchEvent, &mut WatchedFile),
    {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.files.is_empty() {
            return;
        }

        // Parked files go back to watched when they change, so reactivation is throttled
        // like any new file
        for wf in inner
            .files
            .values_mut()
            .filter(|wf| wf.state() == FileState::Closed)
        {
            match wf.restat() {
                Ok(()) => {
                    if wf.size_changed() || wf.identity_changed() {
                        wf.watch();
                    }
                }
                Err(e) => stat_failed(wf, e, &mut callback),
            }
        }

        for wf in inner
            .files
            .values_mut()
            .filter(|wf| wf.state() == FileState::Ignored)
        {
            match wf.restat() {
                Ok(()) => {
                    if wf.size_changed() || wf.identity_changed() {
                        wf.watch();
                        callback(WatchEvent::Unignore, wf);
                    }
                }
                Err(e) => stat_failed(wf, e, &mut callback),
            }
        }

        let active = inner.files.values().filter(|wf| wf.is_active()).count();
        let to_take = inner.max_active.saturating_sub(active);
        if to_take > 0 {
            for wf in inner
                .files
                .values_mut()
                .filter(|wf| wf.state() == FileState::Watched)
                .take(to_take)
            {
                wf.activate();
                if wf.state_history_any(&[FileState::Closed, FileState::Ignored]) {
                    continue;
                }
                let event = if wf.is_initial() {
                    WatchEvent::CreateInitial
                } else {
                    WatchEvent::Create
                };
                callback(event, wf);
            }
        } else if inner
            .files
            .values()
            .any(|wf| wf.state() == FileState::Watched)
        {
            debug!(
                max_active = inner.max_active,
                "Active file limit reached, deferring watched files"
            );
        }

        for wf in inner.files.values_mut().filter(|wf| wf.is_active()) {
            if let Err(e) = wf.restat() {
                stat_failed(wf, e, &mut callback);
                continue;
            }

            if wf.file_closable() {
                debug!(path = ?wf.path(), idle = ?wf.idle_for(), "File idle, closing");
                callback(WatchEvent::Timeout, wf);
                wf.close();
                continue;
            }

            let old_size = wf.size();
            let new_size = wf.last_stat().size;
            let read_position = wf.read_position();
            if wf.identity_changed() {
                debug!(
                    path = ?wf.path(),
                    old = %wf.identity(),
                    new = %wf.last_stat().identity,
                    "File replaced"
                );
                wf.update_identity();
                callback(WatchEvent::Delete, wf);
                callback(WatchEvent::Create, wf);
                wf.update_size();
            } else if new_size < old_size || new_size < read_position {
                debug!(path = ?wf.path(), old_size, new_size, read_position, "File truncated");
                wf.set_truncated(true);
                callback(WatchEvent::Delete, wf);
                wf.set_truncated(false);
                callback(WatchEvent::Create, wf);
                wf.update_size();
            } else if new_size > read_position && (new_size > old_size || wf.open_failed()) {
                debug!(path = ?wf.path(), old_size, new_size, read_position, "File grew");
                callback(WatchEvent::Modify, wf);
                wf.update_size();
            } else {
                // Growth a reader already consumed
                wf.update_size();
            }
        }

        inner.files.retain(|path, wf| {
            if wf.state() == FileState::Unwatched {
                debug!(path = ?path, "Removing file from tracked set");
                false
            } else {
                true
            }
        });
    }

    /// Poll loop: `each` every `stat_interval`, `discover` every `discover_interval`
    /// passes, until [`Watch::quit`]. Releases every handle before returning.
    pub fn subscribe<F>(&self, stat_interval: Duration, discover_interval: u32, callback: F)
    where
        F: FnMut(WatchEvent, &mut WatchedFile),
    {
        self.subscribe_with(stat_interval, discover_interval, callback, || {});
    }

    /// Like [`Watch::subscribe`], calling `after_pass` once each evaluation pass completes.
    pub fn subscribe_with<F, P>(
        &self,
        stat_interval: Duration,
        discover_interval: u32,
        mut callback: F,
        mut after_pass: P,
    ) where
        F: FnMut(WatchEvent, &mut WatchedFile),
        P: FnMut(),
    {
        let discover_interval = discover_interval.max(1);
        let mut passes = 0u32;
        while !self.is_quit() {
            self.each(&mut callback);
            after_pass();

            passes += 1;
            if passes >= discover_interval {
                self.discover();
                passes = 0;
            }

            if self.is_quit() {
                break;
            }
            stoppable_sleep(&self.stop, stat_interval, SLEEP_SLICE, || false);
        }
        self.close_all();
    }

    /// Ask the poll loop to stop. Safe from any thread.
    pub fn quit(&self) {
        self.stop.cancel();
    }

    pub fn is_quit(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Release every open handle.
    pub fn close_all(&self) {
        for wf in self.lock().files.values_mut() {
            wf.file_close();
        }
    }

    /// Visit every file holding an open handle, under the engine lock.
    pub fn with_open_files<F>(&self, mut f: F)
    where
        F: FnMut(&mut WatchedFile),
    {
        for wf in self.lock().files.values_mut().filter(|wf| wf.is_open()) {
            f(wf);
        }
    }

    pub fn has_open_files(&self) -> bool {
        self.lock().files.values().any(|wf| wf.is_open())
    }

    /// Visit one tracked file, under the engine lock.
    pub fn with_file<F, R>(&self, path: &Path, f: F) -> Option<R>
    where
        F: FnOnce(&mut WatchedFile) -> R,
    {
        self.lock().files.get_mut(path).map(f)
    }

    pub fn tracked_count(&self) -> usize {
        self.lock().files.len()
    }

    /// Path and state of every tracked file.
    pub fn file_states(&self) -> Vec<(PathBuf, FileState)> {
        self.lock()
            .files
            .iter()
            .map(|(p, wf)| (p.clone(), wf.state()))
            .collect()
    }

    pub fn patterns(&self) -> Vec<String> {
        self.lock().patterns.clone()
    }
}

/// A vanished file is dropped. Consumers that were told about it get a delete; other
/// stat failures leave the file as is for the next pass.
fn stat_failed<F>(wf: &mut WatchedFile, err: io::Error, callback: &mut F)
where
    F: FnMut(WatchEvent, &mut WatchedFile),
{
    if err.kind() != io::ErrorKind::NotFound {
        debug!(path = ?wf.path(), state = %wf.state(), error = %err, "Stat failed");
        return;
    }

    debug!(path = ?wf.path(), state = %wf.state(), "File is gone");
    let announced = wf.was_activated();
    wf.unwatch();
    if announced {
        callback(WatchEvent::Delete, wf);
    }
    wf.file_close();
}

fn discover_pattern(inner: &mut WatchInner, pattern: &str, discovery: Discovery) {
    let paths = match inner.finder.find_files(pattern) {
        Ok(paths) => paths,
        Err(e) => {
            warn!(pattern, error = %e, "Failed to expand pattern");
            return;
        }
    };

    for path in paths {
        let known = inner.files.contains_key(&path);

        if let Some(excluded_by) = inner.finder.excluded_by(&path) {
            if let Some(wf) = inner.files.get_mut(&path) {
                debug!(path = ?path, exclude = excluded_by, "Tracked file now excluded");
                wf.file_close();
                wf.unwatch();
            } else {
                debug!(path = ?path, exclude = excluded_by, "Skipping excluded file");
            }
            continue;
        }

        if known {
            continue;
        }

        let stat = match FileStat::of(&path) {
            Ok(stat) => stat,
            Err(e) => {
                debug!(path = ?path, error = %e, "Stat failed on discovery");
                continue;
            }
        };
        if inner.unwatched.contains(&stat.identity) {
            continue;
        }

        let mut wf = WatchedFile::new(
            path.clone(),
            stat,
            discovery,
            &inner.delimiter,
            inner.ignore_older,
            inner.close_older,
        );
        wf.set_max_line_size(inner.max_line_size);
        if wf.file_ignorable() {
            debug!(
                path = ?path,
                age = ?stat.age(),
                "Ignoring backlog of file last modified too long ago"
            );
            wf.ignore();
        } else {
            debug!(path = ?path, ?discovery, "Discovered file");
        }
        inner.files.insert(path, wf);
    }
}

/// Sleep up to `total` in `slice` steps, returning early when `token` is cancelled or
/// `wake` reports true. Returns whether the token was cancelled.
pub(crate) fn stoppable_sleep<W>(
    token: &CancellationToken,
    total: Duration,
    slice: Duration,
    wake: W,
) -> bool
where
    W: Fn() -> bool,
{
    let deadline = Instant::now() + total;
    loop {
        if token.is_cancelled() {
            return true;
        }
        if wake() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        std::thread::sleep(slice.min(deadline - now));
    }
}
