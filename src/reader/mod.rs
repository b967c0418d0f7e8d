// SPDX-License-Identifier: Apache-2.0

//! Read strategies layered on the [`Watch`] engine.
//!
//! A strategy reacts to engine events: it opens handles at the right offset, reads,
//! forwards data to an [`Observer`] and advances checkpoints. It never changes a file's
//! lifecycle state beyond marking the reading sub-states.

mod chunked;
mod tail;

pub use chunked::{ChunkOrder, ChunkedReader};
pub use tail::TailReader;

use std::cell::Cell;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Instant, SystemTime};

use tracing::{debug, info, warn};

use crate::config::TailConfig;
use crate::error::Result;
use crate::input::FileIdentity;
use crate::observer::{Action, Context, Listener, Observer};
use crate::persistence::Checkpoints;
use crate::watcher::{Watch, WatchEvent, WatchedFile};

pub trait ReadStrategy: Send + Sync {
    fn base(&self) -> &ReadBase;

    /// Run the poll loop, reading and forwarding data to `observer`, until [`quit`] is
    /// called. Ends with a checkpoint flush whose failure is returned.
    ///
    /// [`quit`]: ReadStrategy::quit
    fn subscribe<O: Observer>(&self, observer: &O) -> Result<()>;

    /// Start following files matching `pattern`.
    fn monitor(&self, pattern: &str) -> Result<()> {
        self.base().monitor(pattern)
    }

    fn sincedb_write(&self, reason: &str) -> Result<()> {
        self.base().sincedb_write(reason)
    }

    fn quit(&self) -> Result<()> {
        self.base().quit()
    }

    fn close_file(&self, path: &str) -> Result<bool> {
        self.base().close_file(path)
    }
}

/// State shared by every strategy: the engine, checkpoints and open-failure throttling.
pub struct ReadBase {
    watch: Watch,
    checkpoints: Checkpoints,
    last_open_warning: Mutex<HashMap<PathBuf, Instant>>,
    config: TailConfig,
}

impl ReadBase {
    /// Fails when the configuration is invalid or no checkpoint location can be resolved.
    pub fn new(config: &TailConfig) -> Result<Self> {
        config.validate()?;
        let sincedb_path = config.resolve_sincedb_path()?;
        let watch = Watch::from_config(config)?;
        let checkpoints = Checkpoints::open(sincedb_path, config.sincedb_write_interval);

        Ok(Self {
            watch,
            checkpoints,
            last_open_warning: Mutex::new(HashMap::new()),
            config: config.clone(),
        })
    }

    pub fn watch(&self) -> &Watch {
        &self.watch
    }

    pub fn checkpoints(&self) -> &Checkpoints {
        &self.checkpoints
    }

    pub fn config(&self) -> &TailConfig {
        &self.config
    }

    pub fn monitor(&self, pattern: &str) -> Result<()> {
        self.watch.watch(pattern)
    }

    pub fn sincedb_write(&self, reason: &str) -> Result<()> {
        debug!(reason, "Checkpoint write requested");
        self.checkpoints.flush(reason)
    }

    /// Flush checkpoints, stop the poll loop and release every handle.
    pub fn quit(&self) -> Result<()> {
        let flushed = self.checkpoints.flush("quit");
        self.watch.quit();
        self.watch.close_all();
        flushed
    }

    /// Stop following `path` (a file or a registered pattern) and flush checkpoints.
    /// Returns whether anything was being followed.
    pub fn close_file(&self, path: &str) -> Result<bool> {
        if !self.watch.unwatch(path) {
            return Ok(false);
        }
        info!(path, "Closed file on request");
        self.checkpoints.flush("close_file")?;
        Ok(true)
    }

    pub(crate) fn context(wf: &WatchedFile) -> Context {
        Context::new(
            wf.path(),
            Some(wf.checkpoint_key().unwrap_or_else(|| wf.identity())),
        )
    }

    /// Open `wf` and position it according to its checkpoint.
    ///
    /// With a checkpoint, reading resumes there unless the file has shrunk below it. Without
    /// one, a create starts at 0, or at the end when the file is already older than
    /// `ignore_older`.
    pub(crate) fn open_file(&self, wf: &mut WatchedFile, event: WatchEvent) -> bool {
        match self.try_open(wf.path(), wf, event) {
            Ok((file, key, start)) => {
                wf.file_open(file, key);
                wf.update_read_position(start);
                true
            }
            Err(e) => {
                wf.set_open_failed();
                self.warn_open_failure(wf.path(), &e);
                false
            }
        }
    }

    fn try_open(
        &self,
        path: &Path,
        wf: &WatchedFile,
        event: WatchEvent,
    ) -> io::Result<(File, FileIdentity, u64)> {
        let mut file = File::open(path)?;
        let key = FileIdentity::from_file(&file)?;
        let metadata = file.metadata()?;
        let size = metadata.len();

        let expired = wf.ignore_older().is_some_and(|limit| {
            metadata
                .modified()
                .ok()
                .and_then(|m| SystemTime::now().duration_since(m).ok())
                .is_some_and(|age| age > limit)
        });
        let expired_size = if expired { size } else { 0 };

        let start = match self.checkpoints.get(&key) {
            Some(last) if last <= size => {
                debug!(path = ?path, identity = %key, offset = last, size, "Resuming at checkpoint");
                last
            }
            Some(last) => {
                debug!(path = ?path, identity = %key, offset = last, size, "Checkpoint beyond end of file, starting over");
                self.checkpoints.set(key, 0);
                0
            }
            None if event.is_create() => {
                debug!(path = ?path, identity = %key, offset = expired_size, %event, "No checkpoint");
                self.checkpoints.set(key, expired_size);
                expired_size
            }
            None => {
                debug!(path = ?path, identity = %key, "No checkpoint, starting at 0");
                self.checkpoints.set(key, 0);
                0
            }
        };

        if start > 0 {
            file.seek(SeekFrom::Start(start))?;
        }
        Ok((file, key, start))
    }

    fn warn_open_failure(&self, path: &Path, err: &io::Error) {
        let mut last = self
            .last_open_warning
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let due = last
            .get(path)
            .is_none_or(|at| now.duration_since(*at) > self.config.open_warn_interval);

        if due {
            warn!(path = ?path, error = %err, "Failed to open file");
            last.insert(path.to_path_buf(), now);
        } else {
            debug!(path = ?path, error = %err, "Failed to open file (warning suppressed)");
        }
    }

    /// An ignored file changed: only bytes written after it was ignored are read.
    pub(crate) fn handle_unignore(&self, wf: &WatchedFile) {
        if self.checkpoints.seed(wf.identity(), wf.size()) {
            debug!(path = ?wf.path(), offset = wf.size(), "Seeded checkpoint for unignored file");
        }
    }

    /// Event handling shared by the strategies that read inside the poll loop. `read`
    /// consumes from the open handle and reports whether any data was read.
    pub(crate) fn handle_event<O, R>(
        &self,
        event: WatchEvent,
        wf: &mut WatchedFile,
        observer: &O,
        mut read: R,
    ) -> bool
    where
        O: Observer,
        R: FnMut(&mut WatchedFile, &mut O::Listener, &Context) -> bool,
    {
        let ctx = Self::context(wf);
        let mut listener = observer.channel_for(&ctx);

        match event {
            WatchEvent::CreateInitial | WatchEvent::Create => {
                if wf.is_open() {
                    debug!(path = ?wf.path(), %event, "File already open");
                    return false;
                }
                if !self.open_file(wf, event) {
                    return false;
                }
                let ctx = Self::context(wf);
                listener.accept(&ctx, Action::Created);
                wf.mark_reading();
                read(wf, &mut listener, &ctx)
            }
            WatchEvent::Modify => {
                if !wf.is_open() && !self.open_file(wf, event) {
                    return false;
                }
                let ctx = Self::context(wf);
                wf.mark_reading_more();
                read(wf, &mut listener, &ctx)
            }
            WatchEvent::Delete if wf.truncated() => {
                // The old content is gone; the create that follows reads from the start
                let key = wf.checkpoint_key().unwrap_or_else(|| wf.identity());
                self.checkpoints.set(key, 0);
                wf.file_close();
                wf.update_read_position(0);
                listener.accept(&ctx, Action::Deleted);
                true
            }
            WatchEvent::Delete => {
                // Whatever was written before the rename is still readable
                let changed = wf.is_open() && read(wf, &mut listener, &ctx);
                wf.file_close();
                listener.accept(&ctx, Action::Deleted);
                changed
            }
            WatchEvent::Timeout => {
                wf.file_close();
                listener.accept(&ctx, Action::TimedOut);
                false
            }
            WatchEvent::Unignore => {
                self.handle_unignore(wf);
                false
            }
        }
    }

    /// Run the poll loop with `handle` invoked per event; flushes checkpoints at most once
    /// per pass when `handle` reported data, and once more on exit.
    pub(crate) fn run_poll_loop<H>(&self, handle: H) -> Result<()>
    where
        H: FnMut(WatchEvent, &mut WatchedFile) -> bool,
    {
        self.poll(handle);
        self.sincedb_write("shutdown")
    }

    /// The poll loop without the final flush.
    pub(crate) fn poll<H>(&self, mut handle: H)
    where
        H: FnMut(WatchEvent, &mut WatchedFile) -> bool,
    {
        info!(
            patterns = ?self.watch.patterns(),
            sincedb = ?self.checkpoints.path(),
            "Starting poll loop"
        );
        let changed = Cell::new(false);
        self.watch.subscribe_with(
            self.config.stat_interval,
            self.config.discover_interval,
            |event, wf| {
                if handle(event, wf) {
                    changed.set(true);
                }
            },
            || {
                if changed.replace(false) {
                    self.checkpoints.maybe_flush(true);
                }
            },
        );
        info!("Poll loop stopped");
    }
}

/// Record how far the handle has been read.
pub(crate) fn record_position(wf: &mut WatchedFile) {
    if let Some(pos) = wf.file_mut().and_then(|f| f.stream_position().ok()) {
        wf.update_read_position(pos);
    }
}

/// `WouldBlock` and `Interrupted` end the pass; the read is retried on the next event.
pub(crate) fn report_read_error<L: Listener>(
    wf: &WatchedFile,
    listener: &mut L,
    ctx: &Context,
    err: io::Error,
) {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {
            debug!(path = ?wf.path(), error = %err, "Transient read error");
        }
        _ => warn!(path = ?wf.path(), error = %err, "Read failed"),
    }
    listener.accept(ctx, Action::Error(err.to_string()));
}
