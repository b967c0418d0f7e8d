// SPDX-License-Identifier: Apache-2.0

//! Shared checkpoint state for the read strategies.
//!
//! Wraps a [`SinceDb`] together with its destination path and flush bookkeeping behind a
//! single lock. Flushes happen while the lock is held, so an explicit flush on shutdown can
//! never interleave with a periodic one.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::sincedb::{self, SinceDb};
use crate::error::Result;
use crate::input::FileIdentity;

struct CheckpointState {
    db: SinceDb,
    last_write: Option<Instant>,
}

pub struct Checkpoints {
    path: PathBuf,
    write_interval: Duration,
    state: Mutex<CheckpointState>,
}

impl Checkpoints {
    /// Load checkpoints from `path`. A malformed file is logged and treated as empty.
    pub fn open(path: impl Into<PathBuf>, write_interval: Duration) -> Self {
        let path = path.into();
        let db = match SinceDb::load(&path) {
            Ok(db) => {
                debug!(path = ?path, entries = db.len(), "Loaded sincedb");
                db
            }
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to load sincedb, starting without checkpoints");
                SinceDb::new()
            }
        };
        Self::with_db(path, write_interval, db)
    }

    pub fn with_db(path: impl Into<PathBuf>, write_interval: Duration, db: SinceDb) -> Self {
        Self {
            path: path.into(),
            write_interval,
            state: Mutex::new(CheckpointState {
                db,
                last_write: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CheckpointState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, identity: &FileIdentity) -> Option<u64> {
        self.lock().db.get(identity)
    }

    pub fn contains(&self, identity: &FileIdentity) -> bool {
        self.lock().db.contains(identity)
    }

    pub fn set(&self, identity: FileIdentity, offset: u64) {
        self.lock().db.set(identity, offset);
    }

    /// Record `bytes` more consumed for `identity`, returning the new offset.
    pub fn advance(&self, identity: FileIdentity, bytes: u64) -> u64 {
        self.lock().db.advance(identity, bytes)
    }

    /// Insert `offset` only if there is no entry for `identity` yet.
    pub fn seed(&self, identity: FileIdentity, offset: u64) -> bool {
        let mut state = self.lock();
        if state.db.contains(&identity) {
            return false;
        }
        state.db.set(identity, offset);
        true
    }

    pub fn snapshot(&self) -> SinceDb {
        self.lock().db.clone()
    }

    /// Unconditionally write the current mapping. Errors are returned to the caller.
    pub fn flush(&self, reason: &str) -> Result<()> {
        let mut state = self.lock();
        info!(path = ?self.path, reason, entries = state.db.len(), "Writing sincedb");
        sincedb::write(&self.path, &state.db)?;
        state.last_write = Some(Instant::now());
        Ok(())
    }

    /// Periodic flush, gated by `changed` and the write interval. Failures are logged
    /// and leave the last-write time untouched so the next pass retries.
    pub fn maybe_flush(&self, changed: bool) {
        let mut state = self.lock();
        match sincedb::maybe_write(
            &self.path,
            &state.db,
            state.last_write,
            self.write_interval,
            Instant::now(),
            changed,
        ) {
            Ok(last_write) => state.last_write = last_write,
            Err(e) => warn!(path = ?self.path, error = %e, "Periodic sincedb write failed"),
        }
    }
}
