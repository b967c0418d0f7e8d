// SPDX-License-Identifier: Apache-2.0

//! Configuration for the watch engine and read strategies.

use std::ffi::OsString;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

pub const DEFAULT_STAT_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_DISCOVER_INTERVAL: u32 = 5;
pub const DEFAULT_SINCEDB_WRITE_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_OPEN_FILES: usize = 4095;
pub const DEFAULT_CHUNK_SIZE: usize = 16384;
pub const DEFAULT_OPEN_WARN_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_WAIT_FOR_FILES: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_LINE_SIZE: usize = 1024 * 1024;

pub const SINCEDB_PATH_ENV: &str = "SINCEDB_PATH";
pub const MAX_OPEN_FILES_ENV: &str = "FILEWATCH_MAX_OPEN_FILES";
pub const OPEN_WARN_INTERVAL_ENV: &str = "FILEWATCH_OPEN_WARN_INTERVAL";

/// Configuration shared by the watch engine and every read strategy
#[derive(Debug, Clone)]
pub struct TailConfig {
    /// Time between evaluation passes over the tracked files
    pub stat_interval: Duration,
    /// Re-expand the watch patterns every N evaluation passes
    pub discover_interval: u32,
    /// Minimum time between periodic checkpoint flushes
    pub sincedb_write_interval: Duration,
    /// Checkpoint location; resolved from the environment when unset
    pub sincedb_path: Option<PathBuf>,
    /// Glob patterns matched against file basenames
    pub exclude: Vec<String>,
    /// Files older than this at discovery time have their backlog skipped
    pub ignore_older: Option<Duration>,
    /// Files idle longer than this have their handle released
    pub close_older: Option<Duration>,
    /// Cap on simultaneously active files
    pub max_open_files: usize,
    /// Bytes per read in chunked mode
    pub chunk_size: usize,
    /// Line terminator in line mode
    pub delimiter: Vec<u8>,
    /// Longest line handed out in line mode; longer lines arrive in pieces of this size
    pub max_line_size: usize,
    /// Suppression window for repeated open-failure warnings on one path
    pub open_warn_interval: Duration,
    /// Longest idle wait of the breadth-first read loop when nothing is open
    pub wait_for_files: Duration,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            stat_interval: DEFAULT_STAT_INTERVAL,
            discover_interval: DEFAULT_DISCOVER_INTERVAL,
            sincedb_write_interval: DEFAULT_SINCEDB_WRITE_INTERVAL,
            sincedb_path: None,
            exclude: Vec::new(),
            ignore_older: None,
            close_older: None,
            max_open_files: process_max_open_files(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            delimiter: b"\n".to_vec(),
            max_line_size: DEFAULT_MAX_LINE_SIZE,
            open_warn_interval: process_open_warn_interval(),
            wait_for_files: DEFAULT_WAIT_FOR_FILES,
        }
    }
}

impl TailConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be greater than 0".to_string()));
        }
        if self.delimiter.is_empty() {
            return Err(Error::Config("delimiter must not be empty".to_string()));
        }
        if self.max_line_size == 0 {
            return Err(Error::Config(
                "max_line_size must be greater than 0".to_string(),
            ));
        }
        if self.discover_interval == 0 {
            return Err(Error::Config(
                "discover_interval must be at least 1".to_string(),
            ));
        }
        if self.max_open_files == 0 {
            return Err(Error::Config(
                "max_open_files must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve where checkpoints live: the configured path, then `SINCEDB_PATH`, then
    /// `$HOME/.sincedb`.
    pub fn resolve_sincedb_path(&self) -> Result<PathBuf> {
        self.resolve_sincedb_path_with(|key| std::env::var_os(key))
    }

    pub fn resolve_sincedb_path_with<F>(&self, lookup: F) -> Result<PathBuf>
    where
        F: Fn(&str) -> Option<OsString>,
    {
        if let Some(path) = &self.sincedb_path {
            return Ok(path.clone());
        }
        if let Some(path) = lookup(SINCEDB_PATH_ENV).filter(|p| !p.is_empty()) {
            return Ok(PathBuf::from(path));
        }
        if let Some(home) = lookup("HOME").filter(|p| !p.is_empty()) {
            return Ok(PathBuf::from(home).join(".sincedb"));
        }
        Err(Error::NoSinceDbPath)
    }
}

/// Convert a user supplied age in seconds. Zero or negative disables the limit.
pub fn age_limit(secs: i64) -> Option<Duration> {
    if secs <= 0 {
        None
    } else {
        Some(Duration::from_secs(secs as u64))
    }
}

/// `FILEWATCH_MAX_OPEN_FILES`, or the default when unset, unparsable or not positive.
pub fn process_max_open_files() -> usize {
    env_or(MAX_OPEN_FILES_ENV, DEFAULT_MAX_OPEN_FILES, |n: &usize| *n > 0)
}

/// `FILEWATCH_OPEN_WARN_INTERVAL` in seconds, or the default.
pub fn process_open_warn_interval() -> Duration {
    let secs = env_or(
        OPEN_WARN_INTERVAL_ENV,
        DEFAULT_OPEN_WARN_INTERVAL.as_secs(),
        |_: &u64| true,
    );
    Duration::from_secs(secs)
}

fn env_or<T, P>(key: &str, default: T, accept: P) -> T
where
    T: FromStr,
    P: Fn(&T) -> bool,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .filter(accept)
        .unwrap_or(default)
}
