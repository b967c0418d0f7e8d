// SPDX-License-Identifier: Apache-2.0

use clap::{Args, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{self, TailConfig, age_limit};

/// How files are read once the engine reports activity
#[derive(Copy, Clone, Debug, Default, ValueEnum, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReadMode {
    /// Split on the delimiter and emit one event per line
    #[default]
    Line,
    /// Emit raw chunks, draining each file before moving on
    Depth,
    /// Emit raw chunks, one chunk per open file per pass
    Breadth,
}

#[derive(Debug, Args, Clone, Deserialize)]
#[serde(default)]
pub struct TailArgs {
    /// Read strategy: line, depth or breadth
    #[arg(value_enum, long, env = "TAILWATCH_MODE", default_value = "line")]
    pub mode: ReadMode,

    /// Poll interval in milliseconds between evaluation passes
    #[arg(long, env = "TAILWATCH_STAT_INTERVAL_MS", default_value = "1000")]
    pub stat_interval_ms: u64,

    /// Re-expand watch patterns every N evaluation passes
    #[arg(long, env = "TAILWATCH_DISCOVER_INTERVAL", default_value = "5")]
    pub discover_interval: u32,

    /// Minimum seconds between periodic checkpoint writes
    #[arg(long, env = "TAILWATCH_SINCEDB_WRITE_INTERVAL_SECS", default_value = "10")]
    pub sincedb_write_interval_secs: u64,

    /// Checkpoint file. Defaults to $HOME/.sincedb
    #[arg(long, env = "SINCEDB_PATH")]
    pub sincedb_path: Option<PathBuf>,

    /// Comma-separated glob patterns matched against file basenames
    #[arg(long, env = "TAILWATCH_EXCLUDE", value_delimiter = ',')]
    pub exclude: Vec<String>,

    /// Skip the backlog of files last modified more than this many seconds ago (0 disables)
    #[arg(
        long,
        env = "TAILWATCH_IGNORE_OLDER_SECS",
        default_value = "0",
        allow_negative_numbers = true
    )]
    pub ignore_older_secs: i64,

    /// Release handles of files idle for more than this many seconds (0 disables)
    #[arg(
        long,
        env = "TAILWATCH_CLOSE_OLDER_SECS",
        default_value = "0",
        allow_negative_numbers = true
    )]
    pub close_older_secs: i64,

    /// Maximum number of simultaneously active files
    #[arg(long, env = "FILEWATCH_MAX_OPEN_FILES")]
    pub max_open_files: Option<usize>,

    /// Bytes per read in chunked modes
    #[arg(long, env = "TAILWATCH_CHUNK_SIZE", default_value = "16384")]
    pub chunk_size: usize,

    /// Line delimiter in line mode. Accepts \n, \r and \t escapes
    #[arg(long, env = "TAILWATCH_DELIMITER", default_value = "\\n")]
    pub delimiter: String,

    /// Longest line in bytes emitted in line mode; longer lines are split
    #[arg(long, env = "TAILWATCH_MAX_LINE_SIZE", default_value = "1048576")]
    pub max_line_size: usize,

    /// Seconds between repeated warnings for a file that cannot be opened
    #[arg(long, env = "FILEWATCH_OPEN_WARN_INTERVAL")]
    pub open_warn_interval_secs: Option<u64>,

    /// Longest idle wait in milliseconds of the breadth-first reader when no file is open
    #[arg(long, env = "TAILWATCH_WAIT_FOR_FILES_MS", default_value = "5000")]
    pub wait_for_files_ms: u64,
}

impl Default for TailArgs {
    fn default() -> Self {
        Self {
            mode: ReadMode::Line,
            stat_interval_ms: 1000,
            discover_interval: config::DEFAULT_DISCOVER_INTERVAL,
            sincedb_write_interval_secs: config::DEFAULT_SINCEDB_WRITE_INTERVAL.as_secs(),
            sincedb_path: None,
            exclude: Vec::new(),
            ignore_older_secs: 0,
            close_older_secs: 0,
            max_open_files: None,
            chunk_size: config::DEFAULT_CHUNK_SIZE,
            delimiter: "\\n".to_string(),
            max_line_size: config::DEFAULT_MAX_LINE_SIZE,
            open_warn_interval_secs: None,
            wait_for_files_ms: 5000,
        }
    }
}

impl TailArgs {
    /// Build the engine config from command line args
    pub fn build_config(&self) -> TailConfig {
        TailConfig {
            stat_interval: Duration::from_millis(self.stat_interval_ms),
            discover_interval: self.discover_interval,
            sincedb_write_interval: Duration::from_secs(self.sincedb_write_interval_secs),
            sincedb_path: self.sincedb_path.clone(),
            exclude: self.exclude.clone(),
            ignore_older: age_limit(self.ignore_older_secs),
            close_older: age_limit(self.close_older_secs),
            max_open_files: self
                .max_open_files
                .filter(|n| *n > 0)
                .unwrap_or_else(config::process_max_open_files),
            chunk_size: self.chunk_size,
            delimiter: unescape_delimiter(&self.delimiter),
            max_line_size: self.max_line_size,
            open_warn_interval: self
                .open_warn_interval_secs
                .map(Duration::from_secs)
                .unwrap_or_else(config::process_open_warn_interval),
            wait_for_files: Duration::from_millis(self.wait_for_files_ms),
        }
    }
}

fn unescape_delimiter(raw: &str) -> Vec<u8> {
    raw.replace("\\r", "\r")
        .replace("\\n", "\n")
        .replace("\\t", "\t")
        .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Debug, Parser)]
    struct TestCli {
        #[command(flatten)]
        tail: TailArgs,
    }

    #[test]
    fn test_defaults_match_config() {
        let cli = TestCli::parse_from(["tailwatch"]);
        let config = cli.tail.build_config();

        assert_eq!(cli.tail.mode, ReadMode::Line);
        assert_eq!(config.stat_interval, Duration::from_secs(1));
        assert_eq!(config.discover_interval, 5);
        assert_eq!(config.sincedb_write_interval, Duration::from_secs(10));
        assert_eq!(config.chunk_size, 16384);
        assert_eq!(config.delimiter, b"\n");
        assert_eq!(config.max_line_size, config::DEFAULT_MAX_LINE_SIZE);
        assert!(config.ignore_older.is_none());
        assert!(config.close_older.is_none());
    }

    #[test]
    fn test_flags() {
        let cli = TestCli::parse_from([
            "tailwatch",
            "--mode",
            "breadth",
            "--exclude",
            "*.gz,*.bak",
            "--ignore-older-secs",
            "3600",
            "--close-older-secs",
            "-1",
            "--max-open-files",
            "8",
            "--delimiter",
            "\\r\\n",
            "--sincedb-path",
            "/tmp/sdb",
            "--max-line-size",
            "512",
        ]);
        let config = cli.tail.build_config();

        assert_eq!(cli.tail.mode, ReadMode::Breadth);
        assert_eq!(config.exclude, vec!["*.gz", "*.bak"]);
        assert_eq!(config.ignore_older, Some(Duration::from_secs(3600)));
        assert_eq!(config.close_older, None);
        assert_eq!(config.max_open_files, 8);
        assert_eq!(config.delimiter, b"\r\n");
        assert_eq!(config.max_line_size, 512);
        assert_eq!(config.sincedb_path, Some(PathBuf::from("/tmp/sdb")));
    }

    #[test]
    fn test_deserialize_partial() {
        let args: TailArgs =
            serde_json::from_str(r#"{"mode": "depth", "chunk_size": 4096}"#).unwrap();
        assert_eq!(args.mode, ReadMode::Depth);
        assert_eq!(args.chunk_size, 4096);
        assert_eq!(args.discover_interval, 5);
    }
}
