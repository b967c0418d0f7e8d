// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(
        "No sincedb path configured and neither SINCEDB_PATH nor HOME is set; \
         a checkpoint location is required to track file progress"
    )]
    NoSinceDbPath,

    #[error("Malformed sincedb record in {path:?} at line {line}: {reason}")]
    Checkpoint {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("Invalid glob pattern: {0}")]
    InvalidGlob(String),

    #[error("Channel send error")]
    ChannelSend,
}

pub type Result<T> = std::result::Result<T, Error>;
