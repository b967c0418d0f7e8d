// SPDX-License-Identifier: Apache-2.0

//! Follow growing log files across rotation and truncation, remembering how far each file
//! has been read.

pub mod bounded_channel;
pub mod config;
pub mod error;
pub mod init;
pub mod input;
pub mod observer;
pub mod persistence;
pub mod reader;
pub mod watcher;

pub use config::TailConfig;
pub use error::{Error, Result};
pub use input::FileIdentity;
pub use observer::{Action, ChannelObserver, Context, Listener, ObservedEvent, Observer};
pub use reader::{ChunkOrder, ChunkedReader, ReadStrategy, TailReader};
pub use watcher::{Watch, WatchEvent, WatchedFile};
