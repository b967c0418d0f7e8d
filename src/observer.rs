// SPDX-License-Identifier: Apache-2.0

//! Hand-off from the read strategies to whatever consumes file data.
//!
//! For every engine event a reader asks the [`Observer`] for a [`Listener`] bound to the
//! file, then pushes one or more [`Action`]s into it.

use std::fmt;
use std::path::PathBuf;

use tracing::debug;

use crate::bounded_channel::{BoundedReceiver, BoundedSender, bounded};
use crate::error::{Error, Result};
use crate::input::FileIdentity;

/// The file an action is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    pub path: PathBuf,
    /// Identity of the file when known
    pub identity: Option<FileIdentity>,
}

impl Context {
    pub fn new(path: impl Into<PathBuf>, identity: Option<FileIdentity>) -> Self {
        Self {
            path: path.into(),
            identity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Created,
    Deleted,
    TimedOut,
    /// A complete line, without its delimiter
    Line(Vec<u8>),
    /// Raw bytes from a chunked read
    Chunk(Vec<u8>),
    Eof,
    /// A read was interrupted; it is retried on the next event
    Error(String),
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Created => "created",
            Action::Deleted => "deleted",
            Action::TimedOut => "timed_out",
            Action::Line(_) => "line",
            Action::Chunk(_) => "chunk",
            Action::Eof => "eof",
            Action::Error(_) => "error",
        }
    }

    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Action::Line(data) | Action::Chunk(data) => Some(data),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub trait Listener {
    fn accept(&mut self, ctx: &Context, action: Action);
}

pub trait Observer: Send + Sync {
    type Listener: Listener;

    fn channel_for(&self, ctx: &Context) -> Self::Listener;
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

#[derive(Debug, Clone, Copy, Default)]
pub struct NullListener;

impl Listener for NullListener {
    fn accept(&mut self, _ctx: &Context, _action: Action) {}
}

impl Observer for NullObserver {
    type Listener = NullListener;

    fn channel_for(&self, _ctx: &Context) -> NullListener {
        NullListener
    }
}

/// An action together with the file it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedEvent {
    pub context: Context,
    pub action: Action,
}

/// Forwards every action into a bounded queue.
///
/// A full queue blocks the reader until the consumer catches up.
#[derive(Clone)]
pub struct ChannelObserver {
    tx: BoundedSender<ObservedEvent>,
}

impl ChannelObserver {
    pub fn new(tx: BoundedSender<ObservedEvent>) -> Self {
        Self { tx }
    }

    /// Observer plus the receiving end of a queue holding at most `capacity` events.
    pub fn with_capacity(capacity: usize) -> (Self, BoundedReceiver<ObservedEvent>) {
        let (tx, rx) = bounded(capacity);
        (Self::new(tx), rx)
    }

    fn send(&self, event: ObservedEvent) -> Result<()> {
        self.tx.send_blocking(event).map_err(|_| Error::ChannelSend)
    }
}

impl Observer for ChannelObserver {
    type Listener = ChannelObserver;

    fn channel_for(&self, _ctx: &Context) -> ChannelObserver {
        self.clone()
    }
}

impl Listener for ChannelObserver {
    fn accept(&mut self, ctx: &Context, action: Action) {
        let name = action.name();
        let event = ObservedEvent {
            context: ctx.clone(),
            action,
        };
        if let Err(e) = self.send(event) {
            debug!(path = ?ctx.path, action = name, error = %e, "Dropping event, consumer is gone");
        }
    }
}
