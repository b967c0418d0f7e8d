// SPDX-License-Identifier: Apache-2.0

use std::fmt;

/// Lifecycle state of a tracked file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileState {
    /// Known, waiting for a free slot under the active cap
    Watched,
    /// Promoted, create event not yet handled
    Active,
    /// Create emitted, initial read in progress
    Reading,
    /// Growth observed, incremental read in progress
    ReadingMore,
    /// Handle released after being idle too long
    Closed,
    /// Backlog skipped because the file was too old at discovery
    Ignored,
    /// Terminal, removed from the tracked set at the end of the pass
    Unwatched,
}

impl FileState {
    /// Active and both reading sub-states count towards the cap and may hold a handle.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Active | Self::Reading | Self::ReadingMore)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Watched => "watched",
            Self::Active => "active",
            Self::Reading => "reading",
            Self::ReadingMore => "reading_more",
            Self::Closed => "closed",
            Self::Ignored => "ignored",
            Self::Unwatched => "unwatched",
        }
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a file was present at startup or appeared later. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discovery {
    Initial,
    Ongoing,
}

/// Events emitted by the engine's evaluation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchEvent {
    /// A file present when its pattern was first watched became active
    CreateInitial,
    /// A file that appeared later (or replaced a rotated one) became active
    Create,
    /// An active file grew
    Modify,
    /// An active file was removed, rotated away or truncated
    Delete,
    /// An active file stayed idle longer than `close_older`
    Timeout,
    /// An ignored file changed and is watched again
    Unignore,
}

impl WatchEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateInitial => "create_initial",
            Self::Create => "create",
            Self::Modify => "modify",
            Self::Delete => "delete",
            Self::Timeout => "timeout",
            Self::Unignore => "unignore",
        }
    }

    pub fn is_create(self) -> bool {
        matches!(self, Self::CreateInitial | Self::Create)
    }
}

impl fmt::Display for WatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
