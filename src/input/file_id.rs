// SPDX-License-Identifier: Apache-2.0

//! Platform-neutral file identity.
//!
//! On Unix this is the inode number plus the device major/minor numbers. On Windows it is
//! the file index with zero-filled secondaries. The identity survives renames and process
//! restarts, and changes when a path is reused by a different underlying file.

use std::fs::{File, Metadata};
use std::io;
use std::path::Path;

/// An opaque, comparable identity for the file behind a path.
///
/// Only ever compared or used as a checkpoint key, never to reach the file itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileIdentity {
    /// Inode number (Unix) or file index (Windows)
    ino: u64,
    /// Device major number (Unix), zero on Windows
    dev_major: u64,
    /// Device minor number (Unix), zero on Windows
    dev_minor: u64,
}

impl FileIdentity {
    /// Create an identity from raw parts. Used when loading checkpoints.
    pub fn new(ino: u64, dev_major: u64, dev_minor: u64) -> Self {
        Self {
            ino,
            dev_major,
            dev_minor,
        }
    }

    /// Derive the identity of `path` from stat data already obtained for it.
    #[cfg(unix)]
    pub fn from_metadata(_path: &Path, metadata: &Metadata) -> io::Result<Self> {
        use std::os::unix::fs::MetadataExt;

        let (dev_major, dev_minor) = split_dev(metadata.dev());
        Ok(Self {
            ino: metadata.ino(),
            dev_major,
            dev_minor,
        })
    }

    /// Derive the identity of `path` from stat data already obtained for it.
    ///
    /// Windows stat data carries no file index, so the file is opened to look it up.
    #[cfg(windows)]
    pub fn from_metadata(path: &Path, _metadata: &Metadata) -> io::Result<Self> {
        let file = File::open(path)?;
        Self::from_file(&file)
    }

    /// Identity of an open file handle.
    #[cfg(unix)]
    pub fn from_file(file: &File) -> io::Result<Self> {
        let metadata = file.metadata()?;
        Self::from_metadata(Path::new(""), &metadata)
    }

    /// Identity of an open file handle.
    #[cfg(windows)]
    pub fn from_file(file: &File) -> io::Result<Self> {
        use std::os::windows::io::AsRawHandle;
        use windows_sys::Win32::Foundation::HANDLE;
        use windows_sys::Win32::Storage::FileSystem::{
            BY_HANDLE_FILE_INFORMATION, GetFileInformationByHandle,
        };

        let handle = file.as_raw_handle() as HANDLE;
        let mut info: BY_HANDLE_FILE_INFORMATION = unsafe { std::mem::zeroed() };

        let result = unsafe { GetFileInformationByHandle(handle, &mut info) };
        if result == 0 {
            return Err(io::Error::last_os_error());
        }

        let file_index = ((info.nFileIndexHigh as u64) << 32) | (info.nFileIndexLow as u64);
        Ok(Self::new(file_index, 0, 0))
    }

    /// Stat `path` and derive its identity.
    pub fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path)?;
        Self::from_metadata(path, &metadata)
    }

    /// Inode number (Unix) or file index (Windows).
    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn dev_major(&self) -> u64 {
        self.dev_major
    }

    pub fn dev_minor(&self) -> u64 {
        self.dev_minor
    }
}

impl std::fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.ino, self.dev_major, self.dev_minor)
    }
}

/// Split a raw `st_dev` into (major, minor) using the glibc encoding.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn split_dev(dev: u64) -> (u64, u64) {
    let major = ((dev >> 32) & 0xffff_f000) | ((dev >> 8) & 0x0000_0fff);
    let minor = ((dev >> 12) & 0xffff_ff00) | (dev & 0x0000_00ff);
    (major, minor)
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn split_dev(dev: u64) -> (u64, u64) {
    ((dev >> 24) & 0xff, dev & 0x00ff_ffff)
}

#[cfg(all(
    unix,
    not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios"
    ))
))]
fn split_dev(dev: u64) -> (u64, u64) {
    (dev, 0)
}
