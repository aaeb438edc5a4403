// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Backing-store contract consumed by transfer sessions.
//!
//! File identifiers are opaque byte strings; only the store gives them
//! meaning. Reads and writes are positional, so the store keeps no cursor.
//! Stores are invoked concurrently from independent sessions and must be
//! re-entrant; the engine never serializes store access.

pub mod local;
pub mod memory;

use std::{fmt, sync::Arc};

use thiserror::Error;

/// Opaque token naming an open file inside its store.
pub type FileHandle = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such file")]
    NotFound,
    #[error("invalid file id: {0}")]
    InvalidId(&'static str),
    #[error("stale or unknown file handle")]
    BadHandle,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub trait FileStore: Send + Sync {
    /// Open a file by opaque id. `Write` mode creates or truncates.
    /// `NotFound` is distinguished from other failures so read sessions
    /// can report it to the peer.
    fn open(&self, file_id: &[u8], mode: OpenMode) -> Result<FileHandle, FsError>;

    /// Release a handle. Unknown handles are ignored.
    fn close(&self, handle: FileHandle);

    /// Read as many bytes as are available at `offset`, up to `buf.len()`.
    /// Returns 0 at end of file.
    fn read(&self, handle: FileHandle, offset: u64, buf: &mut [u8]) -> Result<usize, FsError>;

    /// Write all of `data` at `offset`, extending the file as needed.
    fn write(&self, handle: FileHandle, offset: u64, data: &[u8]) -> Result<usize, FsError>;
}

/// Scoped acquisition of a store handle.
///
/// Sessions fail along many paths (framing errors, timeouts, peer resets)
/// and the handle must be released on every one of them, exactly once.
/// Dropping the guard closes the handle unless [`ScopedFile::close`] already
/// did.
pub struct ScopedFile {
    store: Arc<dyn FileStore>,
    handle: FileHandle,
    closed: bool,
}

impl ScopedFile {
    pub fn open(
        store: Arc<dyn FileStore>,
        file_id: &[u8],
        mode: OpenMode,
    ) -> Result<Self, FsError> {
        let handle = store.open(file_id, mode)?;
        Ok(Self {
            store,
            handle,
            closed: false,
        })
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        self.store.read(self.handle, offset, buf)
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<usize, FsError> {
        self.store.write(self.handle, offset, data)
    }

    pub fn close(mut self) {
        self.close_once();
    }

    fn close_once(&mut self) {
        if !self.closed {
            self.closed = true;
            self.store.close(self.handle);
        }
    }
}

impl Drop for ScopedFile {
    fn drop(&mut self) {
        self.close_once();
    }
}

impl fmt::Debug for ScopedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedFile")
            .field("handle", &self.handle)
            .field("closed", &self.closed)
            .finish()
    }
}
