// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Directory-backed store used by the service binary.
//!
//! Identifiers must decode to plain UTF-8 file names: no separators, no
//! parent references, no NUL. Anything else is rejected before touching the
//! filesystem, so a peer cannot escape the configured root.

use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::PathBuf,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::fs::{FileHandle, FileStore, FsError, OpenMode};

pub struct DirStore {
    root: PathBuf,
    open: Mutex<HashMap<FileHandle, Mutex<File>>>,
    next_handle: AtomicU64,
}

impl DirStore {
    /// Create the root directory if needed and return the store.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, FsError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            open: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(0),
        })
    }

    fn path_for(&self, file_id: &[u8]) -> Result<PathBuf, FsError> {
        let name = std::str::from_utf8(file_id).map_err(|_| FsError::InvalidId("not UTF-8"))?;
        if name.is_empty() {
            return Err(FsError::InvalidId("empty name"));
        }
        if name.contains(['/', '\\', '\0']) || name == "." || name == ".." {
            return Err(FsError::InvalidId("path component not allowed"));
        }
        Ok(self.root.join(name))
    }

    fn with_file<T>(
        &self,
        handle: FileHandle,
        op: impl FnOnce(&mut File) -> std::io::Result<T>,
    ) -> Result<T, FsError> {
        let open = self.open.lock().expect("handle map poisoned");
        let file = open.get(&handle).ok_or(FsError::BadHandle)?;
        let mut file = file.lock().expect("file poisoned");
        Ok(op(&mut file)?)
    }
}

impl FileStore for DirStore {
    fn open(&self, file_id: &[u8], mode: OpenMode) -> Result<FileHandle, FsError> {
        let path = self.path_for(file_id)?;
        let file = match mode {
            OpenMode::Read => File::open(&path).map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    FsError::NotFound
                } else {
                    FsError::Io(e)
                }
            })?,
            OpenMode::Write => OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?,
        };

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.open
            .lock()
            .expect("handle map poisoned")
            .insert(handle, Mutex::new(file));
        Ok(handle)
    }

    fn close(&self, handle: FileHandle) {
        self.open.lock().expect("handle map poisoned").remove(&handle);
    }

    fn read(&self, handle: FileHandle, offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        self.with_file(handle, |file| {
            file.seek(SeekFrom::Start(offset))?;
            let mut n = 0;
            while n < buf.len() {
                let r = file.read(&mut buf[n..])?;
                if r == 0 {
                    break;
                }
                n += r;
            }
            Ok(n)
        })
    }

    fn write(&self, handle: FileHandle, offset: u64, data: &[u8]) -> Result<usize, FsError> {
        self.with_file(handle, |file| {
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(data)?;
            Ok(data.len())
        })
    }
}
