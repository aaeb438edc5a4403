// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! In-memory store, used by tests and embedders that bring their own
//! persistence. Accepts any identifier, including the empty one.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::fs::{FileHandle, FileStore, FsError, OpenMode};

type Contents = Arc<RwLock<Vec<u8>>>;

#[derive(Default)]
pub struct MemStore {
    files: Mutex<HashMap<Vec<u8>, Contents>>,
    open: Mutex<HashMap<FileHandle, Contents>>,
    next_handle: AtomicU64,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a file, replacing any previous contents.
    pub fn insert(&self, file_id: impl Into<Vec<u8>>, contents: impl Into<Vec<u8>>) {
        self.files
            .lock()
            .expect("file map poisoned")
            .insert(file_id.into(), Arc::new(RwLock::new(contents.into())));
    }

    /// Snapshot a file's contents, if it exists.
    pub fn contents(&self, file_id: &[u8]) -> Option<Vec<u8>> {
        let files = self.files.lock().expect("file map poisoned");
        let entry = files.get(file_id)?;
        Some(entry.read().expect("file contents poisoned").clone())
    }
}

impl FileStore for MemStore {
    fn open(&self, file_id: &[u8], mode: OpenMode) -> Result<FileHandle, FsError> {
        let contents = {
            let mut files = self.files.lock().expect("file map poisoned");
            match mode {
                OpenMode::Read => Arc::clone(files.get(file_id).ok_or(FsError::NotFound)?),
                OpenMode::Write => {
                    let entry = files.entry(file_id.to_vec()).or_default();
                    entry.write().expect("file contents poisoned").clear();
                    Arc::clone(entry)
                },
            }
        };

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.open
            .lock()
            .expect("handle map poisoned")
            .insert(handle, contents);
        Ok(handle)
    }

    fn close(&self, handle: FileHandle) {
        self.open.lock().expect("handle map poisoned").remove(&handle);
    }

    fn read(&self, handle: FileHandle, offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        let contents = {
            let open = self.open.lock().expect("handle map poisoned");
            Arc::clone(open.get(&handle).ok_or(FsError::BadHandle)?)
        };
        let data = contents.read().expect("file contents poisoned");

        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = (data.len() - offset).min(buf.len());
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write(&self, handle: FileHandle, offset: u64, data: &[u8]) -> Result<usize, FsError> {
        let contents = {
            let open = self.open.lock().expect("handle map poisoned");
            Arc::clone(open.get(&handle).ok_or(FsError::BadHandle)?)
        };
        let mut file = contents.write().expect("file contents poisoned");

        let offset = offset as usize;
        let end = offset + data.len();
        if file.len() < end {
            file.resize(end, 0);
        }
        file[offset..end].copy_from_slice(data);
        Ok(data.len())
    }
}
