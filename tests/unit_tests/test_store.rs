// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::Result;
use cftp_rs::fs::{FileStore, FsError, OpenMode, ScopedFile, local::DirStore, memory::MemStore};

#[test]
fn test_mem_store_read_write() -> Result<()> {
    let store = MemStore::new();

    let handle = store.open(b"file", OpenMode::Write)?;
    assert_eq!(store.write(handle, 0, b"hello ")?, 6);
    assert_eq!(store.write(handle, 6, b"world")?, 5);
    store.close(handle);

    let handle = store.open(b"file", OpenMode::Read)?;
    let mut buf = [0u8; 64];
    let n = store.read(handle, 0, &mut buf)?;
    assert_eq!(&buf[..n], b"hello world");

    // Positional read from the middle, then past the end.
    let n = store.read(handle, 6, &mut buf)?;
    assert_eq!(&buf[..n], b"world");
    assert_eq!(store.read(handle, 11, &mut buf)?, 0);
    store.close(handle);

    assert_eq!(store.contents(b"file"), Some(b"hello world".to_vec()));
    Ok(())
}

#[test]
fn test_mem_store_not_found_and_truncate() -> Result<()> {
    let store = MemStore::new();
    assert!(matches!(
        store.open(b"missing", OpenMode::Read),
        Err(FsError::NotFound)
    ));

    store.insert(b"f".to_vec(), b"old contents".to_vec());
    let handle = store.open(b"f", OpenMode::Write)?;
    store.close(handle);
    assert_eq!(store.contents(b"f"), Some(Vec::new()));
    Ok(())
}

#[test]
fn test_mem_store_stale_handle() {
    let store = MemStore::new();
    store.insert(b"f".to_vec(), b"data".to_vec());

    let handle = store.open(b"f", OpenMode::Read).expect("open");
    store.close(handle);

    let mut buf = [0u8; 4];
    assert!(matches!(
        store.read(handle, 0, &mut buf),
        Err(FsError::BadHandle)
    ));
}

#[test]
fn test_scoped_file_closes_on_drop() -> Result<()> {
    let store = Arc::new(MemStore::new());

    {
        let file = ScopedFile::open(
            Arc::clone(&store) as Arc<dyn FileStore>,
            b"guarded",
            OpenMode::Write,
        )?;
        file.write(0, b"payload")?;
        // Dropped here without an explicit close.
    }

    assert_eq!(store.contents(b"guarded"), Some(b"payload".to_vec()));

    // The empty id is acceptable to this store.
    let file = ScopedFile::open(Arc::clone(&store) as Arc<dyn FileStore>, b"", OpenMode::Write)?;
    file.close();
    assert_eq!(store.contents(b""), Some(Vec::new()));
    Ok(())
}

#[test]
fn test_dir_store_roundtrip_and_id_validation() -> Result<()> {
    let root = std::env::temp_dir().join(format!("cftp-dir-store-{}", std::process::id()));
    let store = DirStore::new(&root)?;

    let handle = store.open(b"data.bin", OpenMode::Write)?;
    store.write(handle, 0, &[1, 2, 3, 4])?;
    store.write(handle, 4, &[5, 6])?;
    store.close(handle);

    let handle = store.open(b"data.bin", OpenMode::Read)?;
    let mut buf = [0u8; 16];
    let n = store.read(handle, 0, &mut buf)?;
    assert_eq!(&buf[..n], &[1, 2, 3, 4, 5, 6]);
    store.close(handle);

    assert!(matches!(
        store.open(b"missing.bin", OpenMode::Read),
        Err(FsError::NotFound)
    ));
    assert!(matches!(
        store.open(b"../escape", OpenMode::Write),
        Err(FsError::InvalidId(_))
    ));
    assert!(matches!(
        store.open(b"a/b", OpenMode::Write),
        Err(FsError::InvalidId(_))
    ));
    assert!(matches!(
        store.open(b"", OpenMode::Write),
        Err(FsError::InvalidId(_))
    ));
    assert!(matches!(
        store.open(&[0xFF, 0xFE], OpenMode::Write),
        Err(FsError::InvalidId(_))
    ));

    std::fs::remove_dir_all(&root)?;
    Ok(())
}
