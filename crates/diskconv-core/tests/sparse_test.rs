//! Integration tests for sparse copying into real files.

mod common;

use common::pattern;
use diskconv_core::{copy_sparse, make_sparse, Error};
use std::fs::{File, OpenOptions};
use std::io::Cursor;
use tempfile::TempDir;

#[test]
fn test_copy_sparse_into_presized_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("out.img");
    let block = 4096;

    // data, hole, data, hole, partial tail
    let mut data = pattern(block, 1);
    data.extend(vec![0u8; block]);
    data.extend(pattern(block, 2));
    data.extend(vec![0u8; 3 * block]);
    data.extend(pattern(100, 3));

    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(true)
        .open(&path)
        .unwrap();
    make_sparse(&mut file, data.len() as u64).unwrap();

    let copied = copy_sparse(&file, &mut Cursor::new(&data), block).unwrap();
    assert_eq!(copied, data.len() as u64);
    drop(file);

    assert_eq!(std::fs::read(&path).unwrap(), data);
}

#[test]
fn test_copy_sparse_leaves_existing_bytes_in_zero_blocks() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("out.img");
    std::fs::write(&path, vec![0xAAu8; 1024]).unwrap();

    let file = OpenOptions::new().write(true).open(&path).unwrap();
    let mut src = vec![0u8; 1024];
    src[512..].copy_from_slice(&pattern(512, 4));
    copy_sparse(&file, &mut Cursor::new(&src), 512).unwrap();
    drop(file);

    // Zero blocks are skipped, so the destination must start out zeroed.
    let out = std::fs::read(&path).unwrap();
    assert!(out[..512].iter().all(|&b| b == 0xAA));
    assert_eq!(&out[512..], &src[512..]);
}

#[test]
fn test_copy_sparse_to_read_only_file_fails() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("out.img");
    std::fs::write(&path, vec![0u8; 1024]).unwrap();

    let file = File::open(&path).unwrap();
    let err = copy_sparse(&file, &mut Cursor::new(pattern(1024, 5)), 256).unwrap_err();

    assert!(matches!(err, Error::SparseCopy { block_size: 256, .. }));
    assert_eq!(err.copied_bytes(), Some(0));
    assert!(err.to_string().contains("sparse copy failed"));
}

#[test]
fn test_make_sparse_sets_length() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sparse.img");
    let mut file = File::create(&path).unwrap();

    make_sparse(&mut file, 64 * 1024 * 1024).unwrap();
    drop(file);

    let metadata = std::fs::metadata(&path).unwrap();
    assert_eq!(metadata.len(), 64 * 1024 * 1024);
    let data = std::fs::read(&path).unwrap();
    assert!(data.iter().all(|&b| b == 0));
}
