// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! On-disk persistence round-trips through the public API, exercising the
//! file-backed path (`FileOpenMode`, `std::fs::File` storage) that the unit
//! tests cover only through `Cursor<Vec<u8>>`.

use sackdb::btree::{BTree, BytesCodec, SackProvider};
use sackdb::sack::{FileOpenMode, Sack};

fn key(i: u32) -> Vec<u8> {
    format!("{:06}", i).into_bytes()
}

fn value(i: u32) -> Vec<u8> {
    i.to_string().into_bytes()
}

#[test]
fn bulk_insert_flush_reopen_from_a_real_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.sackdb");

    {
        let sack = Sack::open_file(&path, FileOpenMode::New, Some(24)).unwrap();
        let provider = SackProvider::<_, BytesCodec>::create(sack, 0, 64, false).unwrap();
        let mut tree = BTree::new(provider).unwrap();

        for i in 0..1000u32 {
            tree.put(key(i), value(i)).unwrap();
        }
        tree.flush().unwrap();
    }

    let sack = Sack::open_file(&path, FileOpenMode::Write, None).unwrap();
    let provider = SackProvider::<_, BytesCodec>::open(sack, 0).unwrap();
    let mut tree = BTree::new(provider).unwrap();

    assert_eq!(tree.len(), 1000);
    for i in 0..1000u32 {
        assert_eq!(tree.get(&key(i)).unwrap(), value(i));
    }
    let got: Vec<_> = tree
        .range(None, None)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let expected: Vec<_> = (0..1000).map(|i| (key(i), value(i))).collect();
    assert_eq!(got, expected);
}

#[test]
fn deletes_persist_across_a_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.sackdb");

    {
        let sack = Sack::open_file(&path, FileOpenMode::New, Some(20)).unwrap();
        let provider = SackProvider::<_, BytesCodec>::create(sack, 0, 16, false).unwrap();
        let mut tree = BTree::new(provider).unwrap();
        for i in 0..200u32 {
            tree.put(key(i), value(i)).unwrap();
        }
        for i in 0..100u32 {
            tree.pop(&key(i)).unwrap();
        }
        tree.flush().unwrap();
    }

    let sack = Sack::open_file(&path, FileOpenMode::Write, None).unwrap();
    let provider = SackProvider::<_, BytesCodec>::open(sack, 0).unwrap();
    let mut tree = BTree::new(provider).unwrap();

    assert_eq!(tree.len(), 100);
    for i in 0..100u32 {
        assert!(tree.get(&key(i)).is_err());
    }
    for i in 100..200u32 {
        assert_eq!(tree.get(&key(i)).unwrap(), value(i));
    }
}

#[test]
fn read_only_reopen_rejects_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.sackdb");

    {
        let sack = Sack::open_file(&path, FileOpenMode::New, Some(18)).unwrap();
        let provider = SackProvider::<_, BytesCodec>::create(sack, 0, 8, false).unwrap();
        let mut tree = BTree::new(provider).unwrap();
        tree.put(b"k".to_vec(), b"v".to_vec()).unwrap();
        tree.flush().unwrap();
    }

    let sack = Sack::open_file(&path, FileOpenMode::Read, None).unwrap();
    let provider = SackProvider::<_, BytesCodec>::open(sack, 0).unwrap();
    let mut tree = BTree::new(provider).unwrap();
    assert_eq!(tree.get(b"k").unwrap(), b"v");

    let err = tree.put(b"other".to_vec(), b"value".to_vec());
    assert!(err.is_err());
}

#[test]
fn multiple_trees_in_distinct_cells_stay_independent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.sackdb");

    let sack = Sack::open_file(&path, FileOpenMode::New, Some(22)).unwrap();
    let mut tree_a = BTree::new(SackProvider::<_, BytesCodec>::create(sack, 0, 8, false).unwrap()).unwrap();
    tree_a.put(b"a-key".to_vec(), b"a-value".to_vec()).unwrap();
    tree_a.flush().unwrap();

    let sack = tree_a.into_provider().into_sack();
    let mut tree_b = BTree::new(SackProvider::<_, BytesCodec>::create(sack, 1, 8, false).unwrap()).unwrap();
    tree_b.put(b"b-key".to_vec(), b"b-value".to_vec()).unwrap();
    tree_b.flush().unwrap();

    let sack = tree_b.into_provider().into_sack();
    let storage = sack.into_storage();

    let reopened_sack = Sack::open(storage, sackdb::sack::OpenMode::ReadWrite).unwrap();
    let mut reopened_a = BTree::new(SackProvider::<_, BytesCodec>::open(reopened_sack, 0).unwrap()).unwrap();
    assert_eq!(reopened_a.get(b"a-key").unwrap(), b"a-value");
    assert!(reopened_a.get(b"b-key").is_err());

    let sack = reopened_a.into_provider().into_sack();
    let mut reopened_b = BTree::new(SackProvider::<_, BytesCodec>::open(sack, 1).unwrap()).unwrap();
    assert_eq!(reopened_b.get(b"b-key").unwrap(), b"b-value");
}
