mod common;

use std::collections::BTreeSet;
use std::fs;

use hoard::{
    Backend, Checkout, CheckoutOptions, Error, HashAlgorithm, Index, LinkCache, LinkType, ObjectDb, State,
    Tree, TreeEntry, TransferOptions, transfer,
};
use tempfile::tempdir;

use common::{faulty_odb, memory_odb, sha256};

fn options(index: &Index) -> TransferOptions<'_> {
    TransferOptions {
        jobs: 4,
        verify: true,
        index: Some(index),
        ..Default::default()
    }
}

/// a store holding H1 = "hello" under a tree HT = { a.txt -> H1 }
fn hello_tree(odb: &ObjectDb) -> (hoard::HashInfo, hoard::HashInfo) {
    let h1 = odb.add_content(b"hello").unwrap();
    let ht = Tree::new(vec![TreeEntry::new("a.txt", h1.clone(), None)])
        .unwrap()
        .save(odb)
        .unwrap();
    (h1, ht)
}

#[test]
fn test_transfer_single_directory() {
    let (_, src) = memory_odb();
    let (_, dest) = memory_odb();
    let (h1, ht) = hello_tree(&src);
    let index = Index::in_memory();

    let copied = transfer(&src, &dest, &BTreeSet::from([ht.clone()]), &options(&index)).unwrap();

    assert_eq!(copied, 2);
    assert!(dest.exists(&h1));
    assert!(dest.exists(&ht));
    assert_eq!(index.get(&ht).unwrap(), BTreeSet::from([h1.value.clone()]));
}

#[test]
fn test_failed_file_withholds_directory() {
    let (_, src) = memory_odb();
    let (dest_backend, dest) = faulty_odb();
    let (h1, ht) = hello_tree(&src);
    dest_backend.fail_writes_to(dest.location(&h1));

    let index = Index::in_memory();
    let unrelated = sha256(b"unrelated");
    index.update(&unrelated, [&h1]).unwrap();

    let err = transfer(&src, &dest, &BTreeSet::from([ht.clone()]), &options(&index)).unwrap_err();

    match err {
        Error::Transfer { failed, hashes } => {
            // one file plus the withheld directory
            assert_eq!(failed, 2);
            assert!(hashes.contains(&h1));
            assert!(hashes.contains(&ht));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(!dest.exists(&h1));
    assert!(!dest.exists(&ht));
    assert_eq!(index.len(), 1);
    assert!(!index.contains(&ht));
    // the manifest was never even attempted
    assert!(!dest_backend.writes().contains(&dest.location(&ht)));
}

#[test]
fn test_checkout_falls_back_to_hardlink() {
    use std::os::unix::fs::MetadataExt;

    let dir = tempdir().unwrap();
    let odb = ObjectDb::local(dir.path().join("cache"), HashAlgorithm::Sha256).unwrap();
    let (h1, ht) = hello_tree(&odb);
    let state = State::open(dir.path().join("state.cbor")).unwrap();
    let dest = dir.path().join("work");

    let mut links = LinkCache::new();
    links.disable(LinkType::Reflink);
    let stats = Checkout::new(&odb, &state, CheckoutOptions::default())
        .with_link_cache(links)
        .checkout(&dest, &ht)
        .unwrap();

    assert_eq!(stats.hardlinked, 1);
    assert_eq!(stats.reflinked, 0);
    let target = dest.join("a.txt");
    assert_eq!(fs::read(&target).unwrap(), b"hello");
    assert_eq!(
        fs::metadata(&target).unwrap().ino(),
        fs::metadata(odb.local_path(&h1).unwrap()).unwrap().ino()
    );

    // state survives a reopen and still matches the file on disk
    drop(state);
    let state = State::open(dir.path().join("state.cbor")).unwrap();
    assert_eq!(state.get(&target), Some(h1));
}

#[test]
fn test_shared_file_copied_once() {
    let (_, src) = memory_odb();
    let (dest_backend, dest) = faulty_odb();

    let h2 = src.add_content(b"shared").unwrap();
    let a = src.add_content(b"only in d1").unwrap();
    let b = src.add_content(b"only in d2").unwrap();
    let d1 = Tree::new(vec![
        TreeEntry::new("x", h2.clone(), None),
        TreeEntry::new("y", a.clone(), None),
    ])
    .unwrap()
    .save(&src)
    .unwrap();
    let d2 = Tree::new(vec![
        TreeEntry::new("z", h2.clone(), None),
        TreeEntry::new("w", b.clone(), None),
    ])
    .unwrap()
    .save(&src)
    .unwrap();

    let index = Index::in_memory();
    let copied = transfer(&src, &dest, &BTreeSet::from([d1.clone(), d2.clone()]), &options(&index)).unwrap();

    assert_eq!(copied, 5);
    let h2_writes = dest_backend
        .writes()
        .iter()
        .filter(|l| **l == dest.location(&h2))
        .count();
    assert_eq!(h2_writes, 1);
    assert!(index.get(&d1).unwrap().contains(&h2.value));
    assert!(index.get(&d2).unwrap().contains(&h2.value));
}

#[test]
fn test_shared_file_failure_withholds_both_directories() {
    let (_, src) = memory_odb();
    let (dest_backend, dest) = faulty_odb();

    let h2 = src.add_content(b"shared").unwrap();
    let a = src.add_content(b"a").unwrap();
    let b = src.add_content(b"b").unwrap();
    let d1 = Tree::new(vec![
        TreeEntry::new("shared", h2.clone(), None),
        TreeEntry::new("a", a.clone(), None),
    ])
    .unwrap()
    .save(&src)
    .unwrap();
    let d2 = Tree::new(vec![
        TreeEntry::new("shared", h2.clone(), None),
        TreeEntry::new("b", b.clone(), None),
    ])
    .unwrap()
    .save(&src)
    .unwrap();
    dest_backend.fail_writes_to(dest.location(&h2));

    let index = Index::in_memory();
    let err = transfer(&src, &dest, &BTreeSet::from([d1.clone(), d2.clone()]), &options(&index)).unwrap_err();

    // the first directory pays for the file and itself, the second for itself
    assert!(matches!(err, Error::Transfer { failed: 3, .. }));
    assert!(!dest.exists(&d1));
    assert!(!dest.exists(&d2));
    assert!(dest.exists(&a));
    assert!(dest.exists(&b));
    assert!(index.is_empty());
}

#[test]
fn test_exhaustion_aborts_transfer() {
    let (_, src) = memory_odb();
    let (dest_backend, dest) = faulty_odb();
    let (h1, ht) = hello_tree(&src);
    dest_backend.exhaust_at(dest.location(&h1));

    let index = Index::in_memory();
    let err = transfer(&src, &dest, &BTreeSet::from([ht.clone()]), &options(&index)).unwrap_err();

    assert!(err.is_fatal());
    assert!(!dest.exists(&ht));
    assert!(index.is_empty());
    assert_eq!(index.staged(), 0);
}

#[test]
fn test_checkout_reports_missing_objects() {
    let dir = tempdir().unwrap();
    let (backend, odb) = memory_odb();
    let (h1, ht) = hello_tree(&odb);
    backend.remove(&odb.location(&h1)).unwrap();

    let state = State::in_memory();
    let err = Checkout::new(&odb, &state, CheckoutOptions::default())
        .checkout(dir.path(), &ht)
        .unwrap_err();
    assert!(matches!(err, Error::Checkout { failed: 1, .. }));
    assert!(state.is_empty());
}
