//! Basic storage adapter operation tests against a real redb file on disk.

use crdtsync_core::persistence::StorageAdapter;
use crdtsync_persistence_redb::RedbStorageAdapter;
use tempfile::TempDir;

fn open_adapter() -> (RedbStorageAdapter, TempDir) {
    let dir = TempDir::new().expect("failed to create temp directory");
    let adapter = RedbStorageAdapter::open(dir.path().join("crdt.redb")).expect("failed to open adapter");
    (adapter, dir)
}

#[tokio::test]
async fn store_and_replay_updates() {
    let (adapter, _dir) = open_adapter();

    adapter.doc_append_update("notes:doc1", vec![0x01, 0x02, 0x03]).await.expect("append failed");

    let updates = adapter.doc_updates("notes:doc1").await.expect("read failed");
    assert_eq!(updates, vec![vec![0x01, 0x02, 0x03]]);
}

#[tokio::test]
async fn empty_document_has_no_updates() {
    let (adapter, _dir) = open_adapter();

    let updates = adapter.doc_updates("notes:missing").await.expect("read failed");
    assert!(updates.is_empty());
}

#[tokio::test]
async fn updates_replay_in_append_order() {
    let (adapter, _dir) = open_adapter();

    for i in 1..=5u8 {
        adapter.doc_append_update("notes:doc2", vec![i]).await.expect("append failed");
    }

    let updates = adapter.doc_updates("notes:doc2").await.expect("read failed");
    assert_eq!(updates, vec![vec![1], vec![2], vec![3], vec![4], vec![5]]);
}

#[tokio::test]
async fn kv_namespace_is_independent_of_the_update_log() {
    let (adapter, _dir) = open_adapter();

    adapter.kv_set("cursor:notes", "17".to_string()).await.expect("set failed");
    adapter.doc_append_update("notes:doc1", vec![0xff]).await.expect("append failed");

    assert_eq!(adapter.kv_get("cursor:notes").await.expect("get failed"), Some("17".to_string()));
    assert_eq!(adapter.doc_updates("notes:doc1").await.expect("read failed").len(), 1);
}

#[tokio::test]
async fn delete_document_clears_its_log_and_stats() {
    let (adapter, _dir) = open_adapter();

    adapter.doc_append_update("notes:doc4", vec![0xaa]).await.expect("append failed");
    assert_eq!(adapter.doc_updates("notes:doc4").await.expect("read failed").len(), 1);

    adapter.doc_delete("notes:doc4").await.expect("delete failed");

    assert!(adapter.doc_updates("notes:doc4").await.expect("read failed").is_empty());
    assert_eq!(adapter.doc_stats("notes:doc4").await.expect("stats failed").update_count, 0);
}

#[tokio::test]
async fn per_document_isolation_within_one_collection_file() {
    let (adapter, _dir) = open_adapter();

    adapter.doc_append_update("notes:doc-a", vec![0x11]).await.expect("append failed");
    adapter.doc_append_update("notes:doc-b", vec![0x22]).await.expect("append failed");

    assert_eq!(adapter.doc_updates("notes:doc-a").await.expect("read failed"), vec![vec![0x11]]);
    assert_eq!(adapter.doc_updates("notes:doc-b").await.expect("read failed"), vec![vec![0x22]]);
}

#[tokio::test]
async fn state_survives_reopening_the_database_file() {
    let dir = TempDir::new().expect("failed to create temp directory");
    let path = dir.path().join("crdt.redb");

    {
        let adapter = RedbStorageAdapter::open(&path).expect("failed to open adapter");
        adapter.doc_append_update("notes:doc1", vec![0x01]).await.expect("append failed");
        adapter.kv_set("cursor:notes", "1".to_string()).await.expect("set failed");
    }

    let adapter = RedbStorageAdapter::open(&path).expect("failed to reopen adapter");
    assert_eq!(adapter.doc_updates("notes:doc1").await.expect("read failed"), vec![vec![0x01]]);
    assert_eq!(adapter.kv_get("cursor:notes").await.expect("get failed"), Some("1".to_string()));
}

// vim: ts=4
