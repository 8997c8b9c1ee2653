//! redb-based `StorageAdapter` for crdtsync-core.
//!
//! # Storage layout
//!
//! A single redb file backs the whole adapter (one adapter per
//! collection), with three tables:
//!
//! - `kv` — the flat KV namespace (`cursor:<collection>`, the session
//!   client id, ...), string values.
//! - `updates` — binary CRDT updates, keyed `"{name}\u{1}{seq:020}"` so a
//!   zero-padded decimal sequence number sorts lexicographically in
//!   append order. `name` is `"{collection}"` for the root document or
//!   `"{collection}:{document}"` for a sub-document. The separator is
//!   `\u{1}` rather than `:` because `name` itself contains `:` for
//!   sub-documents (`"notes:r1"`) — a `:`-joined key would make the root
//!   name's scan prefix (`"notes:"`) also match every sub-document's keys
//!   (`"notes:r1:...")`. `\u{1}` cannot appear in a collection or document
//!   id, so `"notes\u{1}"` can never be a prefix of `"notes:r1\u{1}..."`.
//! - `stats` — a running `{update_count, size_bytes}` per `name`, kept in
//!   lockstep with `updates` so `doc_stats` never has to rescan the log.
//!
//! Grounded on `crdt-adapter-redb/src/lib.rs`'s table-per-concern split
//! and its `doc_id:seq` update key, adapted to `StorageAdapter`'s flatter
//! `name`-keyed contract (no snapshot-write path exists in that trait, so
//! `doc_snapshot` always resolves to `None` here; a compacting snapshot
//! writer is a natural follow-up once the trait grows one).

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use crdtsync_core::persistence::{DocStats, StorageAdapter};
use crdtsync_types::error::{Error as CoreError, Result as CoreResult};
use dashmap::DashMap;
use redb::{ReadableDatabase, ReadableTable};
use serde::{Deserialize, Serialize};
use tracing::trace;

mod error;
pub use error::Error;

mod tables {
    use redb::TableDefinition;

    pub const TABLE_KV: TableDefinition<&str, &str> = TableDefinition::new("kv");
    pub const TABLE_UPDATES: TableDefinition<&str, &[u8]> = TableDefinition::new("updates");
    pub const TABLE_STATS: TableDefinition<&str, &str> = TableDefinition::new("stats");
}

use tables::*;

#[derive(Clone, Copy, Serialize, Deserialize, Default)]
struct StoredStats {
    update_count: u32,
    size_bytes: u64,
}

/// Separator between a document name and its zero-padded sequence number.
/// Chosen to be a byte that can never occur inside a collection or
/// document id (unlike `:`, which sub-document names already use), so a
/// root name's scan prefix can never match a sub-document's keys.
const NAME_SEQ_SEP: char = '\u{1}';

fn update_key(name: &str, seq: u64) -> String {
    format!("{name}{NAME_SEQ_SEP}{seq:020}")
}

fn update_prefix(name: &str) -> String {
    format!("{name}{NAME_SEQ_SEP}")
}

/// `StorageAdapter` backed by a single redb file.
pub struct RedbStorageAdapter {
    db: Arc<redb::Database>,
    /// Next sequence number to assign per document name, seeded lazily
    /// from the existing log on first append (spec.md §4.B "Replay
    /// protocol" assumes append order is preserved across restarts).
    counters: DashMap<String, AtomicU64>,
}

impl std::fmt::Debug for RedbStorageAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStorageAdapter").finish_non_exhaustive()
    }
}

impl RedbStorageAdapter {
    /// Opens (creating if absent) the redb file at `path` and ensures all
    /// tables exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let db = redb::Database::create(path.as_ref())
            .map_err(|e| Error::Io(format!("failed to open {}: {e}", path.as_ref().display())))?;
        {
            let tx = db.begin_write().map_err(|e| Error::Db(e.to_string()))?;
            let _ = tx.open_table(TABLE_KV);
            let _ = tx.open_table(TABLE_UPDATES);
            let _ = tx.open_table(TABLE_STATS);
            tx.commit().map_err(|e| Error::Db(e.to_string()))?;
        }
        Ok(RedbStorageAdapter { db: Arc::new(db), counters: DashMap::new() })
    }

    fn next_seq(&self, name: &str) -> Result<u64, Error> {
        if let Some(counter) = self.counters.get(name) {
            return Ok(counter.fetch_add(1, Ordering::SeqCst));
        }
        let existing = self.count_existing(name)?;
        let counter = self.counters.entry(name.to_string()).or_insert_with(|| AtomicU64::new(existing));
        Ok(counter.fetch_add(1, Ordering::SeqCst))
    }

    fn count_existing(&self, name: &str) -> Result<u64, Error> {
        let tx = self.db.begin_read().map_err(|e| Error::Db(e.to_string()))?;
        let table = tx.open_table(TABLE_UPDATES).map_err(|e| Error::Db(e.to_string()))?;
        let prefix = update_prefix(name);
        let mut count = 0u64;
        for item in table.range(prefix.as_str()..).map_err(|e| Error::Db(e.to_string()))? {
            let (key, _) = item.map_err(|e| Error::Db(e.to_string()))?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    fn read_stats(&self, name: &str) -> Result<StoredStats, Error> {
        let tx = self.db.begin_read().map_err(|e| Error::Db(e.to_string()))?;
        let table = tx.open_table(TABLE_STATS).map_err(|e| Error::Db(e.to_string()))?;
        match table.get(name).map_err(|e| Error::Db(e.to_string()))? {
            Some(value) => Ok(serde_json::from_str(value.value())?),
            None => Ok(StoredStats::default()),
        }
    }
}

#[async_trait]
impl StorageAdapter for RedbStorageAdapter {
    async fn kv_get(&self, key: &str) -> CoreResult<Option<String>> {
        let tx = self.db.begin_read().map_err(|e| Error::Db(e.to_string()))?;
        let table = tx.open_table(TABLE_KV).map_err(|e| Error::Db(e.to_string()))?;
        let value = table.get(key).map_err(|e| Error::Db(e.to_string()))?.map(|v| v.value().to_string());
        Ok(value)
    }

    async fn kv_set(&self, key: &str, value: String) -> CoreResult<()> {
        let tx = self.db.begin_write().map_err(|e| Error::Db(e.to_string()))?;
        {
            let mut table = tx.open_table(TABLE_KV).map_err(|e| Error::Db(e.to_string()))?;
            table.insert(key, value.as_str()).map_err(|e| Error::Db(e.to_string()))?;
        }
        tx.commit().map_err(|e| Error::Db(e.to_string()))?;
        Ok(())
    }

    async fn kv_del(&self, key: &str) -> CoreResult<()> {
        let tx = self.db.begin_write().map_err(|e| Error::Db(e.to_string()))?;
        {
            let mut table = tx.open_table(TABLE_KV).map_err(|e| Error::Db(e.to_string()))?;
            table.remove(key).map_err(|e| Error::Db(e.to_string()))?;
        }
        tx.commit().map_err(|e| Error::Db(e.to_string()))?;
        Ok(())
    }

    async fn doc_snapshot(&self, _name: &str) -> CoreResult<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn doc_updates(&self, name: &str) -> CoreResult<Vec<Vec<u8>>> {
        let tx = self.db.begin_read().map_err(|e| Error::Db(e.to_string()))?;
        let table = tx.open_table(TABLE_UPDATES).map_err(|e| Error::Db(e.to_string()))?;
        let prefix = update_prefix(name);
        let mut updates = Vec::new();
        for item in table.range(prefix.as_str()..).map_err(|e| Error::Db(e.to_string()))? {
            let (key, value) = item.map_err(|e| Error::Db(e.to_string()))?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            updates.push(value.value().to_vec());
        }
        trace!(document = name, count = updates.len(), "replayed updates from redb");
        Ok(updates)
    }

    async fn doc_append_update(&self, name: &str, bytes: Vec<u8>) -> CoreResult<()> {
        let seq = self.next_seq(name).map_err(CoreError::from)?;
        let mut stats = self.read_stats(name).map_err(CoreError::from)?;
        stats.update_count += 1;
        stats.size_bytes += bytes.len() as u64;
        let stats_json = serde_json::to_string(&stats).map_err(Error::from).map_err(CoreError::from)?;

        let tx = self.db.begin_write().map_err(|e| Error::Db(e.to_string()))?;
        {
            let mut updates = tx.open_table(TABLE_UPDATES).map_err(|e| Error::Db(e.to_string()))?;
            let key = update_key(name, seq);
            updates.insert(key.as_str(), bytes.as_slice()).map_err(|e| Error::Db(e.to_string()))?;

            let mut stats_table = tx.open_table(TABLE_STATS).map_err(|e| Error::Db(e.to_string()))?;
            stats_table.insert(name, stats_json.as_str()).map_err(|e| Error::Db(e.to_string()))?;
        }
        tx.commit().map_err(|e| Error::Db(e.to_string()))?;
        Ok(())
    }

    async fn doc_delete(&self, name: &str) -> CoreResult<()> {
        let tx = self.db.begin_write().map_err(|e| Error::Db(e.to_string()))?;
        {
            let mut updates = tx.open_table(TABLE_UPDATES).map_err(|e| Error::Db(e.to_string()))?;
            let prefix = update_prefix(name);
            let mut keys_to_delete = Vec::new();
            for item in updates.range(prefix.as_str()..).map_err(|e| Error::Db(e.to_string()))? {
                let (key, _) = item.map_err(|e| Error::Db(e.to_string()))?;
                if !key.value().starts_with(&prefix) {
                    break;
                }
                keys_to_delete.push(key.value().to_string());
            }
            for key in keys_to_delete {
                updates.remove(key.as_str()).map_err(|e| Error::Db(e.to_string()))?;
            }

            let mut stats_table = tx.open_table(TABLE_STATS).map_err(|e| Error::Db(e.to_string()))?;
            stats_table.remove(name).map_err(|e| Error::Db(e.to_string()))?;
        }
        tx.commit().map_err(|e| Error::Db(e.to_string()))?;
        self.counters.remove(name);
        Ok(())
    }

    async fn doc_stats(&self, name: &str) -> CoreResult<DocStats> {
        let stats = self.read_stats(name).map_err(CoreError::from)?;
        Ok(DocStats { update_count: stats.update_count, size_bytes: stats.size_bytes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> (RedbStorageAdapter, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let adapter = RedbStorageAdapter::open(dir.path().join("crdt.redb")).expect("open adapter");
        (adapter, dir)
    }

    #[tokio::test]
    async fn kv_roundtrips_and_deletes() {
        let (adapter, _dir) = adapter();
        assert_eq!(adapter.kv_get("cursor:notes").await.expect("get"), None);
        adapter.kv_set("cursor:notes", "42".into()).await.expect("set");
        assert_eq!(adapter.kv_get("cursor:notes").await.expect("get"), Some("42".to_string()));
        adapter.kv_del("cursor:notes").await.expect("del");
        assert_eq!(adapter.kv_get("cursor:notes").await.expect("get"), None);
    }

    #[tokio::test]
    async fn updates_preserve_append_order_past_lexical_rollover() {
        let (adapter, _dir) = adapter();
        for i in 0..15u8 {
            adapter.doc_append_update("notes:doc1", vec![i]).await.expect("append");
        }
        let updates = adapter.doc_updates("notes:doc1").await.expect("read back");
        let expected: Vec<Vec<u8>> = (0..15u8).map(|i| vec![i]).collect();
        assert_eq!(updates, expected);
    }

    #[tokio::test]
    async fn doc_delete_clears_log_and_stats_but_not_other_documents() {
        let (adapter, _dir) = adapter();
        adapter.doc_append_update("notes:doc1", vec![1, 2, 3]).await.expect("append");
        adapter.doc_append_update("notes:doc2", vec![9]).await.expect("append");

        adapter.doc_delete("notes:doc1").await.expect("delete");

        assert_eq!(adapter.doc_updates("notes:doc1").await.expect("read"), Vec::<Vec<u8>>::new());
        assert_eq!(adapter.doc_stats("notes:doc1").await.expect("stats").update_count, 0);
        assert_eq!(adapter.doc_updates("notes:doc2").await.expect("read"), vec![vec![9]]);
    }

    #[tokio::test]
    async fn doc_stats_tracks_count_and_size_without_rescanning() {
        let (adapter, _dir) = adapter();
        adapter.doc_append_update("notes:doc1", vec![1, 2, 3]).await.expect("append");
        adapter.doc_append_update("notes:doc1", vec![4, 5]).await.expect("append");
        let stats = adapter.doc_stats("notes:doc1").await.expect("stats");
        assert_eq!(stats.update_count, 2);
        assert_eq!(stats.size_bytes, 5);
    }

    #[tokio::test]
    async fn doc_snapshot_has_no_writer_and_always_resolves_to_none() {
        let (adapter, _dir) = adapter();
        adapter.doc_append_update("notes:doc1", vec![1]).await.expect("append");
        assert_eq!(adapter.doc_snapshot("notes:doc1").await.expect("snapshot"), None);
    }

    #[tokio::test]
    async fn root_document_log_is_isolated_from_same_collection_subdocuments() {
        let (adapter, _dir) = adapter();
        // "notes" is the root document name; "notes:r1" is a sub-document
        // of the same collection. A root scan must never pick up the
        // sub-document's updates (or vice versa).
        adapter.doc_append_update("notes", vec![0xaa]).await.expect("append");
        adapter.doc_append_update("notes:r1", vec![0xbb]).await.expect("append");
        adapter.doc_append_update("notes:r1", vec![0xcc]).await.expect("append");

        assert_eq!(adapter.doc_updates("notes").await.expect("read"), vec![vec![0xaa]]);
        assert_eq!(adapter.doc_updates("notes:r1").await.expect("read"), vec![vec![0xbb], vec![0xcc]]);

        adapter.doc_delete("notes").await.expect("delete");
        assert_eq!(adapter.doc_updates("notes").await.expect("read"), Vec::<Vec<u8>>::new());
        assert_eq!(adapter.doc_updates("notes:r1").await.expect("read"), vec![vec![0xbb], vec![0xcc]]);
    }

    #[tokio::test]
    async fn reopening_the_file_resumes_the_sequence_counter() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("crdt.redb");
        {
            let adapter = RedbStorageAdapter::open(&path).expect("open");
            adapter.doc_append_update("notes:doc1", vec![1]).await.expect("append");
            adapter.doc_append_update("notes:doc1", vec![2]).await.expect("append");
        }
        let adapter = RedbStorageAdapter::open(&path).expect("reopen");
        adapter.doc_append_update("notes:doc1", vec![3]).await.expect("append");
        let updates = adapter.doc_updates("notes:doc1").await.expect("read back");
        assert_eq!(updates, vec![vec![1], vec![2], vec![3]]);
    }
}

// vim: ts=4
