//! The in-memory reactive collection store, consumed only via its
//! minimal transactional handle (spec.md §1 "out of scope... consumed
//! via a minimal `{begin, write, truncate, commit, update}` transactional
//! handle").
//!
//! Grounded on `rtdb_adapter.rs`'s `Transaction` trait
//! (`create`/`update`/`delete`/`get`/`commit`/`rollback`): the same
//! begin-a-handle, stage-writes, commit-atomically shape, narrowed to
//! what the replication engine needs. The reference `InMemoryStore`
//! implementation plus its `Ready`-shaped event are SPEC_FULL.md §11
//! supplements — the distilled spec treats the store as an external
//! collaborator and never specifies a concrete implementation.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use crdtsync_types::error::{Error, Result};
use crdtsync_types::material::{row_id, MaterializedRow};
use tokio::sync::{broadcast, RwLock};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteKind {
	Insert,
	Upsert,
	Delete,
}

/// Emitted after every committed transaction. Mirrors the teacher's
/// `ChangeEvent::Ready` pattern (`rtdb_adapter.rs`): consumers that only
/// care "has anything changed" can await this instead of diffing rows.
/// `Ready` fires once, the first time a `replace()` lands — distinct from
/// the §4.E collection-level "ready" signal, which also waits on
/// persistence/recovery; this one is purely "the store itself has rows".
#[derive(Clone, Debug)]
pub enum StoreEvent {
	Committed { touched: usize },
	Truncated,
	Ready,
}

#[async_trait]
pub trait StoreTransaction: Send {
	async fn write(&mut self, kind: WriteKind, row: MaterializedRow) -> Result<()>;
	async fn truncate(&mut self) -> Result<()>;
	async fn commit(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait ReactiveStore: Send + Sync + Debug {
	async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;
	async fn get(&self, id: &str) -> Option<MaterializedRow>;
	async fn snapshot(&self) -> Vec<MaterializedRow>;
	fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}

#[derive(Debug)]
pub struct InMemoryStore {
	rows: Arc<RwLock<HashMap<String, MaterializedRow>>>,
	events: broadcast::Sender<StoreEvent>,
	ready_fired: Arc<std::sync::atomic::AtomicBool>,
}

impl Default for InMemoryStore {
	fn default() -> Self {
		let (events, _) = broadcast::channel(128);
		InMemoryStore {
			rows: Arc::new(RwLock::new(HashMap::new())),
			events,
			ready_fired: Arc::new(std::sync::atomic::AtomicBool::new(false)),
		}
	}
}

impl InMemoryStore {
	pub fn new() -> Arc<Self> {
		Arc::new(InMemoryStore::default())
	}
}

enum StagedOp {
	Write(WriteKind, MaterializedRow),
	Truncate,
}

struct InMemoryTransaction {
	rows: Arc<RwLock<HashMap<String, MaterializedRow>>>,
	events: broadcast::Sender<StoreEvent>,
	ready_fired: Arc<std::sync::atomic::AtomicBool>,
	staged: Vec<StagedOp>,
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
	async fn write(&mut self, kind: WriteKind, row: MaterializedRow) -> Result<()> {
		if row_id(&row).is_none() {
			return Err(Error::Internal("materialized row is missing an id".into()));
		}
		self.staged.push(StagedOp::Write(kind, row));
		Ok(())
	}

	async fn truncate(&mut self) -> Result<()> {
		self.staged.push(StagedOp::Truncate);
		Ok(())
	}

	async fn commit(self: Box<Self>) -> Result<()> {
		let mut rows = self.rows.write().await;
		let mut touched = 0usize;
		for op in self.staged {
			match op {
				StagedOp::Truncate => {
					rows.clear();
				}
				StagedOp::Write(WriteKind::Insert | WriteKind::Upsert, row) => {
					if let Some(id) = row_id(&row) {
						rows.insert(id.to_string(), row);
						touched += 1;
					}
				}
				StagedOp::Write(WriteKind::Delete, row) => {
					if let Some(id) = row_id(&row) {
						rows.remove(id);
						touched += 1;
					}
				}
			}
		}
		drop(rows);
		let _ = self.events.send(StoreEvent::Committed { touched });
		if self.ready_fired.compare_exchange(
			false,
			true,
			std::sync::atomic::Ordering::SeqCst,
			std::sync::atomic::Ordering::SeqCst,
		).is_ok() {
			let _ = self.events.send(StoreEvent::Ready);
		}
		Ok(())
	}
}

#[async_trait]
impl ReactiveStore for InMemoryStore {
	async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
		Ok(Box::new(InMemoryTransaction {
			rows: Arc::clone(&self.rows),
			events: self.events.clone(),
			ready_fired: Arc::clone(&self.ready_fired),
			staged: Vec::new(),
		}))
	}

	async fn get(&self, id: &str) -> Option<MaterializedRow> {
		self.rows.read().await.get(id).cloned()
	}

	async fn snapshot(&self) -> Vec<MaterializedRow> {
		self.rows.read().await.values().cloned().collect()
	}

	fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
		self.events.subscribe()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn row(id: &str) -> MaterializedRow {
		json!({"id": id, "title": "x"}).as_object().unwrap().clone()
	}

	#[tokio::test]
	async fn replace_is_atomic_and_visible_after_commit() {
		let store = InMemoryStore::new();
		let mut txn = store.begin().await.expect("begin");
		txn.truncate().await.expect("truncate");
		txn.write(WriteKind::Insert, row("r1")).await.expect("write");
		txn.write(WriteKind::Insert, row("r2")).await.expect("write");
		txn.commit().await.expect("commit");

		assert_eq!(store.snapshot().await.len(), 2);
		assert!(store.get("r1").await.is_some());
	}

	#[tokio::test]
	async fn delete_removes_row() {
		let store = InMemoryStore::new();
		let mut txn = store.begin().await.expect("begin");
		txn.write(WriteKind::Insert, row("r1")).await.expect("write");
		txn.commit().await.expect("commit");

		let mut txn = store.begin().await.expect("begin");
		txn.write(WriteKind::Delete, row("r1")).await.expect("write");
		txn.commit().await.expect("commit");

		assert!(store.get("r1").await.is_none());
	}

	#[tokio::test]
	async fn commit_emits_store_event() {
		let store = InMemoryStore::new();
		let mut rx = store.subscribe();
		let mut txn = store.begin().await.expect("begin");
		txn.write(WriteKind::Insert, row("r1")).await.expect("write");
		txn.commit().await.expect("commit");

		match rx.recv().await.expect("event") {
			StoreEvent::Committed { touched } => assert_eq!(touched, 1),
			other => panic!("unexpected event: {other:?}"),
		}
	}

	#[tokio::test]
	async fn ready_fires_once_on_first_commit() {
		let store = InMemoryStore::new();
		let mut rx = store.subscribe();

		let mut txn = store.begin().await.expect("begin");
		txn.write(WriteKind::Insert, row("r1")).await.expect("write");
		txn.commit().await.expect("commit");
		assert!(matches!(rx.recv().await.expect("event"), StoreEvent::Committed { .. }));
		assert!(matches!(rx.recv().await.expect("event"), StoreEvent::Ready));

		let mut txn = store.begin().await.expect("begin");
		txn.write(WriteKind::Insert, row("r2")).await.expect("write");
		txn.commit().await.expect("commit");
		assert!(matches!(rx.recv().await.expect("event"), StoreEvent::Committed { .. }));
		assert!(rx.try_recv().is_err(), "Ready must not fire twice");
	}
}

// vim: ts=4
