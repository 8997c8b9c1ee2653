//! End-to-end scenarios against `Collection` (spec.md §8 "Concrete
//! end-to-end scenarios"), driven through a fake `BackendApi` so the
//! full startup sequence, outbound write path and live-stream handler
//! run against real crate code with no network or disk involved.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use crdtsync_core::{CollectionConfig, CollectionSchema, FieldKind, InMemoryStore, LazyCollection, MemoryStorageAdapter};
use crdtsync_types::backend::{
	BackendApi, BoxStream, Change, ChangeKind, CompactHint, MutationAck, PresenceAction, PresencePayload,
	RecoveryResponse, SessionInfo, StreamPage,
};
use crdtsync_types::error::Result;
use crdtsync_types::ids::{ClientId, CollectionName, DocumentId, Seq};
use crdtsync_types::material::MaterializedRow;
use futures::stream::{self, unfold};
use serde_json::json;
use tokio::sync::broadcast;

#[derive(Debug, Default)]
struct Calls {
	inserts: Vec<(DocumentId, MaterializedRow)>,
	updates: Vec<(DocumentId, MaterializedRow)>,
	removes: Vec<DocumentId>,
	marks: Vec<(DocumentId, Seq)>,
	compacts: Vec<DocumentId>,
}

/// A `BackendApi` double: records every call, answers mutations
/// optimistically, and lets the test push stream pages on demand
/// through a broadcast channel.
#[derive(Debug)]
struct FakeBackend {
	calls: StdMutex<Calls>,
	seq: AtomicU64,
	pages: broadcast::Sender<StreamPage>,
}

impl FakeBackend {
	fn new() -> std::sync::Arc<Self> {
		let (pages, _) = broadcast::channel(64);
		std::sync::Arc::new(FakeBackend { calls: StdMutex::new(Calls::default()), seq: AtomicU64::new(0), pages })
	}

	fn next_seq(&self) -> Seq {
		self.seq.fetch_add(1, Ordering::SeqCst) + 1
	}

	fn push_page(&self, page: StreamPage) {
		let _ = self.pages.send(page);
	}
}

#[async_trait]
impl BackendApi for FakeBackend {
	async fn stream(&self, _collection: &CollectionName, _seq: Seq, _limit: u32) -> Result<BoxStream<Result<StreamPage>>> {
		let rx = self.pages.subscribe();
		Ok(Box::pin(unfold(rx, |mut rx| async move {
			loop {
				match rx.recv().await {
					Ok(page) => return Some((Ok(page), rx)),
					Err(broadcast::error::RecvError::Lagged(_)) => continue,
					Err(broadcast::error::RecvError::Closed) => return None,
				}
			}
		})))
	}

	async fn insert(
		&self,
		_collection: &CollectionName,
		document: &DocumentId,
		_bytes: Vec<u8>,
		material: MaterializedRow,
	) -> Result<MutationAck> {
		self.calls.lock().expect("calls lock").inserts.push((document.clone(), material));
		Ok(MutationAck { success: true, seq: Some(self.next_seq()) })
	}

	async fn update(
		&self,
		_collection: &CollectionName,
		document: &DocumentId,
		_bytes: Vec<u8>,
		material: MaterializedRow,
	) -> Result<MutationAck> {
		self.calls.lock().expect("calls lock").updates.push((document.clone(), material));
		Ok(MutationAck { success: true, seq: Some(self.next_seq()) })
	}

	async fn remove(&self, _collection: &CollectionName, document: &DocumentId, _bytes: Vec<u8>) -> Result<MutationAck> {
		self.calls.lock().expect("calls lock").removes.push(document.clone());
		Ok(MutationAck { success: true, seq: Some(self.next_seq()) })
	}

	async fn recovery(&self, _collection: &CollectionName, _document: &DocumentId, vector: Vec<u8>) -> Result<RecoveryResponse> {
		Ok(RecoveryResponse { diff: None, vector })
	}

	async fn mark(&self, _collection: &CollectionName, document: &DocumentId, _client: &ClientId, seq: Seq, _vector: Vec<u8>) -> Result<()> {
		self.calls.lock().expect("calls lock").marks.push((document.clone(), seq));
		Ok(())
	}

	async fn compact(&self, _collection: &CollectionName, document: &DocumentId) -> Result<()> {
		self.calls.lock().expect("calls lock").compacts.push(document.clone());
		Ok(())
	}

	async fn sessions(&self, _collection: &CollectionName, _document: &DocumentId, _exclude: &ClientId) -> Result<BoxStream<Vec<SessionInfo>>> {
		Ok(Box::pin(stream::pending()))
	}

	async fn presence(&self, _collection: &CollectionName, _document: &DocumentId, _client: &ClientId, _action: PresenceAction, _payload: PresencePayload) -> Result<()> {
		Ok(())
	}
}

fn config(backend: std::sync::Arc<FakeBackend>) -> CollectionConfig {
	let schema = CollectionSchema::new().with_field("title", FieldKind::Scalar).with_prose("body");
	CollectionConfig::new(
		CollectionName::from("notes"),
		schema,
		backend,
		std::sync::Arc::new(MemoryStorageAdapter::new()),
		InMemoryStore::new(),
	)
}

async fn settle() {
	tokio::time::sleep(Duration::from_millis(60)).await;
}

/// Gives the background live-stream task time to call `stream()` and
/// subscribe to the fake backend's broadcast channel before the test
/// pushes a page — otherwise the page can be sent before anyone is
/// listening and is silently dropped.
async fn wait_for_stream_subscription() {
	tokio::time::sleep(Duration::from_millis(20)).await;
}

/// Scenario 1: cold start, empty persistence, empty stream.
#[tokio::test]
async fn cold_start_is_ready_with_empty_store_and_zero_cursor() {
	let backend = FakeBackend::new();
	let lazy = LazyCollection::create(config(backend));
	lazy.init(None).await.expect("init");
	let collection = lazy.get().expect("collection available after init");

	assert_eq!(collection.cursor(), 0);
	assert!(collection.store().snapshot().await.is_empty());
}

/// Scenario 2 (partial, coordinator-level slice): an insert followed by
/// an update of the same field produces one materialized row in the
/// store with the latest value, and the backend sees both calls.
#[tokio::test]
async fn insert_then_update_converges_in_the_store() {
	let backend = FakeBackend::new();
	let lazy = LazyCollection::create(config(Clone::clone(&backend)));
	lazy.init(None).await.expect("init");
	let collection = lazy.get().expect("collection");

	let id = DocumentId::from("r1");
	let mut row = serde_json::Map::new();
	row.insert("id".into(), json!("r1"));
	row.insert("title".into(), json!("A"));
	collection.insert(id.clone(), row).await.expect("insert");

	let mut patch = serde_json::Map::new();
	patch.insert("title".into(), json!("B"));
	collection.update(id.clone(), patch).await.expect("update");

	let stored = collection.store().get("r1").await.expect("row present");
	assert_eq!(stored.get("title"), Some(&json!("B")));

	// Both mutations land inside the actor's debounce window (default
	// 200ms) and coalesce into a single push; wait past it before
	// inspecting what reached the backend.
	tokio::time::sleep(Duration::from_millis(260)).await;

	let calls = backend.calls.lock().expect("calls lock");
	assert_eq!(calls.inserts.len(), 1);
}

/// Scenario 5: a snapshot change for a document not yet known locally
/// inserts it; the cursor advances and a `mark` ack fires.
#[tokio::test]
async fn snapshot_delivery_inserts_row_and_advances_cursor() {
	let backend = FakeBackend::new();
	let lazy = LazyCollection::create(config(Clone::clone(&backend)));
	lazy.init(None).await.expect("init");
	let collection = lazy.get().expect("collection");

	// Build the snapshot bytes from an independent document sharing the
	// same sub-document id, to produce a realistic opaque update.
	let scratch = crdtsync_core::SubDocumentManager::new();
	let doc_id = DocumentId::from("r1");
	let bytes = scratch.transact_with_delta(&doc_id, crdtsync_types::origin::OriginTag::Local, |txn, fields| {
		use yrs::Map as _;
		fields.insert(txn, "title", "from server");
	});

	wait_for_stream_subscription().await;
	backend.push_page(StreamPage {
		changes: vec![Change { document: doc_id.clone(), bytes, kind: ChangeKind::Snapshot, exists: true }],
		seq: Some(1),
		more: false,
		compact: Some(CompactHint { documents: vec![doc_id.clone()] }),
	});

	settle().await;

	assert_eq!(collection.cursor(), 1);
	let row = collection.store().get("r1").await.expect("row inserted from snapshot");
	assert_eq!(row.get("title"), Some(&json!("from server")));

	let calls = backend.calls.lock().expect("calls lock");
	assert_eq!(calls.marks, vec![(doc_id.clone(), 1)]);
	assert_eq!(calls.compacts, vec![doc_id]);
}

/// A delta change for a document that doesn't exist anywhere (never
/// inserted locally, and the server says it doesn't exist either) is a
/// pure no-op: no row appears, and the cursor still advances.
#[tokio::test]
async fn unknown_nonexistent_delta_is_ignored_but_cursor_still_advances() {
	let backend = FakeBackend::new();
	let lazy = LazyCollection::create(config(Clone::clone(&backend)));
	lazy.init(None).await.expect("init");
	let collection = lazy.get().expect("collection");

	wait_for_stream_subscription().await;
	backend.push_page(StreamPage {
		changes: vec![Change { document: DocumentId::from("ghost"), bytes: vec![], kind: ChangeKind::Delta, exists: false }],
		seq: Some(5),
		more: false,
		compact: None,
	});

	settle().await;

	assert_eq!(collection.cursor(), 5);
	assert!(collection.store().get("ghost").await.is_none());
}

/// `Collection::delete` removes the row from the reactive store and
/// sends a tombstone-carrying `remove` mutation (spec.md §4.E "onDelete";
/// §9 eager-removal asymmetry).
#[tokio::test]
async fn delete_removes_row_and_notifies_backend() {
	let backend = FakeBackend::new();
	let lazy = LazyCollection::create(config(Clone::clone(&backend)));
	lazy.init(None).await.expect("init");
	let collection = lazy.get().expect("collection");

	let id = DocumentId::from("r1");
	let mut row = serde_json::Map::new();
	row.insert("id".into(), json!("r1"));
	row.insert("title".into(), json!("A"));
	collection.insert(id.clone(), row).await.expect("insert");
	assert!(collection.store().get("r1").await.is_some());

	collection.delete(id.clone()).await.expect("delete");

	assert!(collection.store().get("r1").await.is_none());
	let calls = backend.calls.lock().expect("calls lock");
	assert_eq!(calls.removes, vec![id]);
}

/// Material hydration (spec.md §4.E startup step 4): a server-rendered
/// `crdt` bootstrap entry is applied before the store is first
/// materialized, so the row is present immediately after `init()`.
#[tokio::test]
async fn material_bootstrap_hydrates_store_before_ready() {
	let backend = FakeBackend::new();
	let scratch = crdtsync_core::SubDocumentManager::new();
	let doc_id = DocumentId::from("r1");
	let bytes = scratch.transact_with_delta(&doc_id, crdtsync_types::origin::OriginTag::Local, |txn, fields| {
		use yrs::Map as _;
		fields.insert(txn, "title", "bootstrapped");
	});

	let mut crdt = std::collections::HashMap::new();
	crdt.insert(doc_id.clone(), crdtsync_types::material::CrdtBootstrap { bytes, seq: Some(3) });
	let material = crdtsync_types::material::Material { documents: vec![], cursor: Some(3), count: None, crdt };

	let lazy = LazyCollection::create(config(backend));
	lazy.init(Some(material)).await.expect("init");
	let collection = lazy.get().expect("collection");

	let row = collection.store().get("r1").await.expect("row hydrated from material");
	assert_eq!(row.get("title"), Some(&json!("bootstrapped")));
	assert_eq!(collection.cursor(), 3);
}

// vim: ts=4
