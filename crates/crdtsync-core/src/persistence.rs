//! Persistence layer (spec.md §4.B): durable replay/append of CRDT
//! updates for the root and each sub-document, plus a typed KV namespace
//! for cursors and session identity.
//!
//! Grounded on `crdt_adapter.rs`'s `get_updates`/`store_update` replay
//! contract and `crdt-adapter-redb/src/lib.rs`'s snapshot+log table split
//! (`TABLE_UPDATES`/`TABLE_METADATA`); the concrete `redb` table layout
//! lives in `crdtsync-persistence-redb`, this crate only depends on the
//! `StorageAdapter` trait.

use std::fmt::Debug;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use crdtsync_types::error::{Error, Result};
use crdtsync_types::ids::DocumentId;
use crdtsync_types::origin::OriginTag;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tracing::warn;
use yrs::Doc;

use crate::ydoc;

/// Per-document size/count introspection (SPEC_FULL.md §11
/// "`DbStats`-style introspection"), mirrored on the teacher's
/// `CrdtAdapter::stats`/`CrdtDocStats`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DocStats {
	pub update_count: u32,
	pub size_bytes: u64,
}

/// Minimum durable storage contract: an optional snapshot plus an
/// insertion-ordered update log per named document, and a flat KV table
/// (spec.md §4.B "Storage shape").
#[async_trait]
pub trait StorageAdapter: Send + Sync + Debug {
	async fn kv_get(&self, key: &str) -> Result<Option<String>>;
	async fn kv_set(&self, key: &str, value: String) -> Result<()>;
	async fn kv_del(&self, key: &str) -> Result<()>;

	async fn doc_snapshot(&self, name: &str) -> Result<Option<Vec<u8>>>;
	async fn doc_updates(&self, name: &str) -> Result<Vec<Vec<u8>>>;
	async fn doc_append_update(&self, name: &str, bytes: Vec<u8>) -> Result<()>;
	async fn doc_delete(&self, name: &str) -> Result<()>;

	/// Administrative/debugging introspection; derived from data the
	/// adapter already tracks. Default implementation re-reads the full
	/// update log, which concrete adapters should override with a
	/// cheaper running count where one is available.
	async fn doc_stats(&self, name: &str) -> Result<DocStats> {
		let updates = self.doc_updates(name).await?;
		let size_bytes = updates.iter().map(|u| u.len() as u64).sum();
		Ok(DocStats { update_count: updates.len() as u32, size_bytes })
	}
}

/// Typed KV convenience wrapper over a `StorageAdapter`
/// (spec.md §4.B "a `kv` handle with `get<T>/set<T>/del`").
#[derive(Clone)]
pub struct Kv {
	storage: Arc<dyn StorageAdapter>,
}

impl Kv {
	pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
		Kv { storage }
	}

	pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
		match self.storage.kv_get(key).await? {
			Some(raw) => Ok(Some(serde_json::from_str(&raw).map_err(|e| Error::Serde(e.to_string()))?)),
			None => Ok(None),
		}
	}

	pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
		let raw = serde_json::to_string(value).map_err(|e| Error::Serde(e.to_string()))?;
		self.storage.kv_set(key, raw).await
	}

	pub async fn del(&self, key: &str) -> Result<()> {
		self.storage.kv_del(key).await
	}
}

#[async_trait]
pub trait DocPersistenceProvider: Send + Sync {
	/// Resolves once all previously stored updates for this document have
	/// been applied (spec.md §4.B).
	async fn when_synced(&self) -> Result<()>;
	/// Stops observing further updates and releases backend resources.
	/// Idempotent.
	fn destroy(&self);
}

#[derive(Clone)]
enum ReadySignal {
	Pending,
	Ok,
	Err(String),
}

/// Replays a document's stored updates on construction, then appends
/// every subsequent non-persistence-origin update (spec.md §4.B "Replay
/// protocol").
pub struct ReplayingProvider {
	ready: watch::Receiver<ReadySignal>,
	subscription: StdMutex<Option<yrs::Subscription>>,
}

impl ReplayingProvider {
	pub fn start(name: Arc<str>, doc: Doc, storage: Arc<dyn StorageAdapter>) -> Arc<Self> {
		let (tx, rx) = watch::channel(ReadySignal::Pending);
		let provider = Arc::new(ReplayingProvider { ready: rx, subscription: StdMutex::new(None) });
		let task_provider = Arc::clone(&provider);
		tokio::spawn(async move {
			match replay(&name, &doc, storage.as_ref()).await {
				Ok(()) => {
					match subscribe_append(Arc::clone(&name), doc, storage) {
						Some(sub) => {
							if let Ok(mut guard) = task_provider.subscription.lock() {
								*guard = Some(sub);
							}
						}
						None => warn!(document = %name, "failed to subscribe for persistence append, further local edits won't be durably logged"),
					}
					let _ = tx.send(ReadySignal::Ok);
				}
				Err(err) => {
					warn!(error = %err, "persistence replay failed, degrading to in-memory");
					let _ = tx.send(ReadySignal::Err(err.to_string()));
				}
			}
		});
		provider
	}
}

#[async_trait]
impl DocPersistenceProvider for ReplayingProvider {
	async fn when_synced(&self) -> Result<()> {
		let mut rx = self.ready.clone();
		loop {
			match &*rx.borrow() {
				ReadySignal::Pending => {}
				ReadySignal::Ok => return Ok(()),
				ReadySignal::Err(cause) => return Err(Error::PersistenceRead(cause.clone())),
			}
			rx.changed().await.map_err(|_| Error::Internal("persistence signal closed".into()))?;
		}
	}

	fn destroy(&self) {
		if let Ok(mut guard) = self.subscription.lock() {
			*guard = None;
		}
	}
}

async fn replay(name: &str, doc: &Doc, storage: &dyn StorageAdapter) -> Result<()> {
	if let Some(snapshot) = storage.doc_snapshot(name).await? {
		if !ydoc::is_empty_update(&snapshot) {
			ydoc::apply_update_bytes(doc, &snapshot, OriginTag::Persistence)
				.map_err(Error::PersistenceRead)?;
		}
	}
	for update in storage.doc_updates(name).await? {
		ydoc::apply_update_bytes(doc, &update, OriginTag::Persistence).map_err(Error::PersistenceRead)?;
	}
	Ok(())
}

fn subscribe_append(name: Arc<str>, doc: Doc, storage: Arc<dyn StorageAdapter>) -> Option<yrs::Subscription> {
	ydoc::observe_update(&doc, move |txn, event| {
		if ydoc::origin_of(txn) == Some(OriginTag::Persistence) {
			return;
		}
		let bytes = event.update.clone();
		let name = Arc::clone(&name);
		let storage = Arc::clone(&storage);
		tokio::spawn(async move {
			if let Err(err) = storage.doc_append_update(&name, bytes).await {
				warn!(document = %name, error = %err, "persistence append failed");
			}
		});
	})
}

/// Creates a `ReplayingProvider` for each sub-document keyed
/// `"{collection}:{document_id}"`, and one for the root document keyed
/// by the bare collection name (spec.md §4.A `enable_persistence`).
pub struct StorageBackedFactory {
	collection: Arc<str>,
	storage: Arc<dyn StorageAdapter>,
}

impl StorageBackedFactory {
	pub fn new(collection: Arc<str>, storage: Arc<dyn StorageAdapter>) -> Self {
		StorageBackedFactory { collection, storage }
	}

	pub fn root_name(&self) -> Arc<str> {
		Arc::clone(&self.collection)
	}

	pub fn create_root(&self, doc: Doc) -> Arc<ReplayingProvider> {
		ReplayingProvider::start(self.root_name(), doc, Arc::clone(&self.storage))
	}
}

#[async_trait]
pub trait PersistenceFactory: Send + Sync {
	async fn create(&self, document: DocumentId, subdoc: Doc) -> Arc<dyn DocPersistenceProvider>;
}

#[async_trait]
impl PersistenceFactory for StorageBackedFactory {
	async fn create(&self, document: DocumentId, subdoc: Doc) -> Arc<dyn DocPersistenceProvider> {
		let name: Arc<str> = format!("{}:{}", self.collection, document.as_str()).into();
		ReplayingProvider::start(name, subdoc, Arc::clone(&self.storage))
	}
}

// vim: ts=4
