//! Sync/recovery coordinator and the public collection surface
//! (spec.md §4.E, §6): orchestrates the lifecycle from cold start through
//! live streaming, and exposes `LazyCollection`/`Collection`/
//! `Collection::prose` to application code.
//!
//! Grounded on `rtdb_adapter.rs`'s collection-context shape (one struct
//! owning the backend binding, the store handle, and the actor registry)
//! and on `core/ws_bus.rs`'s cursor-advancing subscription loop for the
//! live-stream task.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use crdtsync_types::backend::{BackendApi, ChangeKind, StreamPage};
use crdtsync_types::error::{Error, Result, SyncError};
use crdtsync_types::ids::{ClientId, CollectionName, DocumentId, Seq};
use crdtsync_types::material::{Material, MaterializedRow};
use crdtsync_types::origin::OriginTag;
use dashmap::DashMap;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use yrs::Transact;

use crate::actor::{ActorConfig, BoxFuture, SyncFn, WriteActor, WriteActorManager};
use crate::awareness::{Awareness, AwarenessConfig, AwarenessProvider, LocalPresence};
use crate::materialize::{self, OpItem, OpsHandle};
use crate::persistence::{Kv, PersistenceFactory, ReplayingProvider, StorageAdapter, StorageBackedFactory};
use crate::schema::CollectionSchema;
use crate::store::ReactiveStore;
use crate::subdoc::SubDocumentManager;
use crate::ydoc;

const SESSION_CLIENT_ID_KEY: &str = "replicate:sessionClientId";
const PROSE_BINDING_GRACE: std::time::Duration = std::time::Duration::from_secs(10);
const PROSE_BINDING_POLL: std::time::Duration = std::time::Duration::from_millis(10);
const DEFAULT_STREAM_LIMIT: u32 = 1000;

/// How a collection is constructed (spec.md §6 `collection.create(...)`).
pub struct CollectionConfig {
	pub name: CollectionName,
	pub schema: CollectionSchema,
	pub backend: Arc<dyn BackendApi>,
	pub storage: Arc<dyn StorageAdapter>,
	pub store: Arc<dyn ReactiveStore>,
	pub actor_config: ActorConfig,
	pub awareness_config: AwarenessConfig,
	pub stream_limit: u32,
}

impl CollectionConfig {
	pub fn new(
		name: CollectionName,
		schema: CollectionSchema,
		backend: Arc<dyn BackendApi>,
		storage: Arc<dyn StorageAdapter>,
		store: Arc<dyn ReactiveStore>,
	) -> Self {
		CollectionConfig {
			name,
			schema,
			backend,
			storage,
			store,
			actor_config: ActorConfig::default(),
			awareness_config: AwarenessConfig::default(),
			stream_limit: DEFAULT_STREAM_LIMIT,
		}
	}

	pub fn with_actor_config(mut self, config: ActorConfig) -> Self {
		self.actor_config = config;
		self
	}

	pub fn with_awareness_config(mut self, config: AwarenessConfig) -> Self {
		self.awareness_config = config;
		self
	}

	pub fn with_stream_limit(mut self, limit: u32) -> Self {
		self.stream_limit = limit;
		self
	}
}

/// `collection.create(...)`: holds configuration until `init()` is
/// called, then caches the built `Collection` (spec.md §6).
pub struct LazyCollection {
	config: StdMutex<Option<CollectionConfig>>,
	collection: OnceCell<Arc<Collection>>,
}

impl fmt::Debug for LazyCollection {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("LazyCollection").field("initialized", &self.collection.initialized()).finish()
	}
}

impl LazyCollection {
	pub fn create(config: CollectionConfig) -> Arc<Self> {
		Arc::new(LazyCollection { config: StdMutex::new(Some(config)), collection: OnceCell::new() })
	}

	/// Runs the full startup sequence exactly once, even under concurrent
	/// callers; a second `init()` after success is a no-op.
	pub async fn init(&self, material: Option<Material>) -> Result<()> {
		self.collection
			.get_or_try_init(|| async {
				let config = self
					.config
					.lock()
					.map_err(|_| Error::Internal("lazy collection config lock poisoned".into()))?
					.take()
					.ok_or_else(|| Error::Internal("collection already initialized".into()))?;
				Collection::start(config, material).await
			})
			.await?;
		Ok(())
	}

	pub fn get(&self) -> Option<Arc<Collection>> {
		self.collection.get().cloned()
	}
}

/// The collection context (spec.md §9 "Cyclic ownership"): owns the
/// sub-document manager, persistence, the reactive store's ops handle,
/// the write-actor registry, and per-document awareness providers.
pub struct Collection {
	name: CollectionName,
	schema: CollectionSchema,
	backend: Arc<dyn BackendApi>,
	subdocs: SubDocumentManager,
	store: Arc<dyn ReactiveStore>,
	ops: OpsHandle,
	actors: Arc<WriteActorManager>,
	awareness_providers: DashMap<DocumentId, Arc<AwarenessProvider>>,
	awareness_config: AwarenessConfig,
	client_id: ClientId,
	kv: Kv,
	root_provider: Arc<ReplayingProvider>,
	cursor: AtomicU64,
	stream_limit: u32,
	stream_task: StdMutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Collection {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Collection")
			.field("name", &self.name)
			.field("cursor", &self.cursor.load(Ordering::SeqCst))
			.finish_non_exhaustive()
	}
}

impl Collection {
	pub fn name(&self) -> &CollectionName {
		&self.name
	}

	pub fn client_id(&self) -> &ClientId {
		&self.client_id
	}

	pub fn cursor(&self) -> Seq {
		self.cursor.load(Ordering::SeqCst)
	}

	pub fn store(&self) -> &Arc<dyn ReactiveStore> {
		&self.store
	}

	/// Startup sequence (spec.md §4.E): persistence activation, client
	/// id, material hydration, recovery, initial materialization, cursor
	/// load, actor runtime, live-stream subscription.
	async fn start(config: CollectionConfig, material: Option<Material>) -> Result<Arc<Collection>> {
		let subdocs = SubDocumentManager::new();
		let kv = Kv::new(Arc::clone(&config.storage));

		// 1. Persistence activation.
		//
		// `create_root` is inherent on `StorageBackedFactory` (root
		// persistence is keyed differently than per-sub-document
		// persistence and isn't part of the object-safe
		// `PersistenceFactory` trait), so a concrete instance is built
		// alongside the `dyn PersistenceFactory` handed to the
		// sub-document manager.
		let concrete_factory = StorageBackedFactory::new(Arc::from(config.name.as_str()), Arc::clone(&config.storage));
		let root_provider = concrete_factory.create_root(subdocs.root());
		let persistence_factory: Arc<dyn PersistenceFactory> = Arc::new(concrete_factory);
		if let Err(err) = root_provider.when_synced().await {
			warn!(collection = %config.name, error = %err, "root persistence replay failed, continuing in-memory");
		}
		subdocs.enable_persistence(Arc::clone(&persistence_factory)).await;

		// 2. Client id.
		let client_id = load_or_create_client_id(&kv).await?;

		// 3. Ops construction.
		let ops = OpsHandle::new(Arc::clone(&config.store));

		// 4. Material hydration.
		if let Some(material) = &material {
			for (doc_id, bootstrap) in &material.crdt {
				if let Err(err) = subdocs.apply_update(doc_id, &bootstrap.bytes, OriginTag::Server) {
					warn!(document = %doc_id, error = %err, "material hydration failed for sub-document");
				}
			}
		}

		// 5. Recovery.
		let live_documents = subdocs.documents();
		if !live_documents.is_empty() {
			let recoveries = live_documents.iter().map(|id| {
				let backend = Arc::clone(&config.backend);
				let name = config.name.clone();
				let vector = subdocs.encode_state_vector(id);
				let id = id.clone();
				async move { (id, backend.recovery(&name, &id, vector).await) }
			});
			for (id, result) in futures::future::join_all(recoveries).await {
				match result {
					Ok(response) => {
						if let Some(diff) = response.diff {
							if !ydoc::is_empty_update(&diff) {
								if let Err(err) = subdocs.apply_update(&id, &diff, OriginTag::Server) {
									warn!(document = %id, error = %err, "recovery diff failed to apply");
								}
							}
						}
					}
					Err(err) => warn!(document = %id, error = %err, "recovery request failed"),
				}
			}
		}

		// 6. Materialize into store.
		let rows: Vec<MaterializedRow> =
			live_documents.iter().filter_map(|id| serialize_row(&subdocs, id)).collect();
		ops.replace(rows).await?;

		// 7. Cursor.
		let cursor_key = format!("cursor:{}", config.name);
		let cursor = match kv.get::<Seq>(&cursor_key).await? {
			Some(seq) => seq,
			None => material.as_ref().and_then(|m| m.cursor).unwrap_or(0),
		};

		// 8. Actor runtime.
		let actors = Arc::new(WriteActorManager::new(config.actor_config.clone()));

		let collection = Arc::new(Collection {
			name: config.name,
			schema: config.schema,
			backend: config.backend,
			subdocs,
			store: config.store,
			ops,
			actors,
			awareness_providers: DashMap::new(),
			awareness_config: config.awareness_config,
			client_id,
			kv,
			root_provider,
			cursor: AtomicU64::new(cursor),
			stream_limit: config.stream_limit,
			stream_task: StdMutex::new(None),
		});

		for id in collection.subdocs.documents() {
			collection.register_actor(&id);
		}

		// 9. Subscribe.
		let stream_collection = Arc::clone(&collection);
		let handle = tokio::spawn(async move { run_stream(stream_collection).await });
		match collection.stream_task.lock() {
			Ok(mut guard) => *guard = Some(handle),
			Err(_) => warn!(collection = %collection.name, "stream task lock poisoned, live stream will not be cancellable"),
		}

		debug!(collection = %collection.name, cursor, "collection initialized");
		Ok(collection)
	}

	fn register_actor(self: &Arc<Self>, id: &DocumentId) -> Arc<WriteActor> {
		let doc = self.subdocs.get_or_create(id);
		let sync_fn = make_sync_fn(Arc::clone(self), id.clone());
		self.actors.register(id.clone(), doc, sync_fn)
	}

	/// `collection.insert({id, ...fields})` (spec.md §4.E "onInsert").
	///
	/// The actor is registered *before* the creating mutation so its
	/// baseline vector snapshots the pre-insert (empty) state; the push
	/// itself is then routed through the actor's debounced `sync_fn`
	/// rather than awaited inline, so an offline/failing insert still
	/// materializes optimistically and the creating delta is retried
	/// together with whatever local edits land before the first
	/// successful sync (spec.md §1(e) optimistic materialization, §4.D,
	/// §8 Scenario 2).
	pub async fn insert(self: &Arc<Self>, document: DocumentId, row: MaterializedRow) -> Result<()> {
		self.register_actor(&document);
		let schema = self.schema.clone();
		self.subdocs.transact_with_delta(&document, OriginTag::Local, |txn, fields| {
			materialize::hydrate(txn, fields, &schema, &row);
		});
		let materialized = serialize_row(&self.subdocs, &document).unwrap_or_else(|| row.clone());
		self.ops.insert(vec![materialized]).await?;
		self.actors.on_local_change(&document);
		Ok(())
	}

	/// `collection.update(id, patch)`. The patch's fields are hydrated
	/// into the sub-document and the write actor is notified; the actor's
	/// own debounced sync recomputes the full delta since its last
	/// pushed vector, so a burst of updates still coalesces into one
	/// outbound mutation (spec.md §4.D, §4.E "onUpdate").
	pub async fn update(self: &Arc<Self>, document: DocumentId, patch: MaterializedRow) -> Result<()> {
		let schema = self.schema.clone();
		let delta = self.subdocs.transact_with_delta(&document, OriginTag::Local, |txn, fields| {
			materialize::hydrate(txn, fields, &schema, &patch);
		});
		if ydoc::is_empty_update(&delta) {
			return Ok(());
		}
		if let Some(row) = serialize_row(&self.subdocs, &document) {
			self.ops.upsert(vec![row]).await?;
		}
		self.actors.on_local_change(&document);
		Ok(())
	}

	/// `collection.delete(id)` (spec.md §4.E "onDelete"): removes from
	/// the reactive store before awaiting the backend mutation, unlike
	/// insert/update (spec.md §9 open question — the asymmetry is kept
	/// intentionally since tombstone deltas tolerate re-delivery).
	pub async fn delete(self: &Arc<Self>, document: DocumentId) -> Result<()> {
		let tombstone = self.subdocs.encode_state(&document);
		let row = serialize_row(&self.subdocs, &document);
		self.subdocs.delete(&document);
		self.actors.unregister(&document).await;
		if let Some(row) = row {
			self.ops.delete(vec![row]).await?;
		}
		self.backend.remove(&self.name, &document, tombstone).await?;
		Ok(())
	}

	/// `Collection.utils.prose(document_id, field_name, options?)`
	/// (spec.md §6, §7 "Prose binding"): polls for the sub-document and
	/// fragment for up to 10s before raising `ProseBindingTimeout`.
	pub async fn prose(
		self: &Arc<Self>,
		document: DocumentId,
		field_name: impl Into<String>,
		presence: LocalPresence,
	) -> Result<EditorBinding> {
		let field_name = field_name.into();
		let deadline = tokio::time::Instant::now() + PROSE_BINDING_GRACE;
		loop {
			if self.subdocs.has(&document) {
				break;
			}
			if tokio::time::Instant::now() >= deadline {
				return Err(Error::ProseBindingTimeout {
					document,
					field: field_name,
					collection: self.name.as_str().to_string(),
				});
			}
			tokio::time::sleep(PROSE_BINDING_POLL).await;
		}

		let doc = self.subdocs.get_or_create(&document);
		let fragment_ref = {
			let mut txn = ydoc::transact_mut(&doc, OriginTag::Fragment);
			ydoc::fragment_of(&mut txn, &field_name)
		};

		let actor = self.register_actor(&document);

		let document_for_sub = document.clone();
		let actor_for_sub = Arc::clone(&actor);
		let sub = {
			use yrs::DeepObservable;
			fragment_ref.observe_deep(move |txn, _events| {
				if ydoc::origin_of(txn) == Some(OriginTag::Server) {
					return;
				}
				actor_for_sub.on_local_change();
			})
		};
		debug!(document = %document_for_sub, field = %field_name, "prose binding attached");

		let awareness = Awareness::new(self.client_id.clone());
		let vector_doc = doc.clone();
		let awareness_provider = AwarenessProvider::start(
			self.name.clone(),
			document.clone(),
			self.client_id.clone(),
			Arc::clone(&self.backend),
			Arc::clone(&awareness),
			self.awareness_config.clone(),
			presence,
			Box::new(move || ydoc::encode_state_vector(&vector_doc)),
			Box::new(|| None),
			std::future::ready(()),
		);
		self.awareness_providers.insert(document.clone(), Arc::clone(&awareness_provider));

		Ok(EditorBinding {
			fragment: Fragment { document: document.clone(), field: field_name, inner: fragment_ref },
			awareness,
			document,
			actor,
			awareness_provider,
			_fragment_sub: sub,
		})
	}

	/// Collection cleanup (spec.md §4.E "Cleanup"): unsubscribe the
	/// stream, unregister all write actors, close the root persistence
	/// provider, destroy the sub-document manager's state.
	pub async fn cleanup(&self) {
		let handle = match self.stream_task.lock() {
			Ok(mut guard) => guard.take(),
			Err(_) => {
				warn!(collection = %self.name, "stream task lock poisoned during cleanup");
				None
			}
		};
		if let Some(handle) = handle {
			handle.abort();
		}
		self.actors.destroy().await;
		for entry in self.awareness_providers.iter() {
			entry.value().destroy().await;
		}
		self.awareness_providers.clear();
		self.root_provider.destroy();
		for provider in self.subdocs.providers() {
			provider.destroy();
		}
		debug!(collection = %self.name, "collection cleaned up");
	}

	async fn persist_cursor(&self, seq: Seq) -> Result<()> {
		self.cursor.fetch_max(seq, Ordering::SeqCst);
		let key = format!("cursor:{}", self.name);
		self.kv.set(&key, &seq).await
	}
}

fn serialize_row(subdocs: &SubDocumentManager, id: &DocumentId) -> Option<MaterializedRow> {
	let doc = subdocs.get(id)?;
	let fields = subdocs.get_fields(id)?;
	let txn = doc.transact();
	Some(materialize::serialize(&txn, id.as_str(), &fields))
}

async fn load_or_create_client_id(kv: &Kv) -> Result<ClientId> {
	if let Some(existing) = kv.get::<String>(SESSION_CLIENT_ID_KEY).await? {
		return Ok(ClientId::from(existing));
	}
	let generated = uuid::Uuid::new_v4().to_string();
	kv.set(SESSION_CLIENT_ID_KEY, &generated).await?;
	Ok(ClientId::from_generated(generated))
}

/// The write actor's network sync: diffs against the actor's last-pushed
/// vector and sends the delta (spec.md §4.D "Sync operation"). `since`
/// being the canonical empty state vector means no push for this document
/// has ever succeeded yet, so this is the document's creation and the
/// verb is `insert`; otherwise it's an `update` (spec.md §4.D "callers
/// determine the verb based on mutation origin").
fn make_sync_fn(collection: Arc<Collection>, document: DocumentId) -> SyncFn {
	Arc::new(move |since: Vec<u8>| -> BoxFuture<std::result::Result<Vec<u8>, SyncError>> {
		let collection = Arc::clone(&collection);
		let document = document.clone();
		Box::pin(async move {
			let doc = collection
				.subdocs
				.get(&document)
				.ok_or_else(|| SyncError::non_retriable(document.clone(), "document no longer exists"))?;
			let delta = ydoc::encode_update_since(&doc, &since);
			if ydoc::is_empty_update(&delta) {
				return Ok(since);
			}
			let row = serialize_row(&collection.subdocs, &document).unwrap_or_default();
			let is_creation = ydoc::is_empty_state_vector(&since);
			let ack = if is_creation {
				collection.backend.insert(&collection.name, &document, delta, row).await
			} else {
				collection.backend.update(&collection.name, &document, delta, row).await
			};
			match ack {
				Ok(ack) if ack.success => Ok(ydoc::encode_state_vector(&doc)),
				Ok(_) => Err(SyncError::retriable(document.clone(), "mutation rejected by backend")),
				Err(Error::NonRetriable(cause)) => Err(SyncError::non_retriable(document.clone(), cause)),
				Err(err) => Err(SyncError::retriable(document.clone(), err.to_string())),
			}
		})
	})
}

/// The live-stream task (spec.md §4.E "Live stream handler"): re-opens
/// `stream(seq, limit)` from the persisted cursor and applies each page
/// in one store transaction.
async fn run_stream(collection: Arc<Collection>) {
	loop {
		let seq = collection.cursor();
		let attempt = collection.backend.stream(&collection.name, seq, collection.stream_limit).await;
		let mut pages = match attempt {
			Ok(pages) => pages,
			Err(err) => {
				warn!(collection = %collection.name, error = %err, "stream subscription failed, retrying");
				tokio::time::sleep(std::time::Duration::from_secs(1)).await;
				continue;
			}
		};

		while let Some(page) = pages.next().await {
			match page {
				Ok(page) => {
					if let Err(err) = apply_stream_page(&collection, page).await {
						warn!(collection = %collection.name, error = %err, "applying stream page failed");
					}
				}
				Err(err) => warn!(collection = %collection.name, error = %err, "stream page error"),
			}
		}

		// The subscription ended (backend-driven reconnect boundary);
		// resume from the latest persisted cursor.
		tokio::time::sleep(std::time::Duration::from_millis(200)).await;
	}
}

async fn apply_stream_page(collection: &Arc<Collection>, page: StreamPage) -> Result<()> {
	let mut items = Vec::new();
	let mut touched: HashSet<DocumentId> = HashSet::new();

	for change in page.changes {
		let id = change.document.clone();
		let existed_locally = collection.subdocs.has(&id);
		if !existed_locally && !change.exists && change.kind == ChangeKind::Delta {
			continue;
		}

		let before = serialize_row(&collection.subdocs, &id);
		if let Err(err) = collection.subdocs.apply_update(&id, &change.bytes, OriginTag::Server) {
			warn!(document = %id, error = %err, "failed to apply stream change");
			continue;
		}
		let after = serialize_row(&collection.subdocs, &id);

		match (before, after) {
			(None, Some(row)) => items.push(OpItem::Insert(row)),
			(Some(_), Some(row)) => items.push(OpItem::Upsert(row)),
			(Some(row), None) => items.push(OpItem::Delete(row)),
			(None, None) => {}
		}

		collection.actors.on_server_update(&id);
		touched.insert(id);
	}

	if !items.is_empty() {
		collection.ops.apply_batch(items).await?;
	}

	if let Some(seq) = page.seq {
		collection.persist_cursor(seq).await?;
		for id in touched {
			let backend = Arc::clone(&collection.backend);
			let name = collection.name.clone();
			let client = collection.client_id.clone();
			let vector = collection.subdocs.encode_state_vector(&id);
			tokio::spawn(async move {
				if let Err(err) = backend.mark(&name, &id, &client, seq, vector).await {
					warn!(document = %id, error = %err, "ack mark failed");
				}
			});
		}
	}

	if let Some(hint) = page.compact {
		for id in hint.documents {
			let backend = Arc::clone(&collection.backend);
			let name = collection.name.clone();
			tokio::spawn(async move {
				if let Err(err) = backend.compact(&name, &id).await {
					warn!(document = %id, error = %err, "compaction hint failed");
				}
			});
		}
	}

	Ok(())
}

/// A rich-text fragment bound to one sub-document field
/// (SPEC_FULL.md §1 "Rich-text editor / awareness primitive").
pub struct Fragment {
	pub document: DocumentId,
	pub field: String,
	inner: yrs::XmlFragmentRef,
}

impl Fragment {
	pub fn inner(&self) -> &yrs::XmlFragmentRef {
		&self.inner
	}
}

/// `EditorBinding` (spec.md §6): the handle returned by
/// `Collection::prose`.
pub struct EditorBinding {
	pub fragment: Fragment,
	pub awareness: Arc<Awareness>,
	pub document: DocumentId,
	actor: Arc<WriteActor>,
	awareness_provider: Arc<AwarenessProvider>,
	_fragment_sub: yrs::Subscription,
}

impl EditorBinding {
	pub fn pending(&self) -> bool {
		self.actor.pending()
	}

	pub fn on_pending_change(&self) -> watch::Receiver<bool> {
		self.actor.on_pending_change()
	}

	pub fn set_cursor(&self, cursor: Option<Value>) {
		self.awareness.set_local_cursor(cursor);
	}

	pub async fn destroy(&self) {
		self.awareness_provider.destroy().await;
	}
}

// vim: ts=4
