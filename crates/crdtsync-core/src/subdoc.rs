//! Sub-document manager (spec.md §4.A): owns the root CRDT container and
//! its child sub-documents, and is the only mutation API that both
//! applies a change and returns the resulting opaque binary delta.
//!
//! Grounded on `crdt_adapter.rs`'s `get_updates`/`store_update` shape for
//! the update/delta contract, and on the cyclic-ownership guidance of
//! spec.md §9 ("break cycles with... weak handles inside actors") for
//! the subdocs-changed observer, which must hold only a `Weak` back into
//! the manager it updates.

use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use crdtsync_types::error::{Error, Result};
use crdtsync_types::ids::DocumentId;
use crdtsync_types::origin::OriginTag;
use dashmap::DashMap;
use yrs::{Doc, MapRef, Transact, TransactionMut, XmlFragmentRef};

use crate::persistence::{DocPersistenceProvider, PersistenceFactory};
use crate::ydoc;

struct Inner {
	root: Doc,
	subdocs: DashMap<DocumentId, Doc>,
	providers: DashMap<DocumentId, Arc<dyn DocPersistenceProvider>>,
	factory: StdRwLock<Option<Arc<dyn PersistenceFactory>>>,
	subdocs_sub: StdMutex<Option<yrs::Subscription>>,
}

#[derive(Clone)]
pub struct SubDocumentManager {
	inner: Arc<Inner>,
}

impl SubDocumentManager {
	pub fn new() -> Self {
		let inner = Arc::new(Inner {
			root: ydoc::new_root_doc(),
			subdocs: DashMap::new(),
			providers: DashMap::new(),
			factory: StdRwLock::new(None),
			subdocs_sub: StdMutex::new(None),
		});
		let weak = Arc::downgrade(&inner);
		let subscription = ydoc::observe_subdocs(&inner.root, move |_txn, event| {
			if let Some(inner) = weak.upgrade() {
				handle_subdocs_event(&inner, event);
			}
		});
		if let Ok(mut guard) = inner.subdocs_sub.lock() {
			*guard = Some(subscription);
		}
		SubDocumentManager { inner }
	}

	/// The root CRDT document itself, for the collection's own persistence
	/// provider (spec.md §4.E startup step 1 "persistence activation").
	pub fn root(&self) -> Doc {
		self.inner.root.clone()
	}

	pub fn get_or_create(&self, id: &DocumentId) -> Doc {
		if let Some(existing) = self.inner.subdocs.get(id) {
			return existing.clone();
		}
		let subdoc = ydoc::new_subdoc(id);
		{
			let mut txn = ydoc::transact_mut(&self.inner.root, OriginTag::Local);
			let documents = ydoc::documents_map(&mut txn);
			documents.insert(&mut txn, id.as_str(), subdoc.clone());
		}
		self.inner.subdocs.entry(id.clone()).or_insert_with(|| subdoc.clone());
		subdoc
	}

	pub fn get(&self, id: &DocumentId) -> Option<Doc> {
		self.inner.subdocs.get(id).map(|entry| entry.clone())
	}

	pub fn has(&self, id: &DocumentId) -> bool {
		self.inner.subdocs.contains_key(id)
	}

	pub fn documents(&self) -> Vec<DocumentId> {
		self.inner.subdocs.iter().map(|entry| entry.key().clone()).collect()
	}

	pub fn get_fields(&self, id: &DocumentId) -> Option<MapRef> {
		let doc = self.get(id)?;
		let txn = doc.transact();
		ydoc::fields_map_ref(&txn)
	}

	pub fn get_fragment(&self, id: &DocumentId, field_name: &str) -> Option<XmlFragmentRef> {
		let doc = self.get(id)?;
		let txn = doc.transact();
		ydoc::fragment_ref(&txn, field_name)
	}

	pub fn apply_update(&self, id: &DocumentId, update: &[u8], origin: OriginTag) -> Result<()> {
		let doc = self.get_or_create(id);
		ydoc::apply_update_bytes(&doc, update, origin).map_err(Error::Reconciliation)
	}

	/// Captures the state vector before the transaction, runs `mutator`
	/// inside a single transaction tagged `origin`, and returns the
	/// encoded update covering exactly the changes made.
	pub fn transact_with_delta(
		&self,
		id: &DocumentId,
		origin: OriginTag,
		mutator: impl FnOnce(&mut TransactionMut<'_>, &MapRef),
	) -> Vec<u8> {
		let doc = self.get_or_create(id);
		let before = ydoc::encode_state_vector(&doc);
		{
			let mut txn = ydoc::transact_mut(&doc, origin);
			let fields = ydoc::fields_map(&mut txn);
			mutator(&mut txn, &fields);
		}
		ydoc::encode_update_since(&doc, &before)
	}

	pub fn encode_state_vector(&self, id: &DocumentId) -> Vec<u8> {
		let doc = self.get_or_create(id);
		ydoc::encode_state_vector(&doc)
	}

	pub fn encode_state(&self, id: &DocumentId) -> Vec<u8> {
		let doc = self.get_or_create(id);
		ydoc::full_state_update(&doc)
	}

	/// Removes `id` from the root's `documents` map and destroys the live
	/// instance (the "subdocs changed / removed" event performs the
	/// actual teardown).
	pub fn delete(&self, id: &DocumentId) {
		let mut txn = ydoc::transact_mut(&self.inner.root, OriginTag::Local);
		let documents = ydoc::documents_map(&mut txn);
		documents.remove(&mut txn, id.as_str());
	}

	/// Destroys the live instance and its persistence provider while
	/// keeping the `documents` map entry, so the sub-document can be
	/// reloaded later. Idempotent.
	pub fn unload(&self, id: &DocumentId) {
		if let Some((_, provider)) = self.inner.providers.remove(id) {
			provider.destroy();
		}
		self.inner.subdocs.remove(id);
	}

	/// Installs `factory`, immediately (and concurrently) creates
	/// providers for every existing sub-document, and arranges for
	/// sub-documents created afterward to receive one automatically.
	///
	/// Awaits the join of every created provider's `when_synced` before
	/// returning (spec.md §4.E startup step 1), logging and continuing
	/// past individual replay failures rather than failing startup.
	pub async fn enable_persistence(&self, factory: Arc<dyn PersistenceFactory>) {
		match self.inner.factory.write() {
			Ok(mut guard) => *guard = Some(Arc::clone(&factory)),
			Err(_) => {
				tracing::warn!("persistence factory lock poisoned, persistence stays disabled for this collection");
				return;
			}
		}
		let existing: Vec<(DocumentId, Doc)> =
			self.inner.subdocs.iter().map(|entry| (entry.key().clone(), entry.value().clone())).collect();
		let created = futures::future::join_all(existing.into_iter().map(|(id, doc)| {
			let factory = Arc::clone(&factory);
			async move {
				let provider = factory.create(id.clone(), doc).await;
				(id, provider)
			}
		}))
		.await;
		futures::future::join_all(created.iter().map(|(id, provider)| {
			let id = id.clone();
			let provider = Arc::clone(provider);
			async move {
				if let Err(err) = provider.when_synced().await {
					tracing::warn!(document = %id, error = %err, "sub-document persistence replay failed");
				}
			}
		}))
		.await;
		for (id, provider) in created {
			self.inner.providers.insert(id, provider);
		}
	}

	pub fn provider(&self, id: &DocumentId) -> Option<Arc<dyn DocPersistenceProvider>> {
		self.inner.providers.get(id).map(|entry| Arc::clone(entry.value()))
	}

	pub fn providers(&self) -> Vec<Arc<dyn DocPersistenceProvider>> {
		self.inner.providers.iter().map(|entry| Arc::clone(entry.value())).collect()
	}
}

impl Default for SubDocumentManager {
	fn default() -> Self {
		SubDocumentManager::new()
	}
}

fn handle_subdocs_event(inner: &Arc<Inner>, event: &yrs::SubdocsEvent) {
	for doc in event.added() {
		let id = DocumentId::from(ydoc::subdoc_guid(doc));
		inner.subdocs.entry(id.clone()).or_insert_with(|| doc.clone());
		maybe_spawn_persistence(inner, id, doc.clone());
	}
	for doc in event.loaded() {
		let id = DocumentId::from(ydoc::subdoc_guid(doc));
		inner.subdocs.entry(id).or_insert_with(|| doc.clone());
	}
	for doc in event.removed() {
		let id = DocumentId::from(ydoc::subdoc_guid(doc));
		if let Some((_, provider)) = inner.providers.remove(&id) {
			provider.destroy();
		}
		inner.subdocs.remove(&id);
	}
}

fn maybe_spawn_persistence(inner: &Arc<Inner>, id: DocumentId, doc: Doc) {
	if inner.providers.contains_key(&id) {
		return;
	}
	let Ok(guard) = inner.factory.read() else {
		tracing::warn!(document = %id, "persistence factory lock poisoned, skipping provider spawn");
		return;
	};
	let factory = guard.clone();
	drop(guard);
	let Some(factory) = factory else { return };
	let inner = Arc::clone(inner);
	tokio::spawn(async move {
		let provider = factory.create(id.clone(), doc).await;
		inner.providers.insert(id, provider);
	});
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn get_or_create_is_idempotent_and_tracks_documents() {
		let manager = SubDocumentManager::new();
		let id = DocumentId::from("r1");
		let first = manager.get_or_create(&id);
		let second = manager.get_or_create(&id);
		assert_eq!(ydoc::subdoc_guid(&first), ydoc::subdoc_guid(&second));
		assert!(manager.has(&id));
		assert_eq!(manager.documents(), vec![id]);
	}

	#[test]
	fn transact_with_delta_yields_nonempty_update_after_mutation() {
		let manager = SubDocumentManager::new();
		let id = DocumentId::from("r1");
		let delta = manager.transact_with_delta(&id, OriginTag::Local, |txn, fields| {
			fields.insert(txn, "title", "hello");
		});
		assert!(!ydoc::is_empty_update(&delta));
	}

	#[test]
	fn empty_transaction_yields_canonical_empty_update() {
		let manager = SubDocumentManager::new();
		let id = DocumentId::from("r1");
		let delta = manager.transact_with_delta(&id, OriginTag::Local, |_txn, _fields| {});
		assert!(ydoc::is_empty_update(&delta));
	}

	#[test]
	fn unload_keeps_map_entry_but_drops_live_instance() {
		let manager = SubDocumentManager::new();
		let id = DocumentId::from("r1");
		manager.get_or_create(&id);
		manager.unload(&id);
		assert!(!manager.has(&id));
	}
}

// vim: ts=4
