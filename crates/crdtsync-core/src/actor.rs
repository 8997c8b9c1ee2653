//! Write actor and manager (spec.md §4.D): serializes concurrent local
//! edits for one document into a single at-a-time outbound mutation with
//! batching, debounce and retry, and an observable pending flag.
//!
//! Grounded on the teacher's channel-actor style in `rtdb/websocket.rs`
//! and `core/ws_bus.rs` (one task per connection, a mailbox, a
//! `tokio::select!`-free read loop) and on `core/scheduler.rs` for the
//! retry/backoff shape (`CronSchedule`, task re-scheduling), generalized
//! here into exponential-jittered backoff with a bounded attempt count.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use crdtsync_types::error::SyncError;
use crdtsync_types::ids::DocumentId;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use yrs::Doc;

use crate::ydoc;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// The network sync a debounced task performs: given the state vector
/// last successfully pushed, push everything since then and return the
/// new "last pushed" vector on success (spec.md §4.D "Sync operation").
/// Implementations decide insert/update/remove and attach the
/// materialized row; the actor only knows about retry and debounce.
pub type SyncFn =
	Arc<dyn Fn(Vec<u8>) -> BoxFuture<Result<Vec<u8>, SyncError>> + Send + Sync>;

#[derive(Clone, Debug)]
pub struct ActorConfig {
	/// Window to let additional mailbox messages accrue before handling a
	/// batch (spec.md §4.D "Batch-accumulation policy"), ~2ms.
	pub batch_accumulation: Duration,
	/// Debounce delay before a scheduled sync actually runs.
	pub debounce: Duration,
	/// First retry backoff; doubles per attempt, jittered.
	pub retry_base: Duration,
	/// Bound on retry attempts within one sync.
	pub max_retries: u32,
}

impl Default for ActorConfig {
	fn default() -> Self {
		ActorConfig {
			batch_accumulation: Duration::from_millis(2),
			debounce: Duration::from_millis(200),
			retry_base: Duration::from_millis(100),
			max_retries: 3,
		}
	}
}

enum ActorMessage {
	LocalChange,
	ExternalUpdate,
	Shutdown(oneshot::Sender<()>),
}

struct Shared {
	document: DocumentId,
	subdoc: Doc,
	vector: StdMutex<Vec<u8>>,
	last_error: StdMutex<Option<SyncError>>,
	pending_tx: watch::Sender<bool>,
}

/// Per-document write actor handle (spec.md §3 "Write actor").
pub struct WriteActor {
	document: DocumentId,
	mailbox: mpsc::UnboundedSender<ActorMessage>,
	pending_rx: watch::Receiver<bool>,
	shared: Arc<Shared>,
	loop_handle: StdMutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for WriteActor {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WriteActor").field("document", &self.document).finish_non_exhaustive()
	}
}

impl WriteActor {
	pub fn document(&self) -> &DocumentId {
		&self.document
	}

	/// True iff a sync is scheduled or executing (spec.md §8 property 7).
	pub fn pending(&self) -> bool {
		*self.pending_rx.borrow()
	}

	/// Subscribe to pending-state changes. Dropping the receiver
	/// unsubscribes (spec.md §9 "Effectful reactive refs").
	pub fn on_pending_change(&self) -> watch::Receiver<bool> {
		self.pending_rx.clone()
	}

	pub fn last_error(&self) -> Option<SyncError> {
		self.shared.last_error.lock().ok().and_then(|guard| guard.clone())
	}

	fn notify(&self, message: ActorMessage) {
		// Mailbox receiver only goes away once the actor loop has
		// returned, which only happens after Shutdown; sends after that
		// point are silently dropped, matching a "fire and forget" queue.
		let _ = self.mailbox.send(message);
	}

	pub fn on_local_change(&self) {
		self.notify(ActorMessage::LocalChange);
	}

	pub fn on_server_update(&self) {
		self.notify(ActorMessage::ExternalUpdate);
	}

	/// Interrupts any in-flight debounce, awaits the loop's exit.
	pub async fn shutdown(&self) {
		let (done_tx, done_rx) = oneshot::channel();
		self.notify(ActorMessage::Shutdown(done_tx));
		let _ = done_rx.await;
		let handle = match self.loop_handle.lock() {
			Ok(mut guard) => guard.take(),
			Err(_) => {
				warn!(document = %self.document, "loop handle lock poisoned during shutdown");
				None
			}
		};
		if let Some(handle) = handle {
			let _ = handle.await;
		}
	}
}

/// Spawns the actor loop and returns the caller-facing handle.
fn spawn_actor(document: DocumentId, subdoc: Doc, sync_fn: SyncFn, config: ActorConfig) -> Arc<WriteActor> {
	let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
	let (pending_tx, pending_rx) = watch::channel(false);
	let initial_vector = ydoc::encode_state_vector(&subdoc);
	let shared = Arc::new(Shared {
		document: document.clone(),
		subdoc,
		vector: StdMutex::new(initial_vector),
		last_error: StdMutex::new(None),
		pending_tx,
	});

	let loop_shared = Arc::clone(&shared);
	let loop_handle = tokio::spawn(actor_loop(loop_shared, mailbox_rx, sync_fn, config));

	Arc::new(WriteActor {
		document,
		mailbox: mailbox_tx,
		pending_rx,
		shared,
		loop_handle: StdMutex::new(Some(loop_handle)),
	})
}

async fn actor_loop(
	shared: Arc<Shared>,
	mut mailbox: mpsc::UnboundedReceiver<ActorMessage>,
	sync_fn: SyncFn,
	config: ActorConfig,
) {
	let mut debounce_handle: Option<JoinHandle<()>> = None;

	loop {
		let Some(first) = mailbox.recv().await else {
			break;
		};

		tokio::time::sleep(config.batch_accumulation).await;

		let mut batch = vec![first];
		while let Ok(message) = mailbox.try_recv() {
			batch.push(message);
		}

		let mut has_local_change = false;
		let mut shutdown_signal = None;
		for message in batch {
			match message {
				ActorMessage::LocalChange => has_local_change = true,
				ActorMessage::ExternalUpdate => {
					let fresh = ydoc::encode_state_vector(&shared.subdoc);
					match shared.vector.lock() {
						Ok(mut guard) => *guard = fresh,
						Err(_) => warn!(document = %shared.document, "vector lock poisoned, dropping external update refresh"),
					}
				}
				ActorMessage::Shutdown(done) => shutdown_signal = Some(done),
			}
		}

		// Shutdown wins over any other messages in the batch.
		if let Some(done) = shutdown_signal {
			if let Some(handle) = debounce_handle.take() {
				handle.abort();
			}
			let _ = shared.pending_tx.send(false);
			let _ = done.send(());
			debug!(document = %shared.document, "write actor shut down");
			break;
		}

		if has_local_change {
			if let Some(handle) = debounce_handle.take() {
				handle.abort();
			}
			let _ = shared.pending_tx.send(true);
			debounce_handle = Some(tokio::spawn(debounced_sync(
				Arc::clone(&shared),
				Arc::clone(&sync_fn),
				config.clone(),
			)));
		}
	}
}

async fn debounced_sync(shared: Arc<Shared>, sync_fn: SyncFn, config: ActorConfig) {
	tokio::time::sleep(config.debounce).await;

	let mut attempt = 0u32;
	loop {
		let since = match shared.vector.lock() {
			Ok(guard) => guard.clone(),
			Err(_) => {
				warn!(document = %shared.document, "vector lock poisoned, abandoning sync");
				break;
			}
		};
		match sync_fn(since).await {
			Ok(new_vector) => {
				if let Ok(mut guard) = shared.vector.lock() {
					*guard = new_vector;
				} else {
					warn!(document = %shared.document, "vector lock poisoned, could not record synced vector");
				}
				if let Ok(mut guard) = shared.last_error.lock() {
					*guard = None;
				}
				debug!(document = %shared.document, "write actor sync succeeded");
				break;
			}
			Err(err) if err.retriable && attempt < config.max_retries => {
				attempt += 1;
				let backoff_ms = config.retry_base.as_millis() as u64 * (1u64 << attempt.min(20));
				let jittered = rand::rng().random_range(0..=backoff_ms.max(1));
				warn!(
					document = %shared.document,
					attempt,
					retry_in_ms = jittered,
					error = %err,
					"write actor sync failed, retrying"
				);
				tokio::time::sleep(Duration::from_millis(jittered)).await;
			}
			Err(err) => {
				warn!(document = %shared.document, error = %err, "write actor sync failed, giving up");
				if let Ok(mut guard) = shared.last_error.lock() {
					*guard = Some(err);
				}
				break;
			}
		}
	}

	let _ = shared.pending_tx.send(false);
}

/// Registered-actor counts (SPEC_FULL.md §11 "lock-free actor registry
/// statistics"), mirroring `BroadcastManager::stats`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ActorManagerStats {
	pub registered: usize,
	pub pending: usize,
}

/// Owns the actor registry: construction, lookup, message fan-out and
/// teardown (spec.md §4.D "Manager contract").
pub struct WriteActorManager {
	actors: DashMap<DocumentId, Arc<WriteActor>>,
	config: ActorConfig,
}

impl fmt::Debug for WriteActorManager {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WriteActorManager").field("registered", &self.actors.len()).finish()
	}
}

impl WriteActorManager {
	pub fn new(config: ActorConfig) -> Self {
		WriteActorManager { actors: DashMap::new(), config }
	}

	/// Idempotent: re-registering an already-registered document returns
	/// the existing actor untouched.
	pub fn register(&self, document: DocumentId, subdoc: Doc, sync_fn: SyncFn) -> Arc<WriteActor> {
		if let Some(existing) = self.actors.get(&document) {
			return Arc::clone(&existing);
		}
		let actor = spawn_actor(document.clone(), subdoc, sync_fn, self.config.clone());
		self.actors.entry(document).or_insert_with(|| Arc::clone(&actor));
		actor
	}

	pub fn get(&self, document: &DocumentId) -> Option<Arc<WriteActor>> {
		self.actors.get(document).map(|entry| Arc::clone(&entry))
	}

	pub fn on_local_change(&self, document: &DocumentId) {
		if let Some(actor) = self.get(document) {
			actor.on_local_change();
		}
	}

	pub fn on_server_update(&self, document: &DocumentId) {
		if let Some(actor) = self.get(document) {
			actor.on_server_update();
		}
	}

	/// Awaits the actor's shutdown and removes it from the registry.
	pub async fn unregister(&self, document: &DocumentId) {
		if let Some((_, actor)) = self.actors.remove(document) {
			actor.shutdown().await;
		}
	}

	pub async fn destroy(&self) {
		let documents: Vec<DocumentId> = self.actors.iter().map(|e| e.key().clone()).collect();
		for document in documents {
			self.unregister(&document).await;
		}
	}

	pub fn stats(&self) -> ActorManagerStats {
		let registered = self.actors.len();
		let pending = self.actors.iter().filter(|e| e.value().pending()).count();
		ActorManagerStats { registered, pending }
	}

	/// Snapshot of per-document pending state, for diagnostics.
	pub fn pending_by_document(&self) -> HashMap<DocumentId, bool> {
		self.actors.iter().map(|e| (e.key().clone(), e.value().pending())).collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::time::Duration as StdDuration;

	fn fast_config() -> ActorConfig {
		ActorConfig {
			batch_accumulation: StdDuration::from_millis(1),
			debounce: StdDuration::from_millis(5),
			retry_base: StdDuration::from_millis(1),
			max_retries: 2,
		}
	}

	#[tokio::test]
	async fn debounce_coalesces_a_burst_into_one_sync() {
		let calls = Arc::new(AtomicUsize::new(0));
		let calls2 = Arc::clone(&calls);
		let sync_fn: SyncFn = Arc::new(move |since: Vec<u8>| {
			let calls = Arc::clone(&calls2);
			Box::pin(async move {
				calls.fetch_add(1, Ordering::SeqCst);
				Ok(since)
			})
		});

		let manager = WriteActorManager::new(fast_config());
		let doc_id = DocumentId::from("r1");
		let subdoc = ydoc::new_subdoc(&doc_id);
		let actor = manager.register(doc_id.clone(), subdoc, sync_fn);

		for _ in 0..5 {
			actor.on_local_change();
		}
		tokio::time::sleep(StdDuration::from_millis(50)).await;

		assert_eq!(calls.load(Ordering::SeqCst), 1);
		assert!(!actor.pending());
	}

	#[tokio::test]
	async fn pending_is_true_while_debounce_and_sync_are_outstanding() {
		let sync_fn: SyncFn = Arc::new(|since: Vec<u8>| Box::pin(async move { Ok(since) }));
		let manager = WriteActorManager::new(fast_config());
		let doc_id = DocumentId::from("r1");
		let subdoc = ydoc::new_subdoc(&doc_id);
		let actor = manager.register(doc_id, subdoc, sync_fn);

		actor.on_local_change();
		assert!(actor.pending());
		tokio::time::sleep(StdDuration::from_millis(50)).await;
		assert!(!actor.pending());
	}

	#[tokio::test]
	async fn non_retriable_error_bypasses_retry_schedule() {
		let calls = Arc::new(AtomicUsize::new(0));
		let calls2 = Arc::clone(&calls);
		let sync_fn: SyncFn = Arc::new(move |_since: Vec<u8>| {
			let calls = Arc::clone(&calls2);
			Box::pin(async move {
				calls.fetch_add(1, Ordering::SeqCst);
				Err(SyncError::non_retriable(DocumentId::from("r1"), "401"))
			})
		});

		let manager = WriteActorManager::new(fast_config());
		let doc_id = DocumentId::from("r1");
		let subdoc = ydoc::new_subdoc(&doc_id);
		let actor = manager.register(doc_id, subdoc, sync_fn);

		actor.on_local_change();
		tokio::time::sleep(StdDuration::from_millis(50)).await;

		assert_eq!(calls.load(Ordering::SeqCst), 1);
		assert!(actor.last_error().is_some());
	}

	#[tokio::test]
	async fn retriable_error_retries_up_to_max_then_gives_up() {
		let calls = Arc::new(AtomicUsize::new(0));
		let calls2 = Arc::clone(&calls);
		let sync_fn: SyncFn = Arc::new(move |_since: Vec<u8>| {
			let calls = Arc::clone(&calls2);
			Box::pin(async move {
				calls.fetch_add(1, Ordering::SeqCst);
				Err(SyncError::retriable(DocumentId::from("r1"), "network blip"))
			})
		});

		let manager = WriteActorManager::new(fast_config());
		let doc_id = DocumentId::from("r1");
		let subdoc = ydoc::new_subdoc(&doc_id);
		let actor = manager.register(doc_id, subdoc, sync_fn);

		actor.on_local_change();
		tokio::time::sleep(StdDuration::from_millis(100)).await;

		// 1 initial attempt + max_retries(2) retries = 3 calls.
		assert_eq!(calls.load(Ordering::SeqCst), 3);
		assert!(actor.last_error().is_some());
		assert!(!actor.pending());
	}

	#[tokio::test]
	async fn shutdown_interrupts_debounce_and_completes() {
		let calls = Arc::new(AtomicUsize::new(0));
		let calls2 = Arc::clone(&calls);
		let sync_fn: SyncFn = Arc::new(move |since: Vec<u8>| {
			let calls = Arc::clone(&calls2);
			Box::pin(async move {
				calls.fetch_add(1, Ordering::SeqCst);
				Ok(since)
			})
		});

		let config = ActorConfig { debounce: StdDuration::from_millis(200), ..fast_config() };
		let manager = WriteActorManager::new(config);
		let doc_id = DocumentId::from("r1");
		let subdoc = ydoc::new_subdoc(&doc_id);
		let actor = manager.register(doc_id.clone(), subdoc, sync_fn);

		actor.on_local_change();
		manager.unregister(&doc_id).await;

		assert_eq!(calls.load(Ordering::SeqCst), 0);
		assert!(manager.get(&doc_id).is_none());
	}

	#[tokio::test]
	async fn register_is_idempotent() {
		let sync_fn: SyncFn = Arc::new(|since: Vec<u8>| Box::pin(async move { Ok(since) }));
		let manager = WriteActorManager::new(fast_config());
		let doc_id = DocumentId::from("r1");
		let subdoc = ydoc::new_subdoc(&doc_id);
		let first = manager.register(doc_id.clone(), subdoc.clone(), Arc::clone(&sync_fn));
		let second = manager.register(doc_id, subdoc, sync_fn);
		assert!(Arc::ptr_eq(&first, &second));
	}
}

// vim: ts=4
