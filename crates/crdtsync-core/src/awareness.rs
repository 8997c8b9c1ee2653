//! Awareness provider (spec.md §4.F): publishes this participant's
//! presence (cursor, profile, state vector) on a heartbeat and maps the
//! remote participant subscription into the CRDT library's awareness
//! primitive, governed by a small join/active/leaving/destroyed state
//! machine.
//!
//! Grounded on `core/ws_broadcast.rs`'s channel-per-topic shape for the
//! awareness primitive's update event, and on `core/scheduler.rs`'s
//! periodic-task spawn pattern for the heartbeat loop. The anonymous
//! name/color dictionaries and djb2-style hash are a direct re-expression
//! of spec.md §4.F "Remote subscription" (no external collaborator
//! covers this; it is inherent engine logic, not vendored).

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use crdtsync_types::backend::{BackendApi, PresenceAction, PresencePayload, Profile, SessionInfo};
use crdtsync_types::ids::{ClientId, CollectionName, DocumentId};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Derive a stable numeric id for a remote client id: a 32-bit djb2-style
/// hash (multiply-and-add), masked to 32 bits, absolute value. Collisions
/// are possible but tolerated — the UI key is the client id string, not
/// this numeric id (spec.md §9 open question).
pub fn hash_client_id(id: &ClientId) -> u32 {
	let mut hash: i32 = 5381;
	for byte in id.as_str().bytes() {
		hash = hash.wrapping_mul(33).wrapping_add(i32::from(byte));
	}
	hash.unsigned_abs()
}

const ADJECTIVES: [&str; 10] =
	["Quick", "Clever", "Bright", "Gentle", "Bold", "Calm", "Eager", "Fuzzy", "Jolly", "Swift"];
const NOUNS: [&str; 10] =
	["Fox", "Otter", "Falcon", "Panda", "Tiger", "Wren", "Lynx", "Heron", "Moth", "Seal"];
/// A warm-palette swatch, ten entries, indexed by a different
/// bit-shifted slice of the hash than the name dictionaries.
const COLORS: [&str; 10] = [
	"#FF6B6B", "#FFA94D", "#FFD43B", "#FF8787", "#F783AC", "#E64980", "#FA5252", "#FD7E14",
	"#F08C00", "#E8590C",
];

/// Derive a stable anonymous `(name, color)` pair from a client id hash
/// when the remote session carries no profile.
pub fn anonymous_identity(hash: u32) -> (String, &'static str) {
	let adjective = ADJECTIVES[(hash & 0xF) as usize % ADJECTIVES.len()];
	let noun = NOUNS[((hash >> 4) & 0xF) as usize % NOUNS.len()];
	let color = COLORS[((hash >> 8) & 0xF) as usize % COLORS.len()];
	(format!("{adjective} {noun}"), color)
}

#[derive(Clone, Debug, PartialEq)]
pub struct UserInfo {
	pub name: Option<String>,
	pub color: Option<String>,
	pub avatar: Option<String>,
	pub client_id: ClientId,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AwarenessEntry {
	pub user: UserInfo,
	pub cursor: Option<Value>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AwarenessOrigin {
	Local,
	Remote,
}

/// Emitted whenever the awareness primitive's state set changes
/// (spec.md §4.F "Remote subscription": "one `update` event... with
/// origin").
#[derive(Clone, Debug)]
pub struct AwarenessUpdate {
	pub added: Vec<u32>,
	pub updated: Vec<u32>,
	pub removed: Vec<u32>,
	pub origin: AwarenessOrigin,
}

/// The CRDT library's awareness primitive, represented structurally: a
/// map of numeric client id -> ephemeral state, keyed the way
/// y-protocols' `Awareness` is (SPEC_FULL.md §1 "Rich-text editor /
/// awareness primitive").
pub struct Awareness {
	local_id: u32,
	local_client_id: ClientId,
	states: StdMutex<HashMap<u32, AwarenessEntry>>,
	events: broadcast::Sender<AwarenessUpdate>,
	local_changes: broadcast::Sender<()>,
}

impl fmt::Debug for Awareness {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Awareness").field("local_id", &self.local_id).finish_non_exhaustive()
	}
}

impl Awareness {
	pub fn new(local_client_id: ClientId) -> Arc<Self> {
		let local_id = hash_client_id(&local_client_id);
		let (events, _) = broadcast::channel(64);
		let (local_changes, _) = broadcast::channel(64);
		Arc::new(Awareness {
			local_id,
			local_client_id,
			states: StdMutex::new(HashMap::new()),
			events,
			local_changes,
		})
	}

	pub fn local_id(&self) -> u32 {
		self.local_id
	}

	pub fn states(&self) -> HashMap<u32, AwarenessEntry> {
		self.states.lock().map(|guard| guard.clone()).unwrap_or_default()
	}

	pub fn subscribe(&self) -> broadcast::Receiver<AwarenessUpdate> {
		self.events.subscribe()
	}

	fn subscribe_local_changes(&self) -> broadcast::Receiver<()> {
		self.local_changes.subscribe()
	}

	/// A cursor move or profile change on this client (spec.md §4.F
	/// "Local awareness events"). Triggers a throttled join when a
	/// provider is attached.
	pub fn set_local_cursor(&self, cursor: Option<Value>) {
		let Ok(mut states) = self.states.lock() else {
			warn!(client = %self.local_client_id, "awareness states lock poisoned, dropping local cursor update");
			return;
		};
		let entry = states.entry(self.local_id).or_insert_with(|| AwarenessEntry {
			user: UserInfo { name: None, color: None, avatar: None, client_id: self.local_client_id.clone() },
			cursor: None,
		});
		entry.cursor = cursor;
		drop(states);
		let _ = self.local_changes.send(());
	}

	pub fn set_local_profile(&self, profile: Profile) {
		let Ok(mut states) = self.states.lock() else {
			warn!(client = %self.local_client_id, "awareness states lock poisoned, dropping local profile update");
			return;
		};
		let entry = states.entry(self.local_id).or_insert_with(|| AwarenessEntry {
			user: UserInfo { name: None, color: None, avatar: None, client_id: self.local_client_id.clone() },
			cursor: None,
		});
		entry.user.name = profile.name;
		entry.user.color = profile.color;
		entry.user.avatar = profile.avatar;
		drop(states);
		let _ = self.local_changes.send(());
	}

	/// Reconciles the live remote-participant set against `new`,
	/// removing any previously present remote absent from it, and emits
	/// exactly one combined update (spec.md §4.F "Remote subscription").
	fn apply_remote_batch(&self, new: HashMap<u32, AwarenessEntry>) -> AwarenessUpdate {
		let Ok(mut states) = self.states.lock() else {
			warn!(client = %self.local_client_id, "awareness states lock poisoned, dropping remote batch");
			return AwarenessUpdate { added: vec![], updated: vec![], removed: vec![], origin: AwarenessOrigin::Remote };
		};
		let mut added = Vec::new();
		let mut updated = Vec::new();
		for (id, entry) in &new {
			if states.contains_key(id) {
				updated.push(*id);
			} else {
				added.push(*id);
			}
			states.insert(*id, entry.clone());
		}
		let local_id = self.local_id;
		let removed: Vec<u32> =
			states.keys().filter(|id| **id != local_id && !new.contains_key(id)).copied().collect();
		for id in &removed {
			states.remove(id);
		}
		drop(states);
		let update = AwarenessUpdate { added, updated, removed, origin: AwarenessOrigin::Remote };
		let _ = self.events.send(update.clone());
		update
	}

	/// Drops all remote entries, emitting a final update
	/// (spec.md §4.F "Destroy").
	fn clear_remote(&self) -> AwarenessUpdate {
		let Ok(mut states) = self.states.lock() else {
			warn!(client = %self.local_client_id, "awareness states lock poisoned, dropping remote clear");
			return AwarenessUpdate { added: vec![], updated: vec![], removed: vec![], origin: AwarenessOrigin::Remote };
		};
		let local_id = self.local_id;
		let removed: Vec<u32> = states.keys().filter(|id| **id != local_id).copied().collect();
		for id in &removed {
			states.remove(id);
		}
		drop(states);
		let update = AwarenessUpdate { added: vec![], updated: vec![], removed, origin: AwarenessOrigin::Remote };
		let _ = self.events.send(update.clone());
		update
	}
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PresenceState {
	Idle,
	Joining,
	Active,
	Leaving,
	Destroyed,
}

fn can_transition(from: PresenceState, to: PresenceState) -> bool {
	use PresenceState::{Active, Destroyed, Idle, Joining, Leaving};
	matches!(
		(from, to),
		(Idle, Joining)
			| (Idle, Destroyed)
			| (Joining, Active)
			| (Joining, Leaving)
			| (Joining, Destroyed)
			| (Active, Leaving)
			| (Active, Destroyed)
			| (Leaving, Idle)
			| (Leaving, Joining)
			| (Leaving, Destroyed)
	)
}

#[derive(Clone, Debug)]
pub struct AwarenessConfig {
	pub heartbeat_interval: Duration,
	pub update_throttle: Duration,
}

impl Default for AwarenessConfig {
	fn default() -> Self {
		AwarenessConfig { heartbeat_interval: Duration::from_secs(10), update_throttle: Duration::from_millis(50) }
	}
}

/// What the provider announces about this participant.
#[derive(Clone, Debug, Default)]
pub struct LocalPresence {
	pub user: Option<Value>,
	pub profile: Option<Profile>,
}

struct Shared {
	collection: CollectionName,
	document: DocumentId,
	client_id: ClientId,
	backend: Arc<dyn BackendApi>,
	awareness: Arc<Awareness>,
	config: AwarenessConfig,
	local: LocalPresence,
	vector_fn: Box<dyn Fn() -> Vec<u8> + Send + Sync>,
	cursor_fn: Box<dyn Fn() -> Option<Value> + Send + Sync>,
	state: StdMutex<PresenceState>,
	in_flight: StdMutex<bool>,
	pending: StdMutex<Option<(PresenceAction, PresencePayload)>>,
	visible: AtomicBool,
}

impl Shared {
	fn transition(&self, to: PresenceState) -> bool {
		let Ok(mut state) = self.state.lock() else {
			warn!(document = %self.document, "presence state lock poisoned, refusing transition");
			return false;
		};
		if *state == to || can_transition(*state, to) {
			*state = to;
			true
		} else {
			false
		}
	}

	/// Poisoned-lock fallback is `Destroyed`: callers treat an unreadable
	/// state as "stop", never as "proceed as if active".
	fn state(&self) -> PresenceState {
		self.state.lock().map(|guard| *guard).unwrap_or(PresenceState::Destroyed)
	}

	fn join_payload(&self) -> PresencePayload {
		PresencePayload {
			cursor: (self.cursor_fn)(),
			user: self.local.user.clone(),
			profile: self.local.profile.clone(),
			interval_ms: Some(self.config.heartbeat_interval.as_millis() as u64),
			vector: Some((self.vector_fn)()),
		}
	}

	fn leave_payload(&self) -> PresencePayload {
		PresencePayload { cursor: None, user: None, profile: None, interval_ms: None, vector: None }
	}
}

/// Owns the CRDT library's awareness primitive for one sub-document and
/// drives the join/active/leaving/destroyed state machine around it
/// (spec.md §4.F).
pub struct AwarenessProvider {
	shared: Arc<Shared>,
	heartbeat: JoinHandle<()>,
	local_listener: JoinHandle<()>,
	remote_sub: JoinHandle<()>,
	throttle_slot: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl fmt::Debug for AwarenessProvider {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("AwarenessProvider")
			.field("document", &self.shared.document)
			.field("state", &self.shared.state())
			.finish()
	}
}

impl AwarenessProvider {
	/// `sync_ready` is the §4.E "ready" collection signal: the heartbeat
	/// loop does not start until it resolves (spec.md §4.F "Initial
	/// delay"). Dropping this future's backing sender without it ever
	/// resolving simply means the heartbeat never starts, same as the
	/// source's unresolved promise.
	pub fn start(
		collection: CollectionName,
		document: DocumentId,
		client_id: ClientId,
		backend: Arc<dyn BackendApi>,
		awareness: Arc<Awareness>,
		config: AwarenessConfig,
		local: LocalPresence,
		vector_fn: Box<dyn Fn() -> Vec<u8> + Send + Sync>,
		cursor_fn: Box<dyn Fn() -> Option<Value> + Send + Sync>,
		sync_ready: impl std::future::Future<Output = ()> + Send + 'static,
	) -> Arc<Self> {
		let shared = Arc::new(Shared {
			collection,
			document,
			client_id,
			backend,
			awareness,
			config,
			local,
			vector_fn,
			cursor_fn,
			state: StdMutex::new(PresenceState::Idle),
			in_flight: StdMutex::new(false),
			pending: StdMutex::new(None),
			visible: AtomicBool::new(true),
		});

		let heartbeat_shared = Arc::clone(&shared);
		let heartbeat = tokio::spawn(async move {
			tokio::task::yield_now().await;
			sync_ready.await;
			heartbeat_loop(heartbeat_shared).await;
		});

		let local_shared = Arc::clone(&shared);
		let throttle_slot = Arc::new(StdMutex::new(None));
		let local_throttle_slot = Arc::clone(&throttle_slot);
		let mut local_rx = shared.awareness.subscribe_local_changes();
		let local_listener = tokio::spawn(async move {
			while local_rx.recv().await.is_ok() {
				throttle_join(&local_shared, &local_throttle_slot);
			}
		});

		let remote_shared = Arc::clone(&shared);
		let remote_sub = tokio::spawn(remote_subscription_loop(remote_shared));

		Arc::new(AwarenessProvider { shared, heartbeat, local_listener, remote_sub, throttle_slot })
	}

	pub fn state(&self) -> PresenceState {
		self.shared.state()
	}

	pub fn awareness(&self) -> &Arc<Awareness> {
		&self.shared.awareness
	}

	/// `visibilitychange` handler (spec.md §4.F "Visibility handling").
	pub fn set_visible(&self, visible: bool) {
		let was_visible = self.shared.visible.swap(visible, Ordering::SeqCst);
		if visible == was_visible {
			return;
		}
		let shared = Arc::clone(&self.shared);
		if visible {
			tokio::spawn(async move { send_join(&shared).await });
		} else {
			shared.transition(PresenceState::Leaving);
			tokio::spawn(async move { send_leave(&shared).await });
		}
	}

	/// `pagehide` (non-persisted): best-effort leave, no state
	/// transition, since the page is going away (spec.md §4.F).
	pub fn page_hide(&self) {
		let backend = Arc::clone(&self.shared.backend);
		let collection = self.shared.collection.clone();
		let document = self.shared.document.clone();
		let client_id = self.shared.client_id.clone();
		let payload = self.shared.leave_payload();
		tokio::spawn(async move {
			let _ = backend.presence(&collection, &document, &client_id, PresenceAction::Leave, payload).await;
		});
	}

	/// Tears the provider down (spec.md §4.F "Destroy").
	pub async fn destroy(&self) {
		if !self.shared.transition(PresenceState::Destroyed) {
			return;
		}
		self.heartbeat.abort();
		self.local_listener.abort();
		self.remote_sub.abort();
		match self.throttle_slot.lock() {
			Ok(mut guard) => {
				if let Some(handle) = guard.take() {
					handle.abort();
				}
			}
			Err(_) => warn!(document = %self.shared.document, "throttle slot lock poisoned during destroy"),
		}
		if let Ok(mut pending) = self.shared.pending.lock() {
			*pending = None;
		}
		self.shared.awareness.clear_remote();
		send_leave(&self.shared).await;
		debug!(document = %self.shared.document, "awareness provider destroyed");
	}
}

fn throttle_join(shared: &Arc<Shared>, slot: &Arc<StdMutex<Option<JoinHandle<()>>>>) {
	let Ok(mut guard) = slot.lock() else {
		warn!(document = %shared.document, "throttle slot lock poisoned, dropping throttled join");
		return;
	};
	if guard.is_some() {
		return;
	}
	let shared = Arc::clone(shared);
	let slot = Arc::clone(slot);
	*guard = Some(tokio::spawn(async move {
		tokio::time::sleep(shared.config.update_throttle).await;
		send_join(&shared).await;
		if let Ok(mut guard) = slot.lock() {
			*guard = None;
		}
	}));
}

async fn heartbeat_loop(shared: Arc<Shared>) {
	loop {
		tokio::time::sleep(shared.config.heartbeat_interval).await;
		if shared.state() == PresenceState::Destroyed {
			break;
		}
		if matches!(shared.state(), PresenceState::Idle | PresenceState::Leaving)
			&& shared.visible.load(Ordering::SeqCst)
		{
			send_join(&shared).await;
		}
	}
}

async fn send_join(shared: &Arc<Shared>) {
	if !shared.transition(PresenceState::Joining) && shared.state() != PresenceState::Joining {
		return;
	}
	let payload = shared.join_payload();
	mutate(shared, PresenceAction::Join, payload).await;
}

async fn send_leave(shared: &Arc<Shared>) {
	let payload = shared.leave_payload();
	mutate(shared, PresenceAction::Leave, payload).await;
}

/// At most one presence mutation in flight per provider; a superseded
/// payload is coalesced into a single "next" slot (spec.md §4.F
/// "Single-flight mutation").
async fn mutate(shared: &Arc<Shared>, action: PresenceAction, payload: PresencePayload) {
	{
		let Ok(mut in_flight) = shared.in_flight.lock() else {
			warn!(document = %shared.document, "in_flight lock poisoned, dropping presence mutation");
			return;
		};
		if *in_flight {
			if let Ok(mut pending) = shared.pending.lock() {
				*pending = Some((action, payload));
			}
			return;
		}
		*in_flight = true;
	}

	let mut action = action;
	let mut payload = payload;
	loop {
		let result = shared
			.backend
			.presence(&shared.collection, &shared.document, &shared.client_id, action, payload)
			.await;
		match result {
			Ok(()) => {
				if action == PresenceAction::Join && shared.state() == PresenceState::Joining {
					shared.transition(PresenceState::Active);
				}
			}
			Err(err) => warn!(document = %shared.document, error = %err, "presence mutation failed"),
		}

		let next = shared.pending.lock().ok().and_then(|mut guard| guard.take());
		match next {
			Some((next_action, next_payload)) => {
				action = next_action;
				payload = next_payload;
			}
			None => break,
		}
	}

	if let Ok(mut in_flight) = shared.in_flight.lock() {
		*in_flight = false;
	}
}

async fn remote_subscription_loop(shared: Arc<Shared>) {
	let stream = shared.backend.sessions(&shared.collection, &shared.document, &shared.client_id).await;
	let mut stream = match stream {
		Ok(stream) => stream,
		Err(err) => {
			warn!(document = %shared.document, error = %err, "presence subscription failed");
			return;
		}
	};
	while let Some(sessions) = stream.next().await {
		let batch = sessions_to_entries(&sessions);
		shared.awareness.apply_remote_batch(batch);
	}
}

fn sessions_to_entries(sessions: &[SessionInfo]) -> HashMap<u32, AwarenessEntry> {
	let mut out = HashMap::with_capacity(sessions.len());
	for session in sessions {
		let numeric_id = hash_client_id(&session.client);
		let (name, color) = match &session.profile {
			Some(profile) if profile.name.is_some() || profile.color.is_some() => {
				(profile.name.clone(), profile.color.clone())
			}
			_ => {
				let (anon_name, anon_color) = anonymous_identity(numeric_id);
				(Some(anon_name), Some(anon_color.to_string()))
			}
		};
		let avatar = session.profile.as_ref().and_then(|p| p.avatar.clone());
		out.insert(
			numeric_id,
			AwarenessEntry {
				user: UserInfo { name, color, avatar, client_id: session.client.clone() },
				cursor: session.cursor.clone(),
			},
		);
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hash_is_stable_and_masked_to_u32() {
		let a = hash_client_id(&ClientId::from("client-one"));
		let b = hash_client_id(&ClientId::from("client-one"));
		let c = hash_client_id(&ClientId::from("client-two"));
		assert_eq!(a, b);
		assert_ne!(a, c);
	}

	#[test]
	fn anonymous_identity_is_deterministic_per_hash() {
		let (name1, color1) = anonymous_identity(42);
		let (name2, color2) = anonymous_identity(42);
		assert_eq!(name1, name2);
		assert_eq!(color1, color2);
	}

	#[test]
	fn transition_table_matches_spec_graph() {
		use PresenceState::{Active, Destroyed, Idle, Joining, Leaving};
		assert!(can_transition(Idle, Joining));
		assert!(can_transition(Idle, Destroyed));
		assert!(!can_transition(Idle, Active));
		assert!(can_transition(Joining, Active));
		assert!(can_transition(Leaving, Joining));
		assert!(!can_transition(Destroyed, Idle));
		assert!(can_transition(Active, Leaving));
	}

	#[test]
	fn apply_remote_batch_tracks_added_updated_removed() {
		let awareness = Awareness::new(ClientId::from("me"));
		let remote = ClientId::from("them");
		let remote_id = hash_client_id(&remote);

		let mut first = HashMap::new();
		first.insert(
			remote_id,
			AwarenessEntry {
				user: UserInfo { name: Some("Ann".into()), color: Some("#f00".into()), avatar: None, client_id: remote.clone() },
				cursor: None,
			},
		);
		let update = awareness.apply_remote_batch(first);
		assert_eq!(update.added, vec![remote_id]);
		assert!(update.removed.is_empty());

		let update = awareness.apply_remote_batch(HashMap::new());
		assert_eq!(update.removed, vec![remote_id]);
		assert!(awareness.states().is_empty());
	}

	#[test]
	fn local_cursor_change_notifies_without_touching_remote_states() {
		let awareness = Awareness::new(ClientId::from("me"));
		let mut rx = awareness.subscribe_local_changes();
		awareness.set_local_cursor(Some(Value::from(3)));
		assert!(rx.try_recv().is_ok());
		assert_eq!(awareness.states().len(), 1);
	}
}

// vim: ts=4
