//! The consumed backend API (spec.md §6): a bag of typed function
//! references the collection is injected with. No transport is
//! implemented here — this crate only defines the contract, the same
//! way the teacher's `CrdtAdapter`/`RtdbAdapter` traits define a
//! pluggable-backend contract without picking an implementation.

use async_trait::async_trait;
use futures_core::Stream;
use serde_json::Value;
use std::fmt::Debug;
use std::pin::Pin;

use crate::error::Result;
use crate::ids::{ClientId, CollectionName, DocumentId, Seq};
use crate::material::MaterializedRow;

pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

/// Whether a wire change carries a full-document snapshot or an
/// incremental delta (spec.md GLOSSARY "Snapshot (wire)").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChangeKind {
	Snapshot,
	Delta,
}

/// One entry of a `stream()` response.
#[derive(Clone, Debug)]
pub struct Change {
	pub document: DocumentId,
	pub bytes: Vec<u8>,
	pub kind: ChangeKind,
	/// Whether the server considers the document to still exist.
	pub exists: bool,
}

/// A compaction hint accompanying a stream response.
#[derive(Clone, Debug, Default)]
pub struct CompactHint {
	pub documents: Vec<DocumentId>,
}

/// One page of the cursor-advancing change stream.
#[derive(Clone, Debug)]
pub struct StreamPage {
	pub changes: Vec<Change>,
	pub seq: Option<Seq>,
	pub more: bool,
	pub compact: Option<CompactHint>,
}

/// Result of an `insert`/`update`/`remove` mutation.
#[derive(Clone, Copy, Debug)]
pub struct MutationAck {
	pub success: bool,
	pub seq: Option<Seq>,
}

/// Result of a `recovery` query.
#[derive(Clone, Debug)]
pub struct RecoveryResponse {
	pub diff: Option<Vec<u8>>,
	pub vector: Vec<u8>,
}

/// A participant's public profile (name/color/avatar), as carried by
/// presence join payloads and session listings.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct Profile {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub color: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub avatar: Option<String>,
}

/// A row of `sessions()`: a remote client connected to a document.
#[derive(Clone, Debug)]
pub struct SessionInfo {
	pub client: ClientId,
	pub document: DocumentId,
	pub user: Option<Value>,
	pub profile: Option<Profile>,
	pub cursor: Option<Value>,
	pub seen: i64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PresenceAction {
	Join,
	Leave,
}

/// Payload of a `presence()` mutation.
#[derive(Clone, Debug, Default)]
pub struct PresencePayload {
	pub cursor: Option<Value>,
	pub user: Option<Value>,
	pub profile: Option<Profile>,
	pub interval_ms: Option<u64>,
	pub vector: Option<Vec<u8>>,
}

/// The backend query/mutation surface a collection is constructed with.
///
/// Every method corresponds 1:1 to a row of spec.md §6's table. No
/// default implementations are provided: every backend driver must make
/// an explicit choice for each, exactly like `CrdtAdapter`/`RtdbAdapter`.
#[async_trait]
pub trait BackendApi: Debug + Send + Sync {
	/// Subscribe to the cursor-advancing change stream from `seq`.
	async fn stream(
		&self,
		collection: &CollectionName,
		seq: Seq,
		limit: u32,
	) -> Result<BoxStream<Result<StreamPage>>>;

	async fn insert(
		&self,
		collection: &CollectionName,
		document: &DocumentId,
		bytes: Vec<u8>,
		material: MaterializedRow,
	) -> Result<MutationAck>;

	async fn update(
		&self,
		collection: &CollectionName,
		document: &DocumentId,
		bytes: Vec<u8>,
		material: MaterializedRow,
	) -> Result<MutationAck>;

	async fn remove(
		&self,
		collection: &CollectionName,
		document: &DocumentId,
		bytes: Vec<u8>,
	) -> Result<MutationAck>;

	async fn recovery(
		&self,
		collection: &CollectionName,
		document: &DocumentId,
		vector: Vec<u8>,
	) -> Result<RecoveryResponse>;

	async fn mark(
		&self,
		collection: &CollectionName,
		document: &DocumentId,
		client: &ClientId,
		seq: Seq,
		vector: Vec<u8>,
	) -> Result<()>;

	async fn compact(&self, collection: &CollectionName, document: &DocumentId) -> Result<()>;

	async fn sessions(
		&self,
		collection: &CollectionName,
		document: &DocumentId,
		exclude: &ClientId,
	) -> Result<BoxStream<Vec<SessionInfo>>>;

	async fn presence(
		&self,
		collection: &CollectionName,
		document: &DocumentId,
		client: &ClientId,
		action: PresenceAction,
		payload: PresencePayload,
	) -> Result<()>;
}

// vim: ts=4
