//! Error handling subsystem. Implements a custom Error type.
//!
//! Mirrors the manual `Error` enum + `From` impl style of a hand-rolled
//! domain error (no `derive(thiserror::Error)`): one flat enum, a
//! `Result` alias, and targeted `From` conversions at the edges.

use crate::ids::DocumentId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
	/// A backend network call failed (transport error, non-2xx, decode failure).
	Network(String),
	/// Reading from the persistence layer (KV or doc log) failed.
	PersistenceRead(String),
	/// Writing to the persistence layer failed. Callers log and continue
	/// in-memory per spec.md §7 ("Persistence I/O (write)").
	PersistenceWrite(String),
	/// The backend rejected a mutation in a way that must not be retried
	/// (HTTP 401/403/422 equivalents).
	NonRetriable(String),
	/// A recovery/reconciliation round failed; logged and swallowed by the
	/// sync coordinator, since the live stream is expected to converge.
	Reconciliation(String),
	/// `utils::prose` could not find the sub-document/fragment/context
	/// within its grace period.
	ProseBindingTimeout { document: DocumentId, field: String, collection: String },
	/// The collection was accessed before `init()` completed.
	NotReady(String),
	/// JSON (de)serialization failure.
	Serde(String),
	/// Internal invariant violation — should not happen in correct code.
	Internal(String),
}

impl std::fmt::Display for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Error::Network(msg) => write!(f, "network error: {msg}"),
			Error::PersistenceRead(msg) => write!(f, "persistence read error: {msg}"),
			Error::PersistenceWrite(msg) => write!(f, "persistence write error: {msg}"),
			Error::NonRetriable(msg) => write!(f, "non-retriable backend error: {msg}"),
			Error::Reconciliation(msg) => write!(f, "reconciliation error: {msg}"),
			Error::ProseBindingTimeout { document, field, collection } => write!(
				f,
				"prose binding timed out for {collection}/{document} field {field}"
			),
			Error::NotReady(what) => write!(f, "not ready: {what}"),
			Error::Serde(msg) => write!(f, "serialization error: {msg}"),
			Error::Internal(msg) => write!(f, "internal error: {msg}"),
		}
	}
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		Error::Serde(err.to_string())
	}
}

impl From<std::io::Error> for Error {
	fn from(err: std::io::Error) -> Self {
		Error::PersistenceRead(err.to_string())
	}
}

/// The only error type that flows through the write actor's retry
/// schedule (spec.md §4.D "Failure taxonomy").
#[derive(Debug, Clone)]
pub struct SyncError {
	pub document: DocumentId,
	pub cause: String,
	pub retriable: bool,
}

impl SyncError {
	pub fn retriable(document: DocumentId, cause: impl Into<String>) -> Self {
		Self { document, cause: cause.into(), retriable: true }
	}

	pub fn non_retriable(document: DocumentId, cause: impl Into<String>) -> Self {
		Self { document, cause: cause.into(), retriable: false }
	}
}

impl std::fmt::Display for SyncError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "sync error for {}: {} (retriable={})", self.document, self.cause, self.retriable)
	}
}

impl std::error::Error for SyncError {}

impl From<Error> for SyncError {
	fn from(err: Error) -> Self {
		let retriable = !matches!(err, Error::NonRetriable(_));
		SyncError { document: DocumentId::from(""), cause: err.to_string(), retriable }
	}
}

// vim: ts=4
