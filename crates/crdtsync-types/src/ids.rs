//! Opaque identifiers shared across the replication engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

macro_rules! interned_id {
	($name:ident, $doc:expr) => {
		#[doc = $doc]
		#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(Arc<str>);

		impl $name {
			pub fn new(value: impl Into<Arc<str>>) -> Self {
				Self(value.into())
			}

			pub fn as_str(&self) -> &str {
				&self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}", self.0)
			}
		}

		impl From<&str> for $name {
			fn from(value: &str) -> Self {
				Self(Arc::from(value))
			}
		}

		impl From<String> for $name {
			fn from(value: String) -> Self {
				Self(Arc::from(value))
			}
		}

		impl AsRef<str> for $name {
			fn as_ref(&self) -> &str {
				&self.0
			}
		}
	};
}

interned_id!(CollectionName, "Name of a collection, e.g. `\"notes\"`.");
interned_id!(DocumentId, "Key of a row/sub-document within a collection.");
interned_id!(ClientId, "Process-stable opaque id identifying this client to the backend.");

impl ClientId {
	/// Generate a fresh random client id (UUID v4 rendered as a string).
	///
	/// Generation itself has no crate dependency on a random source here;
	/// callers (the session bootstrap in `crdtsync-core::collection`) supply
	/// the generated string so this type stays free of a `uuid` dependency.
	pub fn from_generated(raw: impl Into<Arc<str>>) -> Self {
		Self(raw.into())
	}
}

/// Monotonic per-collection sequence number handed out by the backend.
pub type Seq = u64;

// vim: ts=4
