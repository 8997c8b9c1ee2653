//! Provenance tags attached to every CRDT transaction.
//!
//! Every mutation of a sub-document is tagged with one of these so
//! observers (the persistence replay hook, the write actor) can tell
//! local edits apart from remote ones and avoid feedback loops.

/// A provenance marker attached to every CRDT transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum OriginTag {
	/// A mutation made directly by application code (`insert`/`update`/`delete`).
	Local,
	/// A mutation made by the rich-text editor binding (prose fragment edits).
	Fragment,
	/// A mutation applying bytes received from the backend.
	Server,
	/// A mutation replayed from the persistence layer at startup.
	Persistence,
}

impl OriginTag {
	pub const fn as_str(self) -> &'static str {
		match self {
			OriginTag::Local => "local",
			OriginTag::Fragment => "fragment",
			OriginTag::Server => "server",
			OriginTag::Persistence => "persistence",
		}
	}

	pub fn from_str(s: &str) -> Option<Self> {
		match s {
			"local" => Some(OriginTag::Local),
			"fragment" => Some(OriginTag::Fragment),
			"server" => Some(OriginTag::Server),
			"persistence" => Some(OriginTag::Persistence),
			_ => None,
		}
	}

	/// True for origins that represent a change a write actor should push.
	pub const fn is_outbound_trigger(self) -> bool {
		matches!(self, OriginTag::Local | OriginTag::Fragment)
	}
}

impl std::fmt::Display for OriginTag {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

// vim: ts=4
