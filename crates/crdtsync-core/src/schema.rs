//! Collection schema: declares which fields of a row are rich-text
//! ("prose") fields (spec.md §3 "Schema-derived invariants", §6
//! `schema.prose()` / `schema.prose.extract`).
//!
//! Grounded on the builder style of the teacher's `QueryFilter` /
//! `QueryOptions` (`rtdb_adapter.rs`): small structs assembled with
//! chained `with_*` methods rather than a derive macro, since this crate
//! carries no schema-validation dependency of its own.

use std::collections::HashSet;

use crdtsync_types::prose_json::extract_text;
use serde_json::Value;

/// The kind of a declared field. Only the "prose" marker changes how a
/// field round-trips through materialization; everything else is opaque
/// to the engine and passes through untouched.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FieldKind {
	Scalar,
	Prose,
}

#[derive(Clone, Debug)]
pub struct FieldSchema {
	pub name: String,
	pub kind: FieldKind,
}

/// A collection's field declarations. Only prose fields are tracked
/// specially; unlisted fields default to `Scalar` behavior.
#[derive(Clone, Debug, Default)]
pub struct CollectionSchema {
	fields: Vec<FieldSchema>,
}

impl CollectionSchema {
	pub fn new() -> Self {
		CollectionSchema::default()
	}

	pub fn with_field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
		self.fields.push(FieldSchema { name: name.into(), kind });
		self
	}

	pub fn with_prose(self, name: impl Into<String>) -> Self {
		self.with_field(name, FieldKind::Prose)
	}

	/// The set of field names carrying the "prose marker", computed once
	/// per collection as spec.md §3 describes.
	pub fn prose_fields(&self) -> HashSet<&str> {
		self.fields.iter().filter(|f| f.kind == FieldKind::Prose).map(|f| f.name.as_str()).collect()
	}

	pub fn is_prose(&self, field: &str) -> bool {
		self.fields.iter().any(|f| f.name == field && f.kind == FieldKind::Prose)
	}
}

/// `schema.prose()`: marks a field as a prose (rich-text) field.
pub fn prose() -> FieldKind {
	FieldKind::Prose
}

/// `schema.prose.extract(value)`.
pub fn extract(value: &Value) -> String {
	extract_text(value)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn prose_fields_tracks_only_marked_fields() {
		let schema = CollectionSchema::new().with_field("title", FieldKind::Scalar).with_prose("body");
		let prose = schema.prose_fields();
		assert!(prose.contains("body"));
		assert!(!prose.contains("title"));
		assert!(schema.is_prose("body"));
		assert!(!schema.is_prose("title"));
		assert!(!schema.is_prose("missing"));
	}
}

// vim: ts=4
