//! Materialized rows and the server-rendered bootstrap `Material` shape
//! (spec.md §3 "Materialized row", §6 "Material shape").

use crate::ids::{DocumentId, Seq};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// A plain record derived from a sub-document's `fields` map. `id` is
/// always present and equal to the owning sub-document's key.
pub type MaterializedRow = Map<String, Value>;

pub fn row_id(row: &MaterializedRow) -> Option<&str> {
	row.get("id").and_then(Value::as_str)
}

/// One `(doc_id -> {bytes, seq})` entry of a material's `crdt` bootstrap map.
#[derive(Clone, Debug)]
pub struct CrdtBootstrap {
	pub bytes: Vec<u8>,
	pub seq: Option<Seq>,
}

/// Server-rendered bootstrap material, optionally accompanying `init()`.
#[derive(Clone, Debug, Default)]
pub struct Material {
	pub documents: Vec<MaterializedRow>,
	pub cursor: Option<Seq>,
	pub count: Option<u64>,
	pub crdt: HashMap<DocumentId, CrdtBootstrap>,
}

// vim: ts=4
