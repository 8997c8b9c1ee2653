//! Materialization & ops bridge (spec.md §4.C): convert between a
//! sub-document's `fields` map and a plain `MaterializedRow`, and apply
//! bulk changes to the reactive store through its transactional handle.
//!
//! Grounded on `rtdb_adapter.rs`'s `Transaction` trait (`begin`/`write`/
//! `truncate`/`commit`) for the ops handle shape.

use std::sync::Arc;

use crdtsync_types::error::Result;
use crdtsync_types::material::MaterializedRow;
use crdtsync_types::prose_json::is_prosemirror_doc;
use serde_json::{Map, Value};
use yrs::{Map as YMapTrait, ReadTxn, TransactionMut, Value as YValue};

use crate::schema::CollectionSchema;
use crate::store::{ReactiveStore, WriteKind};
use crate::ydoc;

/// Serialize a sub-document's `fields` map into a plain record, with
/// `id` injected from the document key (spec.md §4.C).
pub fn serialize<T: ReadTxn>(txn: &T, doc_id: &str, fields: &yrs::MapRef) -> MaterializedRow {
	let mut row = Map::new();
	for (key, value) in fields.iter(txn) {
		let json = match value {
			YValue::YXmlFragment(frag) => serde_json::to_value(ydoc::fragment_to_prose(txn, &frag))
				.unwrap_or(Value::Null),
			other => ydoc::value_to_json(txn, &other),
		};
		row.insert(key.to_string(), json);
	}
	row.insert("id".to_string(), Value::String(doc_id.to_string()));
	row
}

/// Apply an incoming record to a sub-document's `fields` map (spec.md
/// §4.C hydration rules, reverse path of `serialize`).
///
/// A prose field whose incoming value is a ProseMirror doc becomes a
/// rich-text fragment; everything else is written as a scalar, except
/// that an existing fragment is never clobbered by a scalar write
/// (spec.md §3 "Schema-derived invariants").
pub fn hydrate(txn: &mut TransactionMut<'_>, fields: &yrs::MapRef, schema: &CollectionSchema, row: &MaterializedRow) {
	let prose_fields = schema.prose_fields();
	for (key, value) in row {
		if key == "id" {
			continue;
		}
		if prose_fields.contains(key.as_str()) && is_prosemirror_doc(value) {
			if let Ok(prose) = serde_json::from_value(value.clone()) {
				let frag = ydoc::fragment_of(txn, key);
				ydoc::fragment_from_prose(txn, &frag, &prose);
			}
			continue;
		}
		if matches!(fields.get(txn, key), Some(YValue::YXmlFragment(_))) {
			continue;
		}
		if let Ok(any) = json_to_any(value) {
			fields.insert(txn, key.clone(), any);
		}
	}
}

fn json_to_any(value: &Value) -> Result<yrs::Any> {
	serde_json::from_value::<yrs::Any>(value.clone())
		.map_err(|e| crdtsync_types::error::Error::Serde(e.to_string()))
}

/// One `{type, value}` write item queued between a `begin`/`commit` pair.
#[derive(Clone, Debug)]
pub enum OpItem {
	Insert(MaterializedRow),
	Upsert(MaterializedRow),
	Delete(MaterializedRow),
}

/// Wraps a `ReactiveStore`'s `{begin, write, truncate, commit}` handle
/// into the four bulk operations the coordinator needs, each performing
/// exactly one transaction (spec.md §4.C "Ops handle").
pub struct OpsHandle {
	store: Arc<dyn ReactiveStore>,
}

impl OpsHandle {
	pub fn new(store: Arc<dyn ReactiveStore>) -> Self {
		OpsHandle { store }
	}

	pub async fn insert(&self, items: Vec<MaterializedRow>) -> Result<()> {
		self.write_batch(items.into_iter().map(OpItem::Insert).collect()).await
	}

	pub async fn upsert(&self, items: Vec<MaterializedRow>) -> Result<()> {
		self.write_batch(items.into_iter().map(OpItem::Upsert).collect()).await
	}

	pub async fn delete(&self, items: Vec<MaterializedRow>) -> Result<()> {
		self.write_batch(items.into_iter().map(OpItem::Delete).collect()).await
	}

	/// `begin; truncate; write inserts; commit` — full re-hydration.
	pub async fn replace(&self, items: Vec<MaterializedRow>) -> Result<()> {
		let mut txn = self.store.begin().await?;
		txn.truncate().await?;
		for item in items {
			txn.write(WriteKind::Insert, item).await?;
		}
		txn.commit().await
	}

	/// Applies a mix of insert/upsert/delete items in exactly one
	/// transaction (spec.md §8 testable property 3 "batch atomicity": a
	/// stream response's changes are all visible or none are).
	pub async fn apply_batch(&self, items: Vec<OpItem>) -> Result<()> {
		self.write_batch(items).await
	}

	async fn write_batch(&self, items: Vec<OpItem>) -> Result<()> {
		let mut txn = self.store.begin().await?;
		for item in items {
			let (kind, row) = match item {
				OpItem::Insert(row) => (WriteKind::Insert, row),
				OpItem::Upsert(row) => (WriteKind::Upsert, row),
				OpItem::Delete(row) => (WriteKind::Delete, row),
			};
			txn.write(kind, row).await?;
		}
		txn.commit().await
	}
}

// vim: ts=4
