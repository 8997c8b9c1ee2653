//! Thin seam around `yrs` (the CRDT algebra treated as an opaque library
//! per spec.md §1).
//!
//! spec.md §9 calls out that the source's dynamic type introspection over
//! CRDT values should become "a small closed set of variant predicates
//! over the CRDT library's value kinds" in a statically typed target.
//! `yrs::Value` already *is* that closed tagged union (`Any`, `YText`,
//! `YArray`, `YMap`, `YXmlFragment`, `YXmlElement`, `YXmlText`, `YDoc`), so
//! this module is the single place that matches on it; nothing outside
//! `ydoc.rs` and `materialize.rs` touches a `yrs::Value` directly.

use crdtsync_types::ids::DocumentId;
use crdtsync_types::origin::OriginTag;
use crdtsync_types::prose_json::{ProseDoc, ProseMark, ProseNode};
use serde_json::{Map, Value as Json};
use yrs::types::ToJson;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
	Any, Doc, GetString, Map as YMapTrait, MapRef, Options, ReadTxn, StateVector, Subscription,
	Transact, TransactionMut, Update, XmlElementPrelim, XmlElementRef, XmlFragment, XmlFragmentRef,
	XmlOut, XmlTextPrelim, XmlTextRef,
};

pub const FIELDS_MAP: &str = "fields";
pub const DOCUMENTS_MAP: &str = "documents";

/// Create the root document for a collection (holds the `documents` map).
pub fn new_root_doc() -> Doc {
	Doc::new()
}

/// Create a sub-document keyed by `document_id`. The guid is pinned to
/// the document id so subdoc-changed events can be mapped back to it.
pub fn new_subdoc(document_id: &DocumentId) -> Doc {
	let options = Options { guid: document_id.as_str().into(), ..Options::default() };
	Doc::with_options(options)
}

pub fn subdoc_guid(doc: &Doc) -> String {
	doc.guid().to_string()
}

/// Begin a transaction tagged with `origin`. All mutations made through
/// `crdtsync-core` go through this so that observers can tell local edits
/// apart from remote/persistence ones (spec.md GLOSSARY "Origin tag").
pub fn transact_mut(doc: &Doc, origin: OriginTag) -> TransactionMut<'_> {
	doc.transact_mut_with(origin.as_str())
}

pub fn origin_of(txn: &TransactionMut) -> Option<OriginTag> {
	txn.origin().and_then(|o| o.as_ref().ok()).and_then(|s: &str| OriginTag::from_str(s))
}

pub fn encode_state_vector(doc: &Doc) -> Vec<u8> {
	doc.transact().state_vector().encode_v1()
}

/// `encode_update(subdoc, vector)`: the update covering everything the
/// document has beyond `since`.
pub fn encode_update_since(doc: &Doc, since: &[u8]) -> Vec<u8> {
	let sv = StateVector::decode_v1(since).unwrap_or_default();
	doc.transact().encode_state_as_update_v1(&sv)
}

/// `encode_state(subdoc)`: the full state as an update, used to carry a
/// tombstone delta just before deleting (spec.md §4.A).
pub fn full_state_update(doc: &Doc) -> Vec<u8> {
	doc.transact().encode_state_as_update_v1(&StateVector::default())
}

pub fn apply_update_bytes(doc: &Doc, bytes: &[u8], origin: OriginTag) -> Result<(), String> {
	let update = Update::decode_v1(bytes).map_err(|e| e.to_string())?;
	let mut txn = transact_mut(doc, origin);
	txn.apply_update(update).map_err(|e| e.to_string())?;
	Ok(())
}

/// Canonical "no-op" update marker (spec.md §8 boundary behavior).
pub fn is_empty_update(bytes: &[u8]) -> bool {
	bytes.len() <= 2
}

/// True iff `bytes` is the state vector of a document with no applied
/// updates yet. Used to tell a document's first successful push apart
/// from a later one, so the write actor's sync function can pick the
/// `insert` vs. `update` backend verb (spec.md §4.D "callers determine
/// the verb based on mutation origin").
pub fn is_empty_state_vector(bytes: &[u8]) -> bool {
	bytes == StateVector::default().encode_v1().as_slice()
}

/// Get (or create) the sub-document's `fields` map.
pub fn fields_map(txn: &mut TransactionMut<'_>) -> MapRef {
	txn.get_or_insert_map(FIELDS_MAP)
}

pub fn documents_map(txn: &mut TransactionMut<'_>) -> MapRef {
	txn.get_or_insert_map(DOCUMENTS_MAP)
}

/// Read-only lookup of the `fields` map, for callers that only hold a
/// `ReadTxn` (e.g. `SubDocumentManager::get_fields`). `None` iff the
/// sub-document has never been written to.
pub fn fields_map_ref<T: ReadTxn>(txn: &T) -> Option<MapRef> {
	txn.get_map(FIELDS_MAP)
}

/// Read-only lookup of a named prose fragment, without creating one.
pub fn fragment_ref<T: ReadTxn>(txn: &T, field_name: &str) -> Option<XmlFragmentRef> {
	txn.get_xml_fragment(field_name)
}

/// Register the subdocs-changed observer on the root document. Returned
/// subscription must be kept alive for as long as events are wanted.
pub fn observe_subdocs<F>(root: &Doc, callback: F) -> Subscription
where
	F: Fn(&TransactionMut, &yrs::SubdocsEvent) + 'static,
{
	root.observe_subdocs(callback)
}

/// Registers an update observer. `None` iff the document's event handler
/// registry is already borrowed elsewhere on this thread; callers treat a
/// missed subscription as "degrade, don't crash" the same way they treat
/// other persistence/reconciliation failures.
pub fn observe_update(doc: &Doc, callback: impl Fn(&TransactionMut, &yrs::UpdateEvent) + 'static) -> Option<Subscription> {
	doc.observe_update_v1(callback).ok()
}

/// Recursively convert a `yrs` container/value to plain JSON
/// (spec.md §4.C "materialization rules" for maps/arrays/scalars).
pub fn value_to_json<T: ReadTxn>(txn: &T, value: &yrs::Value) -> Json {
	match value.to_json(txn) {
		Any::Null | Any::Undefined => Json::Null,
		Any::Bool(b) => Json::Bool(b),
		Any::Number(n) => serde_json::Number::from_f64(n).map(Json::Number).unwrap_or(Json::Null),
		Any::BigInt(n) => Json::Number(n.into()),
		Any::String(s) => Json::String(s.to_string()),
		Any::Buffer(b) => Json::Array(b.iter().map(|byte| Json::Number((*byte).into())).collect()),
		Any::Array(items) => Json::Array(items.iter().map(any_to_json).collect()),
		Any::Map(map) => {
			let mut obj = Map::new();
			for (k, v) in map.iter() {
				obj.insert(k.clone(), any_to_json(v));
			}
			Json::Object(obj)
		}
	}
}

fn any_to_json(any: &Any) -> Json {
	match any {
		Any::Null | Any::Undefined => Json::Null,
		Any::Bool(b) => Json::Bool(*b),
		Any::Number(n) => serde_json::Number::from_f64(*n).map(Json::Number).unwrap_or(Json::Null),
		Any::BigInt(n) => Json::Number((*n).into()),
		Any::String(s) => Json::String(s.to_string()),
		Any::Buffer(b) => Json::Array(b.iter().map(|byte| Json::Number((*byte).into())).collect()),
		Any::Array(items) => Json::Array(items.iter().map(any_to_json).collect()),
		Any::Map(map) => {
			let mut obj = Map::new();
			for (k, v) in map.iter() {
				obj.insert(k.clone(), any_to_json(v));
			}
			Json::Object(obj)
		}
	}
}

/// Get-or-insert the XML fragment backing a prose field.
pub fn fragment_of(txn: &mut TransactionMut<'_>, field_name: &str) -> XmlFragmentRef {
	txn.get_or_insert_xml_fragment(field_name)
}

pub fn fragment_get_string<T: ReadTxn>(txn: &T, frag: &XmlFragmentRef) -> String {
	frag.get_string(txn)
}

const ATTRS_KEY: &str = "attrs";
const MARKS_KEY: &str = "marks";

/// Replace a fragment's content with `doc` (spec.md §4.C hydration rules).
pub fn fragment_from_prose(txn: &mut TransactionMut<'_>, frag: &XmlFragmentRef, doc: &ProseDoc) {
	let len = frag.len(txn);
	if len > 0 {
		frag.remove_range(txn, 0, len);
	}
	for (index, node) in doc.content.iter().enumerate() {
		insert_node_into_fragment(txn, frag, index as u32, node);
	}
}

fn insert_node_into_fragment(txn: &mut TransactionMut<'_>, parent: &XmlFragmentRef, index: u32, node: &ProseNode) {
	if node.is_text() {
		let text_ref = parent.insert(txn, index, XmlTextPrelim::new(node.text.clone().unwrap_or_default()));
		apply_marks(txn, &text_ref, node);
		return;
	}
	let element = parent.insert(txn, index, XmlElementPrelim::empty(node.kind.clone()));
	apply_attrs(txn, &element, node);
	if let Some(children) = &node.content {
		for (i, child) in children.iter().enumerate() {
			insert_node_into_element(txn, &element, i as u32, child);
		}
	}
}

fn insert_node_into_element(txn: &mut TransactionMut<'_>, parent: &XmlElementRef, index: u32, node: &ProseNode) {
	if node.is_text() {
		let text_ref = parent.insert(txn, index, XmlTextPrelim::new(node.text.clone().unwrap_or_default()));
		apply_marks(txn, &text_ref, node);
		return;
	}
	let element = parent.insert(txn, index, XmlElementPrelim::empty(node.kind.clone()));
	apply_attrs(txn, &element, node);
	if let Some(children) = &node.content {
		for (i, child) in children.iter().enumerate() {
			insert_node_into_element(txn, &element, i as u32, child);
		}
	}
}

fn apply_attrs(txn: &mut TransactionMut<'_>, element: &XmlElementRef, node: &ProseNode) {
	if let Some(attrs) = &node.attrs {
		if let Ok(json) = serde_json::to_string(attrs) {
			element.insert_attribute(txn, ATTRS_KEY, json);
		}
	}
}

fn apply_marks(txn: &mut TransactionMut<'_>, text_ref: &XmlTextRef, node: &ProseNode) {
	if let Some(marks) = &node.marks {
		if let Ok(json) = serde_json::to_string(marks) {
			text_ref.insert_attribute(txn, MARKS_KEY, json);
		}
	}
}

/// Read a fragment's content back out as `ProseDoc` (spec.md §4.C
/// materialization rule for rich-text fragments).
pub fn fragment_to_prose<T: ReadTxn>(txn: &T, frag: &XmlFragmentRef) -> ProseDoc {
	let content: Vec<ProseNode> = frag.iter(txn).map(|child| xml_out_to_node(txn, child)).collect();
	if content.is_empty() {
		ProseDoc::empty()
	} else {
		ProseDoc { kind: "doc".into(), content }
	}
}

fn xml_out_to_node<T: ReadTxn>(txn: &T, out: XmlOut) -> ProseNode {
	match out {
		XmlOut::Text(text_ref) => {
			let marks = text_ref
				.get_attribute(txn, MARKS_KEY)
				.and_then(|raw| serde_json::from_str::<Vec<ProseMark>>(&raw).ok());
			ProseNode {
				kind: "text".into(),
				attrs: None,
				content: None,
				text: Some(text_ref.get_string(txn)),
				marks,
			}
		}
		XmlOut::Element(element) => {
			let attrs = element.get_attribute(txn, ATTRS_KEY).and_then(|raw| serde_json::from_str(&raw).ok());
			let content: Vec<ProseNode> = element.iter(txn).map(|child| xml_out_to_node(txn, child)).collect();
			ProseNode {
				kind: element.tag().map(ToString::to_string).unwrap_or_else(|| "paragraph".into()),
				attrs,
				content: if content.is_empty() { None } else { Some(content) },
				text: None,
				marks: None,
			}
		}
		XmlOut::Fragment(fragment) => {
			let content: Vec<ProseNode> = fragment.iter(txn).map(|child| xml_out_to_node(txn, child)).collect();
			ProseNode { kind: "doc".into(), attrs: None, content: Some(content), text: None, marks: None }
		}
	}
}

// vim: ts=4
