//! ProseMirror-shaped JSON: the wire format a rich-text fragment
//! serializes to and hydrates from (spec.md §4.C, §6 `schema.prose.extract`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `{type: "doc", content: [...blocks]}`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProseDoc {
	#[serde(rename = "type")]
	pub kind: String,
	#[serde(default)]
	pub content: Vec<ProseNode>,
}

impl ProseDoc {
	pub fn empty() -> Self {
		ProseDoc { kind: "doc".into(), content: vec![ProseNode::paragraph()] }
	}
}

/// An element, or a text leaf, in ProseMirror's node tree.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProseNode {
	#[serde(rename = "type")]
	pub kind: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub attrs: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub content: Option<Vec<ProseNode>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub text: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub marks: Option<Vec<ProseMark>>,
}

impl ProseNode {
	pub fn paragraph() -> Self {
		ProseNode { kind: "paragraph".into(), attrs: None, content: None, text: None, marks: None }
	}

	pub fn is_text(&self) -> bool {
		self.kind == "text"
	}
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProseMark {
	#[serde(rename = "type")]
	pub kind: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub attrs: Option<Value>,
}

/// Structural predicate used both on insert/hydration and by `extract()`:
/// `typeof value === "object" && value.type === "doc"`.
pub fn is_prosemirror_doc(value: &Value) -> bool {
	value.get("type").and_then(Value::as_str) == Some("doc")
}

/// Concatenate all text leaves of a (possibly malformed) ProseMirror JSON
/// value with spaces, defensively ignoring shapes that don't match.
pub fn extract_text(value: &Value) -> String {
	let mut out = String::new();
	collect_text(value, &mut out);
	out.trim().to_string()
}

fn collect_text(value: &Value, out: &mut String) {
	let Some(obj) = value.as_object() else { return };
	if let Some(text) = obj.get("text").and_then(Value::as_str) {
		if !out.is_empty() {
			out.push(' ');
		}
		out.push_str(text);
	}
	if let Some(content) = obj.get("content").and_then(Value::as_array) {
		for child in content {
			collect_text(child, out);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn extracts_text_across_blocks() {
		let doc = json!({
			"type": "doc",
			"content": [
				{"type": "paragraph", "content": [{"type": "text", "text": "hello"}]},
				{"type": "paragraph", "content": [{"type": "text", "text": "world"}]},
			]
		});
		assert_eq!(extract_text(&doc), "hello world");
	}

	#[test]
	fn extract_is_defensive_against_malformed_shapes() {
		assert_eq!(extract_text(&json!(null)), "");
		assert_eq!(extract_text(&json!({"content": "not-an-array"})), "");
		assert_eq!(extract_text(&json!(42)), "");
	}

	#[test]
	fn predicate_matches_only_doc_shape() {
		assert!(is_prosemirror_doc(&json!({"type": "doc", "content": []})));
		assert!(!is_prosemirror_doc(&json!({"type": "paragraph"})));
		assert!(!is_prosemirror_doc(&json!("doc")));
	}
}

// vim: ts=4
