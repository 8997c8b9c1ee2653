//! In-memory `StorageAdapter`, the default/test-only persistence backend
//! (spec.md §4.B treats persistence as pluggable; `crdtsync-persistence-redb`
//! is the durable implementation, this one backs unit tests and a
//! persistence-less collection).

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use crdtsync_types::error::{Error, Result};

use crate::persistence::StorageAdapter;

fn poisoned(what: &str) -> Error {
	Error::Internal(format!("{what} lock poisoned"))
}

#[derive(Default)]
pub struct MemoryStorageAdapter {
	kv: Mutex<HashMap<String, String>>,
	snapshots: Mutex<HashMap<String, Vec<u8>>>,
	logs: Mutex<HashMap<String, Vec<Vec<u8>>>>,
}

impl fmt::Debug for MemoryStorageAdapter {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("MemoryStorageAdapter").finish_non_exhaustive()
	}
}

impl MemoryStorageAdapter {
	pub fn new() -> Self {
		MemoryStorageAdapter::default()
	}
}

#[async_trait]
impl StorageAdapter for MemoryStorageAdapter {
	async fn kv_get(&self, key: &str) -> Result<Option<String>> {
		Ok(self.kv.lock().map_err(|_| poisoned("kv"))?.get(key).cloned())
	}

	async fn kv_set(&self, key: &str, value: String) -> Result<()> {
		self.kv.lock().map_err(|_| poisoned("kv"))?.insert(key.to_string(), value);
		Ok(())
	}

	async fn kv_del(&self, key: &str) -> Result<()> {
		self.kv.lock().map_err(|_| poisoned("kv"))?.remove(key);
		Ok(())
	}

	async fn doc_snapshot(&self, name: &str) -> Result<Option<Vec<u8>>> {
		Ok(self.snapshots.lock().map_err(|_| poisoned("snapshot"))?.get(name).cloned())
	}

	async fn doc_updates(&self, name: &str) -> Result<Vec<Vec<u8>>> {
		Ok(self.logs.lock().map_err(|_| poisoned("log"))?.get(name).cloned().unwrap_or_default())
	}

	async fn doc_append_update(&self, name: &str, bytes: Vec<u8>) -> Result<()> {
		self.logs.lock().map_err(|_| poisoned("log"))?.entry(name.to_string()).or_default().push(bytes);
		Ok(())
	}

	async fn doc_delete(&self, name: &str) -> Result<()> {
		self.logs.lock().map_err(|_| poisoned("log"))?.remove(name);
		self.snapshots.lock().map_err(|_| poisoned("snapshot"))?.remove(name);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn kv_roundtrip() {
		let adapter = MemoryStorageAdapter::new();
		adapter.kv_set("cursor:notes", "42".into()).await.expect("set");
		assert_eq!(adapter.kv_get("cursor:notes").await.expect("get"), Some("42".into()));
		adapter.kv_del("cursor:notes").await.expect("del");
		assert_eq!(adapter.kv_get("cursor:notes").await.expect("get"), None);
	}

	#[tokio::test]
	async fn doc_log_preserves_insertion_order() {
		let adapter = MemoryStorageAdapter::new();
		adapter.doc_append_update("notes:r1", vec![1]).await.expect("append");
		adapter.doc_append_update("notes:r1", vec![2]).await.expect("append");
		assert_eq!(adapter.doc_updates("notes:r1").await.expect("updates"), vec![vec![1], vec![2]]);
	}
}

// vim: ts=4
