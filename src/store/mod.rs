//! Document store contract.
//!
//! The remote real-time store is consumed through the `DocumentStore`
//! trait: a key-addressed collection of JSON documents with get, shallow
//! merge-write, atomic read-modify-write, and a per-key change feed. The
//! engine is agnostic to the concrete transport behind it; `MemoryStore`
//! is the in-process reference implementation used by tests.

mod memory;

pub use memory::MemoryStore;

use crate::errors::StoreError;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

/// A stored document. Documents are JSON objects at the top level.
pub type Document = Value;

/// Closure applied inside [`DocumentStore::update`]. Receives the current
/// document (or `None` if absent) and returns the replacement (`None`
/// deletes the document).
pub type UpdateFn = Box<dyn FnOnce(Option<Document>) -> Option<Document> + Send>;

/// Key-addressed document store with merge and subscribe semantics.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read the document at `key`, `None` if it does not exist.
    async fn get(&self, key: &str) -> Result<Option<Document>, StoreError>;

    /// Shallow-merge `patch` into the document at `key`, creating it if
    /// absent. Fields not present in `patch` are never touched; replaying
    /// the same patch is idempotent.
    async fn merge(&self, key: &str, patch: Document) -> Result<(), StoreError>;

    /// Replace the whole document at `key`.
    async fn put(&self, key: &str, doc: Document) -> Result<(), StoreError>;

    /// Remove the document at `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Atomic read-modify-write of the document at `key`.
    ///
    /// Returns the pre-image. No other writer can interleave between the
    /// read and the write.
    async fn update(&self, key: &str, apply: UpdateFn) -> Result<Option<Document>, StoreError>;

    /// Change feed for `key`. Each event carries the full new document
    /// (`None` once deleted). The feed does not replay the current
    /// snapshot; callers wanting one should `get` first.
    fn watch(&self, key: &str) -> broadcast::Receiver<Option<Document>>;
}

/// Merge `patch` into `base`, per level: object values merge key-wise,
/// scalars and arrays replace.
pub fn merge_documents(base: &mut Document, patch: Document) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_documents(existing, patch_value),
                    None => {
                        base_map.insert(key, patch_value);
                    }
                }
            }
        }
        (base, patch) => *base = patch,
    }
}
