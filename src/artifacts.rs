//! Artifact storage for persisted task results.
//!
//! A task marked `persist` hands its value to the store and downstream nodes
//! observe the returned reference instead of the raw value. References encode
//! as `{"$artifact": "<key>"}` so they survive the JSON value currency and
//! process boundaries.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use crate::config::{self, StorageBackend};

const REF_FIELD: &str = "$artifact";

/// Opaque handle to a persisted value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub key: String,
}

impl ArtifactRef {
    pub fn to_value(&self) -> Value {
        json!({ REF_FIELD: self.key })
    }

    pub fn from_value(value: &Value) -> Option<ArtifactRef> {
        let key = value.get(REF_FIELD)?.as_str()?;
        Some(ArtifactRef { key: key.to_string() })
    }
}

pub trait ArtifactStore: Send + Sync {
    fn put(&self, value: Value) -> ArtifactRef;
    fn get(&self, reference: &ArtifactRef) -> Option<Value>;
}

#[derive(Default)]
pub struct InMemoryArtifactStore {
    entries: DashMap<String, Value>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ArtifactStore for InMemoryArtifactStore {
    fn put(&self, value: Value) -> ArtifactRef {
        let key = Uuid::new_v4().to_string();
        self.entries.insert(key.clone(), value);
        ArtifactRef { key }
    }

    fn get(&self, reference: &ArtifactRef) -> Option<Value> {
        self.entries.get(&reference.key).map(|v| v.value().clone())
    }
}

/// One JSON file per artifact under the configured root.
pub struct FilesystemArtifactStore {
    root: PathBuf,
}

impl FilesystemArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl ArtifactStore for FilesystemArtifactStore {
    fn put(&self, value: Value) -> ArtifactRef {
        let key = Uuid::new_v4().to_string();
        let path = self.path_for(&key);
        let write = fs::create_dir_all(&self.root)
            .and_then(|_| fs::write(&path, serde_json::to_vec(&value).unwrap_or_default()));
        if let Err(err) = write {
            debug!(?path, %err, "artifact write failed");
        }
        ArtifactRef { key }
    }

    fn get(&self, reference: &ArtifactRef) -> Option<Value> {
        let body = fs::read(self.path_for(&reference.key)).ok()?;
        serde_json::from_slice(&body).ok()
    }
}

static STORE: Lazy<RwLock<Option<Arc<dyn ArtifactStore>>>> = Lazy::new(|| RwLock::new(None));

/// The process-wide artifact store, built from configuration on first use.
pub fn artifact_store() -> Arc<dyn ArtifactStore> {
    if let Some(store) = STORE.read().as_ref() {
        return Arc::clone(store);
    }
    let mut slot = STORE.write();
    if let Some(store) = slot.as_ref() {
        return Arc::clone(store);
    }
    let cfg = config::config();
    let store: Arc<dyn ArtifactStore> = match cfg.artifact_store {
        StorageBackend::Filesystem => {
            Arc::new(FilesystemArtifactStore::new(cfg.artifact_store_path.clone()))
        }
        StorageBackend::Memory => Arc::new(InMemoryArtifactStore::new()),
    };
    *slot = Some(Arc::clone(&store));
    store
}

/// Replace the process-wide store (hosts and tests).
pub fn set_artifact_store(store: Arc<dyn ArtifactStore>) {
    *STORE.write() = Some(store);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trips() {
        let store = InMemoryArtifactStore::new();
        let reference = store.put(json!({"rows": 3}));
        assert_eq!(store.get(&reference), Some(json!({"rows": 3})));
    }

    #[test]
    fn reference_value_encoding_round_trips() {
        let reference = ArtifactRef { key: "abc".into() };
        let value = reference.to_value();
        assert_eq!(ArtifactRef::from_value(&value), Some(reference));
        assert_eq!(ArtifactRef::from_value(&json!({"other": 1})), None);
        assert_eq!(ArtifactRef::from_value(&json!(null)), None);
    }

    #[test]
    fn filesystem_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemArtifactStore::new(dir.path());
        let reference = store.put(json!([1, 2, 3]));
        assert_eq!(store.get(&reference), Some(json!([1, 2, 3])));
        assert_eq!(
            store.get(&ArtifactRef { key: "missing".into() }),
            None
        );
    }
}
