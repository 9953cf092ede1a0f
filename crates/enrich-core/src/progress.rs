//! Checkpoints
//!
//! The checkpoint is one JSON object mapping each fingerprint to the results
//! known for it: `{"<source text or id>": {"<dimension>": <result>}}`. It is
//! rewritten whole after every completed batch. Reading it is best effort;
//! a missing or unreadable checkpoint simply means starting from scratch.

use crate::error::StoreError;
use crate::jobs::FAILURE_MARKER;
use crate::store::{ObjectStore, JSON_CONTENT_TYPE};
use crate::work::{ResultsMap, WorkItem};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Fingerprint → results
pub type ProgressSnapshot = BTreeMap<String, ResultsMap>;

/// Checkpoint persistence at one object path
#[derive(Clone)]
pub struct ProgressStore {
    store: Arc<dyn ObjectStore>,
    path: String,
}

impl std::fmt::Debug for ProgressStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl ProgressStore {
    /// Checkpoint at `path` in `store`
    #[inline]
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, path: impl Into<String>) -> Self {
        Self {
            store,
            path: path.into(),
        }
    }

    /// Object path of the checkpoint
    #[inline]
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Load the checkpoint; any failure yields an empty snapshot
    pub async fn load(&self) -> ProgressSnapshot {
        let bytes = match self.store.get(&self.path).await {
            Ok(bytes) => bytes,
            Err(StoreError::NotFound(_)) => {
                info!(path = %self.path, "no checkpoint found; starting fresh");
                return ProgressSnapshot::new();
            }
            Err(err) => {
                warn!(path = %self.path, error = %err, "checkpoint unreadable; starting fresh");
                return ProgressSnapshot::new();
            }
        };

        match serde_json::from_slice::<ProgressSnapshot>(&bytes) {
            Ok(snapshot) => {
                info!(path = %self.path, entries = snapshot.len(), "checkpoint loaded");
                snapshot
            }
            Err(err) => {
                warn!(path = %self.path, error = %err, "checkpoint corrupt; starting fresh");
                ProgressSnapshot::new()
            }
        }
    }

    /// Overwrite the checkpoint with `snapshot`
    ///
    /// # Errors
    /// Storage failures; callers log them and carry on
    pub async fn save(&self, snapshot: &ProgressSnapshot) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(snapshot).map_err(|e| StoreError::Io {
            path: self.path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;
        self.store.put(&self.path, bytes, JSON_CONTENT_TYPE).await?;
        debug!(path = %self.path, entries = snapshot.len(), "checkpoint saved");
        Ok(())
    }
}

/// Whether a checkpointed result counts as done
///
/// Failure markers written by older runs are treated as missing so the
/// dimension is requested again.
fn is_usable(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(text) => !text.is_empty() && !text.starts_with(FAILURE_MARKER),
        _ => true,
    }
}

/// Seed item results from a snapshot; returns how many items matched
pub fn restore(items: &mut [WorkItem], snapshot: &ProgressSnapshot) -> usize {
    let mut restored = 0;
    for item in items.iter_mut() {
        let Some(results) = snapshot.get(&item.fingerprint) else {
            continue;
        };
        let usable: ResultsMap = results
            .iter()
            .filter(|(_, value)| is_usable(value))
            .map(|(dimension, value)| (dimension.clone(), value.clone()))
            .collect();
        if usable.len() < results.len() {
            debug!(
                fingerprint = %item.fingerprint,
                dropped = results.len() - usable.len(),
                "checkpoint holds failed results; requesting them again"
            );
        }
        if !usable.is_empty() {
            item.absorb(usable);
            restored += 1;
        }
    }
    restored
}

/// Record an item's results in a snapshot
pub fn record(snapshot: &mut ProgressSnapshot, item: &WorkItem) {
    if item.results.is_empty() {
        return;
    }
    snapshot
        .entry(item.fingerprint.clone())
        .or_default()
        .extend(item.results.iter().map(|(k, v)| (k.clone(), v.clone())));
}
