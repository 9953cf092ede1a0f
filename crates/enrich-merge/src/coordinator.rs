//! Serialized writes into the shared catalog tree
//!
//! Concurrent dispatch completions all funnel their results through one
//! [`MergeCoordinator`]. The lock is taken per operation and covers the tree
//! mutation only; callers do their network round trips before calling in.

use crate::op::{MergeError, MergeOp, MergeOutcome};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

/// Merge statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Operations that changed or confirmed the tree
    pub applied: usize,
    /// Operations dropped because their target could not be written
    pub dropped: usize,
}

/// Result of [`MergeCoordinator::apply_all`]
#[derive(Debug, Clone, Default)]
pub struct MergeReport {
    /// Successful operations
    pub applied: usize,
    /// Failed operations with their errors
    pub dropped: Vec<(MergeOp, MergeError)>,
}

impl MergeReport {
    /// Whether every operation applied
    #[inline]
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.dropped.is_empty()
    }
}

/// Single-writer owner of the catalog tree for one run
#[derive(Debug)]
pub struct MergeCoordinator {
    tree: Mutex<Value>,
    applied: AtomicUsize,
    dropped: AtomicUsize,
}

impl MergeCoordinator {
    /// Take ownership of `tree`
    #[inline]
    #[must_use]
    pub fn new(tree: Value) -> Self {
        Self {
            tree: Mutex::new(tree),
            applied: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
        }
    }

    /// Apply one operation under the lock
    ///
    /// # Errors
    /// Returns the [`MergeError`] of the operation; the tree is unchanged then.
    pub fn apply(&self, op: &MergeOp) -> Result<MergeOutcome, MergeError> {
        let result = {
            let mut tree = self.tree.lock();
            op.apply(&mut tree)
        };

        match &result {
            Ok(outcome) => {
                self.applied.fetch_add(1, Ordering::Relaxed);
                debug!(mode = op.mode().name(), ?outcome, "merge applied");
            }
            Err(err) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(mode = op.mode().name(), error = %err, "merge dropped");
            }
        }
        result
    }

    /// Apply operations one by one, each under its own lock acquisition
    ///
    /// A failing operation is recorded and skipped; the rest still apply.
    pub fn apply_all<'a, I>(&self, ops: I) -> MergeReport
    where
        I: IntoIterator<Item = &'a MergeOp>,
    {
        let mut report = MergeReport::default();
        for op in ops {
            match self.apply(op) {
                Ok(_) => report.applied += 1,
                Err(err) => report.dropped.push((op.clone(), err)),
            }
        }
        report
    }

    /// Read the tree under the lock
    pub fn read<R>(&self, f: impl FnOnce(&Value) -> R) -> R {
        f(&self.tree.lock())
    }

    /// Clone of the current tree
    #[must_use]
    pub fn snapshot(&self) -> Value {
        self.tree.lock().clone()
    }

    /// Counters since creation
    #[must_use]
    pub fn stats(&self) -> MergeStats {
        MergeStats {
            applied: self.applied.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Release the tree
    #[inline]
    #[must_use]
    pub fn into_inner(self) -> Value {
        self.tree.into_inner()
    }
}
