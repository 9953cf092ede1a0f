//! Work items and deduplication
//!
//! Extraction yields one [`Extracted`] record per occurrence in the tree.
//! [`deduplicate`] folds occurrences that share a fingerprint into a single
//! [`WorkItem`], so identical source text is generated once and written back
//! to every place it came from.

use enrich_merge::MergeTarget;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Display, Formatter};

/// Results of one work item, keyed by target dimension (language, field, ...)
pub type ResultsMap = BTreeMap<String, Value>;

/// Stable identifier of a work item
///
/// The index of the item's first occurrence in extraction order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemId(pub usize);

impl Display for ItemId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One occurrence found during extraction
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    /// Deduplication key
    pub fingerprint: String,
    /// What the model gets to see
    pub payload: Value,
    /// Where results for this occurrence are written back
    pub target: MergeTarget,
}

impl Extracted {
    /// Create an occurrence
    #[inline]
    #[must_use]
    pub fn new(fingerprint: impl Into<String>, payload: Value, target: MergeTarget) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            payload,
            target,
        }
    }
}

/// A unit of generation input
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    /// Stable identifier
    pub id: ItemId,
    /// Deduplication and checkpoint key
    pub fingerprint: String,
    /// Model input
    pub payload: Value,
    /// Every tree location sharing this fingerprint
    pub targets: Vec<MergeTarget>,
    /// Results gathered so far
    pub results: ResultsMap,
}

impl WorkItem {
    /// Dimensions of `wanted` without a result yet, in the order given
    #[must_use]
    pub fn missing(&self, wanted: &[String]) -> Vec<String> {
        wanted
            .iter()
            .filter(|dim| !self.results.contains_key(dim.as_str()))
            .cloned()
            .collect()
    }

    /// Whether every dimension of `wanted` has a result
    #[inline]
    #[must_use]
    pub fn is_complete(&self, wanted: &[String]) -> bool {
        wanted.iter().all(|dim| self.results.contains_key(dim.as_str()))
    }

    /// Merge new results; existing dimensions are overwritten
    pub fn absorb(&mut self, results: ResultsMap) {
        self.results.extend(results);
    }
}

/// Fold occurrences with equal fingerprints into work items
///
/// Items come out in order of first occurrence; each item's id is the index
/// of that first occurrence in `extracted`.
#[must_use]
pub fn deduplicate(extracted: Vec<Extracted>) -> Vec<WorkItem> {
    let mut items: Vec<WorkItem> = Vec::new();
    let mut by_fingerprint: HashMap<String, usize> = HashMap::new();

    for (position, occurrence) in extracted.into_iter().enumerate() {
        if let Some(&slot) = by_fingerprint.get(&occurrence.fingerprint) {
            items[slot].targets.push(occurrence.target);
            continue;
        }
        by_fingerprint.insert(occurrence.fingerprint.clone(), items.len());
        items.push(WorkItem {
            id: ItemId(position),
            fingerprint: occurrence.fingerprint,
            payload: occurrence.payload,
            targets: vec![occurrence.target],
            results: ResultsMap::new(),
        });
    }

    items
}
