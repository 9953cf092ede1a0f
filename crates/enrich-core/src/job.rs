//! Pipeline variants
//!
//! The orchestrator owns the run: loading, batching, dispatching, merging
//! and persisting. An [`EnrichmentJob`] supplies everything that differs
//! between variants: what to extract, how to ask for it, how to read the
//! answer back and where it goes in the tree.

use crate::batcher::estimate_tokens;
use crate::config::{BatchConfig, EnrichConfig};
use crate::error::{EnrichError, GenerationError};
use crate::generation::GenerationRequest;
use crate::store::ObjectStore;
use crate::work::{Extracted, ResultsMap, WorkItem};
use async_trait::async_trait;
use enrich_catalog::Catalog;
use enrich_merge::MergeOp;
use serde_json::Value;

/// One tree to persist at the end of a run
#[derive(Debug, Clone)]
pub struct OutputArtifact {
    /// Infix of the output file name (`{stem}_{label}_{timestamp}.json`)
    pub label: String,
    /// The rendered tree
    pub catalog: Catalog,
    /// Merge operations that could not be applied while rendering
    pub dropped_merges: usize,
}

impl OutputArtifact {
    /// Create an artifact
    #[inline]
    #[must_use]
    pub fn new(label: impl Into<String>, catalog: Catalog) -> Self {
        Self {
            label: label.into(),
            catalog,
            dropped_merges: 0,
        }
    }

    /// With a count of dropped merges
    #[inline]
    #[must_use]
    pub fn with_dropped_merges(mut self, dropped: usize) -> Self {
        self.dropped_merges = dropped;
        self
    }
}

/// Variant-specific steps of an enrichment run
#[async_trait]
pub trait EnrichmentJob: Send + Sync + 'static {
    /// Short name, used in logs and the checkpoint file name
    fn name(&self) -> &str;

    /// Load whatever the job needs besides the catalog
    ///
    /// # Errors
    /// [`EnrichError::Config`] or [`EnrichError::SourceLoad`]; both end the run
    async fn prepare(&mut self, store: &dyn ObjectStore, config: &EnrichConfig) -> Result<(), EnrichError> {
        let _ = (store, config);
        Ok(())
    }

    /// Result dimensions every item should end up with
    fn dimensions(&self) -> Vec<String>;

    /// Occurrences to work on, in tree order
    fn extract(&self, catalog: &Catalog) -> Vec<Extracted>;

    /// Estimated prompt cost of one item
    fn estimate_tokens(&self, item: &WorkItem) -> usize {
        match &item.payload {
            Value::String(text) => estimate_tokens(text),
            other => estimate_tokens(&other.to_string()),
        }
    }

    /// Batch limits for this job; a zero limit puts every item in its own batch
    fn batch_limits(&self, config: &BatchConfig) -> BatchConfig {
        *config
    }

    /// Build the request for `items`, asking only for `missing` dimensions
    ///
    /// # Errors
    /// [`GenerationError::InvalidRequest`] if no request can be formed
    fn request(&self, label: &str, items: &[WorkItem], missing: &[String]) -> Result<GenerationRequest, GenerationError>;

    /// Split validated output into one results map per item, in item order
    ///
    /// # Errors
    /// [`GenerationError::MalformedOutput`] when the output does not line up
    /// with `items`; the batch is then retried
    fn decode(&self, items: &[WorkItem], missing: &[String], output: Value) -> Result<Vec<ResultsMap>, GenerationError>;

    /// Tree writes for an item's results, applied as soon as they arrive
    fn merge_ops(&self, item: &WorkItem) -> Vec<MergeOp> {
        let _ = item;
        Vec::new()
    }

    /// Trees to persist, rendered from the merged tree
    fn render_outputs(&self, merged: &Catalog, items: &[WorkItem]) -> Vec<OutputArtifact>;
}
