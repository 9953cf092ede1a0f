//! Enrichment pipeline core
//!
//! Drives a generative model over a catalog tree in bounded, restartable
//! batches:
//! - [`TreeIndex`](enrich_catalog::TreeIndex) finds the work
//! - [`make_batches`](batcher::make_batches) groups it by token estimate
//! - [`ConcurrencyGate`](gate::ConcurrencyGate) and
//!   [`RetryDispatcher`](retry::RetryDispatcher) drive the
//!   [`GenerationClient`](generation::GenerationClient)
//! - [`MergeCoordinator`](enrich_merge::MergeCoordinator) writes results back
//! - [`ProgressStore`](progress::ProgressStore) checkpoints after every batch
//! - [`Orchestrator`](orchestrator::Orchestrator) runs one
//!   [`EnrichmentJob`](job::EnrichmentJob) end to end
//!
//! # Example
//!
//! ```rust,ignore
//! use enrich_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example(client: Arc<dyn GenerationClient>) -> Result<(), EnrichError> {
//! let config = EnrichConfig::from_env()?;
//! let store = Arc::new(FsObjectStore::new("/data/bucket"));
//! let mut orchestrator = Orchestrator::new(config, client, store);
//!
//! let report = orchestrator.run(TranslationJob::new(["en", "fr"])).await?;
//! println!("{report}");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod batcher;
pub mod config;
pub mod error;
pub mod gate;
pub mod generation;
pub mod job;
pub mod jobs;
pub mod orchestrator;
pub mod progress;
pub mod report;
pub mod retry;
pub mod schema;
pub mod state;
pub mod store;
pub mod work;

pub use enrich_catalog::{Catalog, NodeKind, TreeIndex};
pub use enrich_merge::{MergeCoordinator, MergeOp, MergeTarget};

pub use batcher::{estimate_tokens, make_batches, Batch};
pub use config::{BatchConfig, EnrichConfig, FinalValidationPolicy, RetryConfig};
pub use error::{ConfigError, EnrichError, GenerationError, StoreError};
pub use gate::{ConcurrencyGate, GateError, GatePermit, GateStats};
pub use generation::{DocumentRef, GenerationClient, GenerationRequest};
pub use job::{EnrichmentJob, OutputArtifact};
pub use jobs::{PracticeJob, QualityCheckJob, StubJob, TranslationJob};
pub use orchestrator::{checkpoint_path, output_name, Orchestrator};
pub use progress::{ProgressSnapshot, ProgressStore};
pub use report::{RunReport, RunSummary};
pub use retry::{BackoffPolicy, RetryDispatcher, RetryFailure};
pub use schema::{condition_schema, parse_model_json, OutputSchema};
pub use state::RunState;
pub use store::{join_key, FsObjectStore, MemoryObjectStore, ObjectStore, JSON_CONTENT_TYPE};
pub use work::{deduplicate, Extracted, ItemId, ResultsMap, WorkItem};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for running enrichment jobs
    pub use crate::{
        EnrichConfig, EnrichError, EnrichmentJob, FsObjectStore, GenerationClient,
        GenerationError, GenerationRequest, MemoryObjectStore, ObjectStore, Orchestrator,
        PracticeJob, QualityCheckJob, RunReport, StubJob, TranslationJob,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
