//! End-to-end enrichment run
//!
//! The orchestrator owns one run of one job:
//! 1. Validate configuration and prepare the job
//! 2. Load the source catalog
//! 3. Extract and deduplicate work items
//! 4. Restore checkpointed results and merge them into the tree
//! 5. Batch pending items and dispatch them through the gate
//! 6. Render, validate and persist the output trees
//!
//! Only configuration and source loading can end a run early (plus final
//! validation when the policy says so). A batch that fails after all its
//! attempts is counted and left out.

use crate::batcher::make_batches;
use crate::config::{EnrichConfig, FinalValidationPolicy};
use crate::error::{EnrichError, GenerationError, StoreError};
use crate::gate::ConcurrencyGate;
use crate::generation::GenerationClient;
use crate::job::{EnrichmentJob, OutputArtifact};
use crate::jobs::read_schema;
use crate::progress::{record, restore, ProgressSnapshot, ProgressStore};
use crate::report::{RunReport, RunSummary};
use crate::retry::{BackoffPolicy, RetryDispatcher, RetryFailure};
use crate::schema::OutputSchema;
use crate::state::{validate_transition, RunState};
use crate::store::{join_key, ObjectStore, JSON_CONTENT_TYPE};
use crate::work::{deduplicate, ResultsMap, WorkItem};
use chrono::{DateTime, Utc};
use enrich_catalog::Catalog;
use enrich_merge::MergeCoordinator;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use ulid::Ulid;

/// Share of pending items processed in test mode, in percent
const TEST_MODE_PERCENT: usize = 5;

/// Validation issues logged individually
const MAX_LOGGED_ISSUES: usize = 10;

/// Checkpoint object path for a job
#[must_use]
pub fn checkpoint_path(progress_prefix: &str, job: &str) -> String {
    join_key(progress_prefix, &format!("{job}_progress.json"))
}

/// Output object name: `{stem}_{label}_{YYYYmmdd_HHMMSS}.json`
#[must_use]
pub fn output_name(source_path: &str, label: &str, at: DateTime<Utc>) -> String {
    let stem = Path::new(source_path)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("catalog");
    format!("{stem}_{label}_{}.json", at.format("%Y%m%d_%H%M%S"))
}

/// Pending items dispatched in test mode
#[must_use]
pub fn test_sample_size(pending: usize) -> usize {
    if pending == 0 {
        0
    } else {
        (pending * TEST_MODE_PERCENT / 100).max(1)
    }
}

/// One batch on its way to the service
struct DispatchUnit {
    index: usize,
    positions: Vec<usize>,
    items: Vec<WorkItem>,
    missing: Vec<String>,
}

/// What a dispatch task hands back
struct BatchOutcome {
    index: usize,
    positions: Vec<usize>,
    result: Result<Vec<WorkItem>, RetryFailure>,
}

/// Runs enrichment jobs against a store and a generation client
pub struct Orchestrator {
    config: EnrichConfig,
    client: Arc<dyn GenerationClient>,
    store: Arc<dyn ObjectStore>,
    state: RunState,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("client", &self.client.name())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Create an orchestrator; nothing is checked until [`Self::run`]
    #[must_use]
    pub fn new(config: EnrichConfig, client: Arc<dyn GenerationClient>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            config,
            client,
            store,
            state: RunState::Init,
        }
    }

    /// Current state; after a run, the state it ended in
    #[inline]
    #[must_use]
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Configuration in use
    #[inline]
    #[must_use]
    pub fn config(&self) -> &EnrichConfig {
        &self.config
    }

    /// Run `job` to completion
    ///
    /// # Errors
    /// - [`EnrichError::Config`]: settings or job assets unusable
    /// - [`EnrichError::SourceLoad`]: source catalog unreadable
    /// - [`EnrichError::FinalValidation`]: output invalid under the abort policy
    /// - [`EnrichError::Store`]: an output could not be written
    ///
    /// Every error leaves [`state`](Self::state) at a terminal `Aborted*` state.
    pub async fn run<J: EnrichmentJob>(&mut self, job: J) -> Result<RunReport, EnrichError> {
        let run_id = Ulid::new();
        let span = info_span!("run", job = job.name(), run_id = %run_id);
        self.state = RunState::Init;
        self.execute(job, run_id).instrument(span).await
    }

    fn transition(&mut self, to: RunState) -> Result<(), EnrichError> {
        validate_transition(self.state, to)?;
        debug!(from = %self.state, to = %to, "state transition");
        self.state = to;
        Ok(())
    }

    fn abort(&mut self, to: RunState, err: EnrichError) -> EnrichError {
        error!(state = %to, error = %err, "run aborted");
        match self.transition(to) {
            Ok(()) => err,
            Err(illegal) => illegal,
        }
    }

    async fn execute<J: EnrichmentJob>(&mut self, mut job: J, run_id: Ulid) -> Result<RunReport, EnrichError> {
        let started = Utc::now();
        let mut summary = RunSummary::default();

        if let Err(err) = self.config.validate() {
            return Err(self.abort(RunState::AbortedConfig, err.into()));
        }
        let catalog_schema = match self.load_catalog_schema() {
            Ok(schema) => schema,
            Err(err) => return Err(self.abort(RunState::AbortedConfig, err)),
        };
        if let Err(err) = job.prepare(self.store.as_ref(), &self.config).await {
            let to = match err {
                EnrichError::Config(_) => RunState::AbortedConfig,
                _ => RunState::AbortedSourceLoad,
            };
            return Err(self.abort(to, err));
        }

        let catalog = match self.load_source().await {
            Ok(catalog) => catalog,
            Err(err) => return Err(self.abort(RunState::AbortedSourceLoad, err)),
        };
        self.transition(RunState::Loaded)?;

        let extracted = job.extract(&catalog);
        summary.occurrences = extracted.len();
        self.transition(RunState::Extracted)?;

        let mut items = deduplicate(extracted);
        summary.total = items.len();
        info!(occurrences = summary.occurrences, items = summary.total, "work items extracted");
        self.transition(RunState::Deduplicated)?;

        let dimensions = job.dimensions();
        let progress = self
            .config
            .checkpoint
            .then(|| ProgressStore::new(Arc::clone(&self.store), checkpoint_path(&self.config.progress_prefix, job.name())));
        let mut snapshot = match &progress {
            Some(progress) => progress.load().await,
            None => ProgressSnapshot::new(),
        };
        let restored = restore(&mut items, &snapshot);

        let job = Arc::new(job);
        let coordinator = Arc::new(MergeCoordinator::new(catalog.into_value()));
        for item in items.iter().filter(|item| !item.results.is_empty()) {
            coordinator.apply_all(&job.merge_ops(item));
        }
        summary.already_complete = items.iter().filter(|item| item.is_complete(&dimensions)).count();
        info!(restored, complete = summary.already_complete, "progress restored");
        self.transition(RunState::ProgressRestored)?;

        let mut pending: Vec<usize> = (0..items.len())
            .filter(|&pos| !items[pos].is_complete(&dimensions))
            .collect();
        if self.config.test_mode {
            let keep = test_sample_size(pending.len());
            summary.skipped = pending.len() - keep;
            pending.truncate(keep);
            warn!(dispatching = keep, skipped = summary.skipped, "test mode: dispatching a sample only");
        }
        summary.dispatched = pending.len();

        let limits = job.batch_limits(&self.config.batch);
        let batches = make_batches(
            pending,
            |&pos| job.estimate_tokens(&items[pos]).max(1),
            limits.overhead_tokens,
            limits.limit_tokens,
        );
        summary.batches = batches.len();
        info!(batches = summary.batches, items = summary.dispatched, "batches formed");
        self.transition(RunState::Batched)?;

        self.transition(RunState::Dispatching)?;
        let gate = ConcurrencyGate::new(self.config.concurrency);
        let dispatcher = RetryDispatcher::new(BackoffPolicy::from_config(&self.config.retry));
        let mut tasks = JoinSet::new();

        for batch in batches {
            let index = batch.index();
            let positions = batch.into_items();
            let unit_items: Vec<WorkItem> = positions.iter().map(|&pos| items[pos].clone()).collect();
            let missing: Vec<String> = dimensions
                .iter()
                .filter(|dim| unit_items.iter().any(|item| !item.results.contains_key(dim.as_str())))
                .cloned()
                .collect();
            let unit = DispatchUnit {
                index,
                positions,
                items: unit_items,
                missing,
            };
            tasks.spawn(
                dispatch(
                    unit,
                    Arc::clone(&job),
                    Arc::clone(&self.client),
                    gate.clone(),
                    dispatcher.clone(),
                    Arc::clone(&coordinator),
                )
                .in_current_span(),
            );
        }

        let mut succeeded_batches = 0;
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!(error = %err, "dispatch task died");
                    continue;
                }
            };
            match outcome.result {
                Ok(updated) => {
                    succeeded_batches += 1;
                    for (pos, item) in outcome.positions.into_iter().zip(updated) {
                        if item.is_complete(&dimensions) {
                            summary.succeeded += 1;
                        }
                        record(&mut snapshot, &item);
                        items[pos] = item;
                    }
                    if let Some(progress) = &progress {
                        if let Err(err) = progress.save(&snapshot).await {
                            warn!(batch = outcome.index, error = %err, "checkpoint not saved");
                        }
                    }
                }
                Err(failure) => {
                    warn!(
                        batch = outcome.index,
                        items = outcome.positions.len(),
                        attempts = failure.attempts,
                        error = %failure.last_error,
                        "batch skipped"
                    );
                }
            }
        }
        let gate_stats = gate.stats();
        summary.peak_in_flight = gate_stats.peak;
        summary.failed_batches = summary.batches - succeeded_batches;
        summary.failed = summary.dispatched.saturating_sub(summary.succeeded);

        self.transition(RunState::Merging)?;
        let merge_stats = coordinator.stats();
        let tree = match Arc::try_unwrap(coordinator) {
            Ok(coordinator) => coordinator.into_inner(),
            Err(shared) => shared.snapshot(),
        };
        let merged = match Catalog::from_value(tree) {
            Ok(merged) => merged,
            Err(err) => {
                // nothing renderable is left, whatever the policy
                let err = EnrichError::FinalValidation {
                    count: 1,
                    first: err.to_string(),
                };
                return Err(self.abort(RunState::AbortedValidation, err));
            }
        };
        let mut outputs = job.render_outputs(&merged, &items);
        summary.merges_applied = merge_stats.applied;
        summary.merges_dropped =
            merge_stats.dropped + outputs.iter().map(|o| o.dropped_merges).sum::<usize>();

        self.transition(RunState::Validating)?;
        let issues = validate_outputs(&mut outputs, catalog_schema.as_ref(), started);
        summary.validation_issues = issues.len();
        if let Some(first) = issues.first() {
            for issue in issues.iter().take(MAX_LOGGED_ISSUES) {
                error!(issue = %issue, "final validation");
            }
            if self.config.final_validation == FinalValidationPolicy::Abort {
                let err = EnrichError::FinalValidation {
                    count: issues.len(),
                    first: first.clone(),
                };
                return Err(self.abort(RunState::AbortedValidation, err));
            }
            warn!(count = issues.len(), "output failed validation; persisting anyway");
        }

        let written = match self.persist(&outputs, started).await {
            Ok(written) => written,
            Err(err) => return Err(self.abort(RunState::AbortedPersist, err)),
        };
        self.transition(RunState::Persisted)?;
        self.transition(RunState::Done)?;

        let report = RunReport {
            run_id,
            job: job.name().to_string(),
            state: self.state,
            summary,
            outputs: written,
            validation_issues: issues,
            checkpoint: progress.map(|p| p.path().to_string()),
        };
        info!(
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            "run finished"
        );
        Ok(report)
    }

    /// Write every output; stops at the first failure
    async fn persist(&self, outputs: &[OutputArtifact], started: DateTime<Utc>) -> Result<Vec<String>, EnrichError> {
        let mut written = Vec::with_capacity(outputs.len());
        for output in outputs {
            let name = output_name(&self.config.source_path, &output.label, started);
            let key = join_key(&self.config.output_prefix, &name);
            let bytes = output.catalog.to_pretty_vec().map_err(|err| StoreError::Io {
                path: key.clone(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, err),
            })?;
            self.store.put(&key, bytes, JSON_CONTENT_TYPE).await?;
            info!(path = %key, "output written");
            written.push(key);
        }
        Ok(written)
    }

    async fn load_source(&self) -> Result<Catalog, EnrichError> {
        let path = &self.config.source_path;
        let bytes = self
            .store
            .get(path)
            .await
            .map_err(|err| EnrichError::source_load(path.as_str(), err))?;
        let catalog = Catalog::from_slice(&bytes).map_err(|err| EnrichError::source_load(path.as_str(), err))?;
        info!(path = %path, bytes = bytes.len(), "source catalog loaded");
        Ok(catalog)
    }

    fn load_catalog_schema(&self) -> Result<Option<OutputSchema>, EnrichError> {
        let Some(path) = self.config.catalog_schema_path.as_deref() else {
            return Ok(None);
        };
        let schema = OutputSchema::new(read_schema(Path::new(path))?)?;
        Ok(Some(schema))
    }
}

/// Stamp every output and collect its validation problems
fn validate_outputs(outputs: &mut [OutputArtifact], schema: Option<&OutputSchema>, at: DateTime<Utc>) -> Vec<String> {
    let mut issues = Vec::new();
    for output in outputs.iter_mut() {
        output.catalog.touch_last_modified(at);
        issues.extend(
            output
                .catalog
                .shape_violations()
                .into_iter()
                .map(|violation| format!("{}: {violation}", output.label)),
        );
        if let Some(schema) = schema {
            if let Err(err) = schema.validate(output.catalog.root()) {
                issues.push(format!("{}: {err}", output.label));
            }
        }
    }
    issues
}

/// Generate, decode and merge one batch while holding a gate permit
async fn dispatch<J: EnrichmentJob>(
    unit: DispatchUnit,
    job: Arc<J>,
    client: Arc<dyn GenerationClient>,
    gate: ConcurrencyGate,
    dispatcher: RetryDispatcher,
    coordinator: Arc<MergeCoordinator>,
) -> BatchOutcome {
    let DispatchUnit {
        index,
        positions,
        mut items,
        missing,
    } = unit;
    let label = format!("batch {index}");

    let _permit = match gate.acquire().await {
        Ok(permit) => permit,
        Err(err) => {
            return BatchOutcome {
                index,
                positions,
                result: Err(RetryFailure {
                    label,
                    attempts: 0,
                    last_error: GenerationError::TransientServiceError(err.to_string()),
                }),
            }
        }
    };
    debug!(batch = index, items = items.len(), missing = ?missing, "dispatching");

    let result = {
        let job: &J = &job;
        let client: &dyn GenerationClient = client.as_ref();
        let batch: &[WorkItem] = &items;
        let missing: &[String] = &missing;
        let label: &str = &label;
        dispatcher
            .run(label, |attempt| async move {
                let request = job.request(label, batch, missing)?;
                debug!(batch = index, attempt, "calling {}", client.name());
                let output = client.generate(&request).await?;
                let results: Vec<ResultsMap> = job.decode(batch, missing, output)?;
                if results.len() != batch.len() {
                    return Err(GenerationError::MalformedOutput(format!(
                        "expected {} results, got {}",
                        batch.len(),
                        results.len()
                    )));
                }
                Ok(results)
            })
            .await
    };

    let result = result.map(|results| {
        for (item, results) in items.iter_mut().zip(results) {
            item.absorb(results);
            let report = coordinator.apply_all(&job.merge_ops(item));
            if !report.is_clean() {
                warn!(item_id = %item.id, dropped = report.dropped.len(), "results partly merged");
            }
        }
        items
    });

    BatchOutcome {
        index,
        positions,
        result,
    }
}
