//! Run summaries

use crate::state::RunState;
use serde::Serialize;
use std::fmt::{self, Display, Formatter};
use ulid::Ulid;

/// Counters for one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Distinct work items after deduplication
    pub total: usize,
    /// Occurrences found in the tree
    pub occurrences: usize,
    /// Items whose results came entirely from the checkpoint
    pub already_complete: usize,
    /// Items sent to the generation service
    pub dispatched: usize,
    /// Dispatched items that ended the run complete
    pub succeeded: usize,
    /// Dispatched items still incomplete after the run
    pub failed: usize,
    /// Pending items left out by test mode
    pub skipped: usize,
    /// Batches formed
    pub batches: usize,
    /// Batches that failed after all attempts
    pub failed_batches: usize,
    /// Highest number of concurrent dispatches observed
    pub peak_in_flight: usize,
    /// Tree writes applied
    pub merges_applied: usize,
    /// Tree writes dropped
    pub merges_dropped: usize,
    /// Problems found by final validation
    pub validation_issues: usize,
}

/// Outcome of a completed run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Run identifier, also present on every log line of the run
    pub run_id: Ulid,
    /// Job name
    pub job: String,
    /// Final state
    pub state: RunState,
    /// Counters
    pub summary: RunSummary,
    /// Object paths written
    pub outputs: Vec<String>,
    /// Final validation problems, if any
    pub validation_issues: Vec<String>,
    /// Checkpoint path, if checkpointing was enabled
    pub checkpoint: Option<String>,
}

impl RunReport {
    /// Whether every dispatched item completed and the output validated
    #[inline]
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.summary.failed == 0 && self.validation_issues.is_empty()
    }
}

impl Display for RunReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = &self.summary;
        writeln!(f, "run {} ({}) finished in state {}", self.run_id, self.job, self.state)?;
        writeln!(
            f,
            "  items:      {} total ({} occurrences), {} already complete",
            s.total, s.occurrences, s.already_complete
        )?;
        writeln!(
            f,
            "  dispatched: {} ({} succeeded, {} failed, {} skipped)",
            s.dispatched, s.succeeded, s.failed, s.skipped
        )?;
        writeln!(
            f,
            "  batches:    {} ({} failed), peak concurrency {}",
            s.batches, s.failed_batches, s.peak_in_flight
        )?;
        writeln!(f, "  merges:     {} applied, {} dropped", s.merges_applied, s.merges_dropped)?;
        writeln!(f, "  validation: {} issue(s)", s.validation_issues)?;
        for output in &self.outputs {
            writeln!(f, "  wrote {output}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_lists_counts_and_outputs() {
        let report = RunReport {
            run_id: Ulid::nil(),
            job: "practice".to_string(),
            state: RunState::Done,
            summary: RunSummary {
                total: 4,
                dispatched: 3,
                succeeded: 2,
                failed: 1,
                ..RunSummary::default()
            },
            outputs: vec!["out/c_with_practices_20260101_000000.json".to_string()],
            validation_issues: Vec::new(),
            checkpoint: None,
        };
        let text = report.to_string();
        assert!(text.contains("state done"));
        assert!(text.contains("dispatched: 3 (2 succeeded, 1 failed, 0 skipped)"));
        assert!(text.contains("wrote out/c_with_practices_20260101_000000.json"));
        assert!(!report.is_clean());
    }
}
