//! Run state machine
//!
//! A run moves through one linear chain of states. It can leave the chain
//! only for one of the `Aborted*` terminal states; per-unit failures never
//! change the run state.

use crate::error::EnrichError;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Orchestrator state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunState {
    /// Nothing done yet
    Init,
    /// Source tree parsed
    Loaded,
    /// Occurrences collected
    Extracted,
    /// Occurrences folded into work items
    Deduplicated,
    /// Checkpoint applied
    ProgressRestored,
    /// Pending items grouped
    Batched,
    /// Generation calls in flight
    Dispatching,
    /// Output trees being rendered
    Merging,
    /// Output trees being checked
    Validating,
    /// Outputs written
    Persisted,
    /// Finished
    Done,
    /// Settings missing or invalid
    AbortedConfig,
    /// Source tree unreadable
    AbortedSourceLoad,
    /// Output invalid and the policy is to abort, or the merged tree is no catalog
    AbortedValidation,
    /// An output could not be written
    AbortedPersist,
}

impl RunState {
    /// States reachable from `self` in one step
    #[must_use]
    pub fn allowed_transitions(self) -> &'static [RunState] {
        use RunState::*;
        match self {
            Init => &[Loaded, AbortedConfig, AbortedSourceLoad],
            Loaded => &[Extracted],
            Extracted => &[Deduplicated],
            Deduplicated => &[ProgressRestored],
            ProgressRestored => &[Batched],
            Batched => &[Dispatching],
            Dispatching => &[Merging],
            Merging => &[Validating, AbortedValidation],
            Validating => &[Persisted, AbortedValidation, AbortedPersist],
            Persisted => &[Done],
            Done | AbortedConfig | AbortedSourceLoad | AbortedValidation | AbortedPersist => &[],
        }
    }

    /// Whether no transition leaves this state
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self.allowed_transitions().is_empty()
    }

    /// Whether this is a failure state
    #[inline]
    #[must_use]
    pub fn is_aborted(self) -> bool {
        matches!(
            self,
            Self::AbortedConfig
                | Self::AbortedSourceLoad
                | Self::AbortedValidation
                | Self::AbortedPersist
        )
    }

    /// Whether `self -> to` is allowed
    #[inline]
    #[must_use]
    pub fn can_transition(self, to: RunState) -> bool {
        self.allowed_transitions().contains(&to)
    }
}

impl Display for RunState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Loaded => "loaded",
            Self::Extracted => "extracted",
            Self::Deduplicated => "deduplicated",
            Self::ProgressRestored => "progress-restored",
            Self::Batched => "batched",
            Self::Dispatching => "dispatching",
            Self::Merging => "merging",
            Self::Validating => "validating",
            Self::Persisted => "persisted",
            Self::Done => "done",
            Self::AbortedConfig => "aborted-config",
            Self::AbortedSourceLoad => "aborted-source-load",
            Self::AbortedValidation => "aborted-validation",
            Self::AbortedPersist => "aborted-persist",
        };
        f.write_str(name)
    }
}

/// Validate a transition
///
/// # Errors
/// [`EnrichError::IllegalTransition`] if the table forbids it
pub fn validate_transition(from: RunState, to: RunState) -> Result<(), EnrichError> {
    if from.can_transition(to) {
        Ok(())
    } else {
        Err(EnrichError::IllegalTransition { from, to })
    }
}
