//! Error types for the enrichment pipeline
//!
//! Two failure classes end a run: configuration problems and an unreadable
//! source catalog. Everything else is contained at the boundary of the work
//! unit it happened in:
//! - [`GenerationError`]: recovered by retry, or the unit is skipped
//! - merge failures: the one result is dropped
//! - [`StoreError`] on checkpoints: logged, the run continues

use crate::state::RunState;

/// Top-level run error
#[derive(Debug, thiserror::Error)]
pub enum EnrichError {
    /// Required settings missing or invalid
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Source catalog could not be fetched or parsed
    #[error("cannot load source catalog {path}: {reason}")]
    SourceLoad {
        /// Object path of the source
        path: String,
        /// What went wrong
        reason: String,
    },

    /// Final tree failed validation and the policy is to abort
    #[error("final validation failed with {count} issue(s); first: {first}")]
    FinalValidation {
        /// Number of issues found
        count: usize,
        /// First issue, for the log line
        first: String,
    },

    /// Orchestrator attempted a transition its state machine forbids
    #[error("illegal state transition {from:?} -> {to:?}")]
    IllegalTransition {
        /// Current state
        from: RunState,
        /// Requested state
        to: RunState,
    },

    /// Output could not be written
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

impl EnrichError {
    /// Process exit code for this error
    #[inline]
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 2,
            Self::SourceLoad { .. } => 3,
            Self::FinalValidation { .. } => 4,
            Self::IllegalTransition { .. } | Self::Store(_) => 1,
        }
    }

    /// Build a source load error
    #[inline]
    pub fn source_load(path: impl Into<String>, reason: impl ToString) -> Self {
        Self::SourceLoad {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required setting is absent or empty
    #[error("missing required setting {0}")]
    Missing(&'static str),

    /// A setting has an unusable value
    #[error("invalid value for {key}: {reason}")]
    Invalid {
        /// Setting name
        key: &'static str,
        /// Why it was rejected
        reason: String,
    },

    /// A configuration or asset file could not be read
    #[error("cannot read {path}: {reason}")]
    File {
        /// File path
        path: String,
        /// What went wrong
        reason: String,
    },

    /// An output schema does not compile
    #[error("invalid output schema: {0}")]
    InvalidSchema(String),
}

impl ConfigError {
    /// Build an invalid-value error
    #[inline]
    pub fn invalid(key: &'static str, reason: impl ToString) -> Self {
        Self::Invalid {
            key,
            reason: reason.to_string(),
        }
    }
}

/// Failure of one generation call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    /// Content-safety or similar permanent rejection
    #[error("blocked: {0}")]
    Blocked(String),

    /// Output is not JSON, fails its schema, or has the wrong cardinality
    #[error("malformed output: {0}")]
    MalformedOutput(String),

    /// Rate limit, server error or transport failure
    #[error("transient service error: {0}")]
    TransientServiceError(String),

    /// Output was cut off before completion
    #[error("incomplete output: {0}")]
    IncompleteOutput(String),

    /// The service refused the request itself (authentication, bad model, ...)
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl GenerationError {
    /// Check if another attempt may succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Blocked(_) | Self::InvalidRequest(_))
    }

    /// Check if the backoff should be lengthened
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientServiceError(_))
    }

    /// Short kind name for logs and summaries
    #[inline]
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Blocked(_) => "blocked",
            Self::MalformedOutput(_) => "malformed-output",
            Self::TransientServiceError(_) => "transient",
            Self::IncompleteOutput(_) => "incomplete-output",
            Self::InvalidRequest(_) => "invalid-request",
        }
    }
}

/// Object storage errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No object at this path
    #[error("object not found: {0}")]
    NotFound(String),

    /// Path is empty or escapes the store root
    #[error("invalid object path: {0}")]
    InvalidPath(String),

    /// Backend I/O failure
    #[error("i/o error on {path}: {source}")]
    Io {
        /// Object path
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    /// Check if this is a missing object
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
