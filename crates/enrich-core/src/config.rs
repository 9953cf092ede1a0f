//! Run configuration
//!
//! [`EnrichConfig`] is built once, validated before any work starts and then
//! handed to the orchestrator by value. It can come from the process
//! environment, from a TOML file, or from code through the `with_*` builders.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// What to do when the merged tree fails its final validation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinalValidationPolicy {
    /// Report the problems and write the best-effort output anyway
    #[default]
    PersistAnyway,
    /// Report the problems and write nothing
    Abort,
}

impl FromStr for FinalValidationPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "persist" | "persist-anyway" => Ok(Self::PersistAnyway),
            "abort" => Ok(Self::Abort),
            other => Err(ConfigError::invalid(
                "FINAL_VALIDATION",
                format!("expected `persist` or `abort`, got `{other}`"),
            )),
        }
    }
}

/// Retry and backoff settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per work unit, including the first
    pub max_attempts: u32,
    /// Delay after the first failed attempt, in milliseconds
    pub base_delay_ms: u64,
    /// Exponential growth factor per attempt (must exceed 1)
    pub factor: f64,
    /// Extra multiplier applied for transient service errors
    pub transient_multiplier: f64,
    /// Upper bound of the random jitter, as a fraction of the delay
    pub jitter: f64,
    /// Ceiling for any single delay, in milliseconds
    pub max_delay_ms: u64,
}

impl RetryConfig {
    /// Base delay as a [`Duration`]
    #[inline]
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Delay ceiling as a [`Duration`]
    #[inline]
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 5_000,
            factor: 2.0,
            transient_multiplier: 2.0,
            jitter: 0.5,
            max_delay_ms: 300_000,
        }
    }
}

/// Batch sizing for jobs that batch by token estimate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Budget per batch, in estimated tokens
    pub limit_tokens: usize,
    /// Fixed prompt overhead counted against the budget
    pub overhead_tokens: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            limit_tokens: 4_000,
            overhead_tokens: 200,
        }
    }
}

/// Enrichment run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichConfig {
    /// Object path of the source catalog
    pub source_path: String,
    /// Object prefix for output artifacts
    pub output_prefix: String,
    /// Object prefix of auxiliary inputs: component definitions or Baustein source documents
    pub source_prefix: Option<String>,
    /// Object prefix for checkpoint files
    pub progress_prefix: String,
    /// Whether to load and save checkpoints
    pub checkpoint: bool,
    /// Maximum in-flight generation calls
    pub concurrency: usize,
    /// Retry settings
    pub retry: RetryConfig,
    /// Batch sizing
    pub batch: BatchConfig,
    /// Final validation policy
    pub final_validation: FinalValidationPolicy,
    /// Process only a small sample of pending items
    pub test_mode: bool,
    /// Local file holding a JSON Schema for the whole output catalog
    pub catalog_schema_path: Option<String>,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            source_path: String::new(),
            output_prefix: String::new(),
            source_prefix: None,
            progress_prefix: "progress".to_string(),
            checkpoint: true,
            concurrency: 5,
            retry: RetryConfig::default(),
            batch: BatchConfig::default(),
            final_validation: FinalValidationPolicy::default(),
            test_mode: false,
            catalog_schema_path: None,
        }
    }
}

impl EnrichConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read settings from the process environment
    ///
    /// # Errors
    /// [`ConfigError::Invalid`] if a present variable cannot be parsed.
    /// Missing required settings are reported later by [`Self::validate`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary variable lookup
    ///
    /// # Errors
    /// [`ConfigError::Invalid`] if a present variable cannot be parsed
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(path) = var("EXISTING_JSON_GCS_PATH") {
            config.source_path = path;
        }
        if let Some(prefix) = var("OUTPUT_PREFIX") {
            config.output_prefix = prefix;
        }
        config.source_prefix = var("SOURCE_PREFIX");
        if let Some(prefix) = var("PROGRESS_PREFIX") {
            config.progress_prefix = prefix;
        }
        if let Some(raw) = var("CONCURRENCY") {
            config.concurrency = raw
                .parse()
                .map_err(|e| ConfigError::invalid("CONCURRENCY", e))?;
        }
        if let Some(raw) = var("MAX_ATTEMPTS") {
            config.retry.max_attempts = raw
                .parse()
                .map_err(|e| ConfigError::invalid("MAX_ATTEMPTS", e))?;
        }
        if let Some(raw) = var("FINAL_VALIDATION") {
            config.final_validation = raw.parse()?;
        }
        if let Some(raw) = var("TEST") {
            config.test_mode = parse_flag(&raw);
        }
        config.catalog_schema_path = var("CATALOG_SCHEMA_PATH");

        Ok(config)
    }

    /// Load settings from a TOML file
    ///
    /// # Errors
    /// [`ConfigError::File`] if the file cannot be read or parsed
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let file_error = |reason: String| ConfigError::File {
            path: path.display().to_string(),
            reason,
        };
        let raw = std::fs::read_to_string(path).map_err(|e| file_error(e.to_string()))?;
        toml::from_str(&raw).map_err(|e| file_error(e.to_string()))
    }

    /// Check that the configuration can drive a run
    ///
    /// # Errors
    /// - [`ConfigError::Missing`] for an empty source path or output prefix
    /// - [`ConfigError::Invalid`] for out-of-range numbers
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source_path.trim().is_empty() {
            return Err(ConfigError::Missing("EXISTING_JSON_GCS_PATH"));
        }
        if self.output_prefix.trim().is_empty() {
            return Err(ConfigError::Missing("OUTPUT_PREFIX"));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::invalid("CONCURRENCY", "must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("MAX_ATTEMPTS", "must be at least 1"));
        }
        if !(self.retry.factor > 1.0 && self.retry.factor.is_finite()) {
            return Err(ConfigError::invalid("retry.factor", "must be greater than 1"));
        }
        if !(self.retry.transient_multiplier >= 1.0 && self.retry.transient_multiplier.is_finite())
        {
            return Err(ConfigError::invalid(
                "retry.transient_multiplier",
                "must be at least 1",
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::invalid("retry.jitter", "must lie in [0, 1]"));
        }
        if self.batch.limit_tokens == 0 {
            return Err(ConfigError::invalid("batch.limit_tokens", "must be positive"));
        }
        Ok(())
    }

    /// With source catalog path
    #[inline]
    #[must_use]
    pub fn with_source_path(mut self, path: impl Into<String>) -> Self {
        self.source_path = path.into();
        self
    }

    /// With output prefix
    #[inline]
    #[must_use]
    pub fn with_output_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.output_prefix = prefix.into();
        self
    }

    /// With component description prefix
    #[inline]
    #[must_use]
    pub fn with_source_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.source_prefix = Some(prefix.into());
        self
    }

    /// With checkpoint prefix
    #[inline]
    #[must_use]
    pub fn with_progress_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.progress_prefix = prefix.into();
        self
    }

    /// Enable or disable checkpoints
    #[inline]
    #[must_use]
    pub fn with_checkpoint(mut self, enabled: bool) -> Self {
        self.checkpoint = enabled;
        self
    }

    /// With maximum in-flight generation calls
    #[inline]
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// With retry settings
    #[inline]
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// With batch sizing
    #[inline]
    #[must_use]
    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    /// With final validation policy
    #[inline]
    #[must_use]
    pub fn with_final_validation(mut self, policy: FinalValidationPolicy) -> Self {
        self.final_validation = policy;
        self
    }

    /// Enable or disable test mode
    #[inline]
    #[must_use]
    pub fn with_test_mode(mut self, enabled: bool) -> Self {
        self.test_mode = enabled;
        self
    }

    /// With a JSON Schema file for the output catalog
    #[inline]
    #[must_use]
    pub fn with_catalog_schema_path(mut self, path: impl Into<String>) -> Self {
        self.catalog_schema_path = Some(path.into());
        self
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
