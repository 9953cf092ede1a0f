//! Gemini connection settings

use crate::error::GeminiError;
use std::time::Duration;

/// Default model
pub const DEFAULT_MODEL: &str = "gemini-2.5-pro";

/// Default REST endpoint root
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Settings for [`GeminiClient`](crate::GeminiClient)
#[derive(Clone)]
pub struct GeminiConfig {
    /// API key sent as `x-goog-api-key`
    pub api_key: String,
    /// Model name, e.g. `gemini-2.5-pro`
    pub model: String,
    /// Endpoint root without trailing slash
    pub base_url: String,
    /// Sampling temperature
    pub temperature: f32,
    /// Output token cap
    pub max_output_tokens: u32,
    /// Whole-request timeout
    pub timeout: Duration,
}

impl std::fmt::Debug for GeminiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiConfig")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("temperature", &self.temperature)
            .field("max_output_tokens", &self.max_output_tokens)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl GeminiConfig {
    /// Settings with defaults for everything but the key
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            temperature: 0.2,
            max_output_tokens: 65_536,
            timeout: Duration::from_secs(300),
        }
    }

    /// Read `GEMINI_API_KEY`, `GEMINI_MODEL` and `GEMINI_BASE_URL`
    ///
    /// # Errors
    /// [`GeminiError::MissingApiKey`] when no key is set
    pub fn from_env() -> Result<Self, GeminiError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`Self::from_env`] over an arbitrary lookup
    ///
    /// # Errors
    /// [`GeminiError::MissingApiKey`] when no key is set
    pub fn from_lookup<F>(lookup: F) -> Result<Self, GeminiError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let api_key = non_empty("GEMINI_API_KEY").ok_or(GeminiError::MissingApiKey)?;
        let mut config = Self::new(api_key);
        if let Some(model) = non_empty("GEMINI_MODEL") {
            config.model = model;
        }
        if let Some(base) = non_empty("GEMINI_BASE_URL") {
            config.base_url = base.trim_end_matches('/').to_string();
        }
        Ok(config)
    }

    /// With model
    #[inline]
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// With endpoint root
    #[inline]
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// With temperature
    #[inline]
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// With request timeout
    #[inline]
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `generateContent` URL for the configured model
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }
}
