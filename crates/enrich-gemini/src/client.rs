//! HTTP client for `generateContent`

use crate::config::GeminiConfig;
use crate::error::GeminiError;
use crate::response::{candidate_text, classify_status, classify_transport};
use async_trait::async_trait;
use enrich_core::{parse_model_json, GenerationClient, GenerationError, GenerationRequest};
use serde_json::{json, Value};
use tracing::{debug, warn};

/// Gemini-backed [`GenerationClient`]
///
/// Sends the conditioned schema as `responseSchema`, then validates the
/// parsed reply against the original one.
pub struct GeminiClient {
    http: reqwest::Client,
    config: GeminiConfig,
}

impl std::fmt::Debug for GeminiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiClient").field("config", &self.config).finish_non_exhaustive()
    }
}

impl GeminiClient {
    /// Build a client
    ///
    /// # Errors
    /// [`GeminiError::Http`] if the HTTP client cannot be built
    pub fn new(config: GeminiConfig) -> Result<Self, GeminiError> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { http, config })
    }

    /// Build a client from `GEMINI_*` environment variables
    ///
    /// # Errors
    /// See [`GeminiConfig::from_env`] and [`Self::new`]
    pub fn from_env() -> Result<Self, GeminiError> {
        Self::new(GeminiConfig::from_env()?)
    }

    /// Settings in use
    #[inline]
    #[must_use]
    pub fn config(&self) -> &GeminiConfig {
        &self.config
    }

    /// Request body for `request`
    ///
    /// A source document goes first, as a `fileData` part the service fetches.
    #[must_use]
    pub fn request_body(&self, request: &GenerationRequest) -> Value {
        let mut parts = Vec::with_capacity(2);
        if let Some(document) = &request.document {
            parts.push(json!({"fileData": {"mimeType": document.mime_type, "fileUri": document.uri}}));
        }
        parts.push(json!({"text": request.prompt}));
        json!({
            "contents": [{"role": "user", "parts": parts}],
            "generationConfig": {
                "responseMimeType": "application/json",
                "responseSchema": request.schema.conditioned(),
                "temperature": self.config.temperature,
                "maxOutputTokens": self.config.max_output_tokens,
            }
        })
    }
}

#[async_trait]
impl GenerationClient for GeminiClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<Value, GenerationError> {
        let url = self.config.endpoint();
        debug!(label = %request.label, model = %self.config.model, prompt_chars = request.prompt.len(), "generateContent");

        let resp = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.config.api_key)
            .json(&self.request_body(request))
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| classify_transport(&e))?;
        if !status.is_success() {
            warn!(label = %request.label, status = status.as_u16(), "generateContent failed");
            return Err(classify_status(status.as_u16(), &body));
        }

        let text = candidate_text(&body)?;
        let output = parse_model_json(&text)?;
        request.schema.validate(&output)?;
        Ok(output)
    }

    fn name(&self) -> &str {
        "gemini"
    }
}
