//! Generation client contract
//!
//! A client turns a [`GenerationRequest`] into JSON that already satisfies
//! the request's [`OutputSchema`], or fails with one [`GenerationError`]
//! kind. Retrying, pacing and merging are the caller's business.

use crate::error::GenerationError;
use crate::schema::OutputSchema;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// A stored document the model reads before the prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRef {
    /// Location the service can fetch, e.g. `gs://bucket/sources/OPS.1.1.2.pdf`
    pub uri: String,
    /// Media type, e.g. `application/pdf`
    pub mime_type: String,
}

impl DocumentRef {
    /// Create a reference
    #[inline]
    #[must_use]
    pub fn new(uri: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            mime_type: mime_type.into(),
        }
    }
}

/// One call to the generation service
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Human-readable label for logs (batch or item)
    pub label: String,
    /// Full prompt text
    pub prompt: String,
    /// Expected output shape
    pub schema: Arc<OutputSchema>,
    /// Source document, for jobs that work from one
    pub document: Option<DocumentRef>,
}

impl GenerationRequest {
    /// Create a request
    #[inline]
    #[must_use]
    pub fn new(label: impl Into<String>, prompt: impl Into<String>, schema: Arc<OutputSchema>) -> Self {
        Self {
            label: label.into(),
            prompt: prompt.into(),
            schema,
            document: None,
        }
    }

    /// With a source document
    #[inline]
    #[must_use]
    pub fn with_document(mut self, document: DocumentRef) -> Self {
        self.document = Some(document);
        self
    }
}

/// Capability: generate schema-valid structured output
#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// Generate output for `request`
    ///
    /// # Errors
    /// Any [`GenerationError`] kind; implementations validate against
    /// `request.schema` and report violations as
    /// [`GenerationError::MalformedOutput`].
    async fn generate(&self, request: &GenerationRequest) -> Result<Value, GenerationError>;

    /// Backend name for logs
    fn name(&self) -> &str {
        "generation"
    }
}

#[async_trait]
impl<C: GenerationClient + ?Sized> GenerationClient for Arc<C> {
    async fn generate(&self, request: &GenerationRequest) -> Result<Value, GenerationError> {
        (**self).generate(request).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
