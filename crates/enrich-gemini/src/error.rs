//! Client construction errors

/// Errors building a [`GeminiClient`](crate::GeminiClient)
///
/// Per-call failures are reported as
/// [`GenerationError`](enrich_core::GenerationError) instead.
#[derive(Debug, thiserror::Error)]
pub enum GeminiError {
    /// `GEMINI_API_KEY` not set
    #[error("GEMINI_API_KEY is not set")]
    MissingApiKey,

    /// HTTP client could not be built
    #[error("cannot build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}
