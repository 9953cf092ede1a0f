//! Mapping Gemini replies onto generation error kinds

use enrich_core::GenerationError;
use serde::Deserialize;

/// Finish reasons that mean the model refused or was stopped by a filter
const BLOCKING_REASONS: &[&str] = &["SAFETY", "RECITATION", "BLOCKLIST", "PROHIBITED_CONTENT", "SPII"];

/// Longest body excerpt carried in an error message
const MAX_EXCERPT: usize = 300;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(MAX_EXCERPT) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

/// Error kind for a non-success HTTP status
pub(crate) fn classify_status(status: u16, body: &str) -> GenerationError {
    let message = format!("HTTP {status}: {}", excerpt(body));
    match status {
        429 | 500..=599 => GenerationError::TransientServiceError(message),
        _ => GenerationError::InvalidRequest(message),
    }
}

/// Error kind for a transport failure
pub(crate) fn classify_transport(err: &reqwest::Error) -> GenerationError {
    if err.is_builder() {
        GenerationError::InvalidRequest(err.to_string())
    } else {
        // timeouts, refused connections and dropped streams are worth another try
        GenerationError::TransientServiceError(err.to_string())
    }
}

/// Text of the first candidate of a successful reply
pub(crate) fn candidate_text(body: &str) -> Result<String, GenerationError> {
    let response: GenerateResponse = serde_json::from_str(body).map_err(|e| {
        GenerationError::MalformedOutput(format!("unreadable response ({e}): {}", excerpt(body)))
    })?;

    if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(GenerationError::Blocked(format!("prompt blocked: {reason}")));
    }

    let Some(candidate) = response.candidates.into_iter().next() else {
        return Err(GenerationError::MalformedOutput("response has no candidates".to_string()));
    };

    match candidate.finish_reason.as_deref() {
        None | Some("STOP" | "FINISH_REASON_UNSPECIFIED") => {}
        Some(reason) if BLOCKING_REASONS.contains(&reason) => {
            return Err(GenerationError::Blocked(format!("finish reason {reason}")));
        }
        Some("MAX_TOKENS") => {
            return Err(GenerationError::IncompleteOutput(
                "output cut off at the token limit".to_string(),
            ));
        }
        Some(reason) => {
            return Err(GenerationError::MalformedOutput(format!("finish reason {reason}")));
        }
    }

    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    if text.trim().is_empty() {
        return Err(GenerationError::MalformedOutput("candidate has no text".to_string()));
    }
    Ok(text)
}
