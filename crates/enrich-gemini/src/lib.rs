//! Gemini backend
//!
//! [`GeminiClient`] implements [`GenerationClient`](enrich_core::GenerationClient)
//! over the `generateContent` REST endpoint with JSON response mode. Replies
//! are sorted into the pipeline's error kinds:
//!
//! | Reply | Kind |
//! |-------|------|
//! | HTTP 429, 5xx, timeouts | `TransientServiceError` |
//! | other HTTP 4xx | `InvalidRequest` |
//! | prompt block, safety-type finish reasons | `Blocked` |
//! | `MAX_TOKENS` | `IncompleteOutput` |
//! | anything else unusable | `MalformedOutput` |

#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod client;
mod config;
mod error;
mod response;

pub use client::GeminiClient;
pub use config::{GeminiConfig, DEFAULT_BASE_URL, DEFAULT_MODEL};
pub use error::GeminiError;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
