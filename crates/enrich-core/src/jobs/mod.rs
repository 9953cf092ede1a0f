//! The pipeline variants shipped with the crate

mod practice;
mod quality;
mod stub;
mod translate;

pub use practice::{default_practice_schema, PracticeJob, PracticePart, PracticeProp, PRACTICE_PART_NAME};
pub use quality::{
    control_ids_from_component, default_quality_schema, EnrichedProse, QualityAssessment,
    QualityCheckJob, SuggestedControl, SuggestedPart, MATURITY_PART_NAME,
};
pub use stub::{
    baustein_id_from_name, default_stub_schema, document_mime_type, PartsStub, StubJob, StubPart,
};
pub use translate::{language_name, TranslationJob, FAILURE_MARKER, LANGUAGES, TRANSLATED_FIELDS};

use crate::error::{ConfigError, GenerationError};
use crate::work::WorkItem;
use schemars::gen::SchemaSettings;
use schemars::JsonSchema;
use serde_json::Value;
use std::path::Path;

/// JSON Schema for `T` with every sub-schema inlined
///
/// The generation service does not resolve `$ref`, so nothing may point
/// into `definitions`.
pub(crate) fn inline_schema_for<T: JsonSchema>() -> Value {
    let generator = SchemaSettings::draft07()
        .with(|settings| settings.inline_subschemas = true)
        .into_generator();
    serde_json::to_value(generator.into_root_schema_for::<T>()).unwrap_or_default()
}

/// Read a prompt template
pub(crate) fn read_prompt(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|e| ConfigError::File {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Read a JSON Schema file
pub(crate) fn read_schema(path: &Path) -> Result<Value, ConfigError> {
    let raw = read_prompt(path)?;
    serde_json::from_str(&raw).map_err(|e| ConfigError::File {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// The only item of a per-item batch
pub(crate) fn single_item(items: &[WorkItem]) -> Result<&WorkItem, GenerationError> {
    match items {
        [item] => Ok(item),
        _ => Err(GenerationError::InvalidRequest(format!(
            "expected a single item, got {}",
            items.len()
        ))),
    }
}
