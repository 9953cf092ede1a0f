//! Quality review of maturity-level prose
//!
//! For each control named by a component definition, the model reviews the
//! prose of the control's maturity levels. Its review is written next to the
//! reviewed text as `prose_qs`, and any controls it suggests are added to
//! the owning group.

use crate::config::{BatchConfig, EnrichConfig};
use crate::error::{ConfigError, EnrichError, GenerationError};
use crate::generation::GenerationRequest;
use crate::job::{EnrichmentJob, OutputArtifact};
use crate::jobs::{inline_schema_for, read_prompt, read_schema, single_item};
use crate::schema::OutputSchema;
use crate::store::ObjectStore;
use crate::work::{Extracted, ResultsMap, WorkItem};
use async_trait::async_trait;
use enrich_catalog::{Catalog, NodeKind, NodeRef};
use enrich_merge::{MergeOp, MergeTarget};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Name of the parts that hold maturity-level prose
pub const MATURITY_PART_NAME: &str = "maturity-level-description";

/// Field written onto every reviewed part
const REVIEW_FIELD: &str = "prose_qs";

const DIMENSION: &str = "quality";

const DEFAULT_PROMPT: &str = "You are a quality reviewer for the BSI IT-Grundschutz catalog.\n\
For every prose entry in `prose_to_evaluate`, assess whether the text is precise, testable and \
consistent with the control and its Baustein, and write an improved or confirmed version as \
`prose_qs`. If the Baustein lacks controls that the reviewed text clearly calls for, list them \
in `suggested_new_controls`; otherwise return an empty list.";

/// Review of one prose part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct EnrichedProse {
    /// Id of the reviewed part
    pub part_id: String,
    /// Reviewed prose
    pub prose_qs: String,
}

/// A part of a suggested control
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SuggestedPart {
    /// Part role, e.g. `statement`
    pub name: String,
    /// Part text
    pub prose: String,
}

/// A control the model proposes to add
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SuggestedControl {
    /// New control id
    pub id: String,
    /// New control title
    pub title: String,
    /// Content
    #[serde(default)]
    pub parts: Vec<SuggestedPart>,
}

/// Shape of one quality review
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct QualityAssessment {
    /// Per-part reviews
    pub enriched_prose: Vec<EnrichedProse>,
    /// Proposed additions to the group
    #[serde(default)]
    pub suggested_new_controls: Vec<SuggestedControl>,
}

/// Default output schema, derived from [`QualityAssessment`]
#[must_use]
pub fn default_quality_schema() -> Value {
    inline_schema_for::<QualityAssessment>()
}

/// Control ids implemented by a component definition document
#[must_use]
pub fn control_ids_from_component(document: &Value) -> Vec<String> {
    let components = document
        .pointer("/component-definition/components")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    components
        .iter()
        .filter_map(|c| c.get("control-implementations").and_then(Value::as_array))
        .flatten()
        .filter_map(|i| i.get("implemented-requirements").and_then(Value::as_array))
        .flatten()
        .filter_map(|r| r.get("control-id").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

fn maturity_prose(control: &NodeRef<'_>) -> Vec<Value> {
    control
        .children("parts")
        .filter(|part| part.name() == Some(MATURITY_PART_NAME))
        .flat_map(|level| {
            level
                .children("parts")
                .filter_map(|part| Some(json!({"part_id": part.id()?, "prose": part.prose()?})))
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Quality review of selected controls
#[derive(Debug, Clone)]
pub struct QualityCheckJob {
    prompt: String,
    schema: Arc<OutputSchema>,
    control_ids: Option<Vec<String>>,
}

impl QualityCheckJob {
    /// Job with the built-in prompt and schema
    ///
    /// # Errors
    /// [`ConfigError::InvalidSchema`] if the derived schema does not compile
    pub fn new() -> Result<Self, ConfigError> {
        Ok(Self {
            prompt: DEFAULT_PROMPT.to_string(),
            schema: Arc::new(OutputSchema::new(default_quality_schema())?),
            control_ids: None,
        })
    }

    /// Job with prompt and schema read from local files; either may be omitted
    ///
    /// # Errors
    /// [`ConfigError::File`] or [`ConfigError::InvalidSchema`]
    pub fn from_files(prompt: Option<&Path>, schema: Option<&Path>) -> Result<Self, ConfigError> {
        let mut job = Self::new()?;
        if let Some(path) = prompt {
            job.prompt = read_prompt(path)?;
        }
        if let Some(path) = schema {
            job.schema = Arc::new(OutputSchema::new(read_schema(path)?)?);
        }
        Ok(job)
    }

    /// Review only these controls instead of reading component files
    #[must_use]
    pub fn with_control_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.control_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Output schema
    #[inline]
    #[must_use]
    pub fn schema(&self) -> &OutputSchema {
        &self.schema
    }

    fn extract_control(catalog: &Catalog, control_id: &str) -> Option<Extracted> {
        let index = catalog.index();
        let Some(control) = index.find_by_id(control_id) else {
            warn!(control_id, "control not in catalog; skipped");
            return None;
        };
        let Some(group) = index.find_container_of_kind(NodeKind::Group, control_id) else {
            warn!(control_id, "no group owns this control; skipped");
            return None;
        };
        let Some(group_id) = group.id() else {
            warn!(control_id, "owning group has no id; skipped");
            return None;
        };

        let prose = maturity_prose(&control);
        if prose.is_empty() {
            info!(control_id, "no maturity prose to review; skipped");
            return None;
        }

        Some(Extracted::new(
            control_id,
            json!({
                "baustein_context": {"id": group_id, "title": group.title()},
                "control_context": {"id": control_id, "title": control.title()},
                "prose_to_evaluate": prose,
            }),
            MergeTarget::id(group_id),
        ))
    }
}

#[async_trait]
impl EnrichmentJob for QualityCheckJob {
    fn name(&self) -> &str {
        "quality"
    }

    async fn prepare(&mut self, store: &dyn ObjectStore, config: &EnrichConfig) -> Result<(), EnrichError> {
        if self.control_ids.is_some() {
            return Ok(());
        }
        let Some(prefix) = config.source_prefix.as_deref() else {
            info!("no component prefix configured; reviewing every control");
            return Ok(());
        };

        let keys = store
            .list(prefix)
            .await
            .map_err(|e| EnrichError::source_load(prefix, e))?;

        let mut ids = Vec::new();
        for key in keys.iter().filter(|k| k.ends_with(".json")) {
            let document = match store.get(key).await {
                Ok(bytes) => serde_json::from_slice::<Value>(&bytes),
                Err(err) => {
                    warn!(key, error = %err, "component file unreadable; skipped");
                    continue;
                }
            };
            match document {
                Ok(document) => {
                    let found = control_ids_from_component(&document);
                    debug!(key, controls = found.len(), "component file read");
                    ids.extend(found);
                }
                Err(err) => warn!(key, error = %err, "component file is not JSON; skipped"),
            }
        }

        if ids.is_empty() {
            warn!(prefix, "no controls found in component files");
        }
        self.control_ids = Some(ids);
        Ok(())
    }

    fn dimensions(&self) -> Vec<String> {
        vec![DIMENSION.to_string()]
    }

    fn extract(&self, catalog: &Catalog) -> Vec<Extracted> {
        match &self.control_ids {
            Some(ids) => ids
                .iter()
                .filter_map(|id| Self::extract_control(catalog, id))
                .collect(),
            None => catalog
                .index()
                .collect_kind(NodeKind::Control)
                .iter()
                .filter_map(NodeRef::id)
                .filter_map(|id| Self::extract_control(catalog, id))
                .collect(),
        }
    }

    fn batch_limits(&self, _config: &BatchConfig) -> BatchConfig {
        BatchConfig {
            limit_tokens: 0,
            overhead_tokens: 0,
        }
    }

    fn request(&self, label: &str, items: &[WorkItem], _missing: &[String]) -> Result<GenerationRequest, GenerationError> {
        let item = single_item(items)?;
        let input = serde_json::to_string_pretty(&item.payload).unwrap_or_default();
        let schema = serde_json::to_string_pretty(self.schema.original()).unwrap_or_default();
        Ok(GenerationRequest::new(
            label,
            format!(
                "{}\n\nInput:\n{input}\n\nYour response must be a single JSON object that validates against this schema:\n{schema}",
                self.prompt
            ),
            Arc::clone(&self.schema),
        ))
    }

    fn decode(&self, items: &[WorkItem], _missing: &[String], output: Value) -> Result<Vec<ResultsMap>, GenerationError> {
        single_item(items)?;
        if !output.get("enriched_prose").is_some_and(Value::is_array) {
            return Err(GenerationError::MalformedOutput(
                "`enriched_prose` must be an array".to_string(),
            ));
        }
        Ok(vec![ResultsMap::from([(DIMENSION.to_string(), output)])])
    }

    fn merge_ops(&self, item: &WorkItem) -> Vec<MergeOp> {
        let Some(review) = item.results.get(DIMENSION) else {
            return Vec::new();
        };

        let mut ops: Vec<MergeOp> = review
            .get("enriched_prose")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|entry| {
                let part_id = entry.get("part_id")?.as_str()?;
                let prose = entry.get("prose_qs")?.clone();
                Some(MergeOp::set_field(MergeTarget::id(part_id), REVIEW_FIELD, prose))
            })
            .collect();

        let suggested: Vec<Value> = review
            .get("suggested_new_controls")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if !suggested.is_empty() {
            ops.extend(
                item.targets
                    .iter()
                    .map(|group| MergeOp::append_replacing(group.clone(), "controls", "id", suggested.clone())),
            );
        }
        ops
    }

    fn render_outputs(&self, merged: &Catalog, _items: &[WorkItem]) -> Vec<OutputArtifact> {
        vec![OutputArtifact::new("quality", merged.clone())]
    }
}
