//! Practice classification, one control at a time
//!
//! The generated part is appended to the control's `parts` under the name
//! `practice`, replacing any practice part from an earlier run.

use crate::config::BatchConfig;
use crate::error::{ConfigError, GenerationError};
use crate::generation::GenerationRequest;
use crate::job::{EnrichmentJob, OutputArtifact};
use crate::jobs::{read_prompt, read_schema, single_item};
use crate::schema::OutputSchema;
use crate::work::{Extracted, ResultsMap, WorkItem};
use async_trait::async_trait;
use enrich_catalog::{Catalog, NodeKind};
use enrich_merge::{MergeOp, MergeTarget};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;

/// Part name the job writes
pub const PRACTICE_PART_NAME: &str = "practice";

/// Dimension under which results are kept
const DIMENSION: &str = "practice";

const DEFAULT_PROMPT: &str = "You are an expert in IT security management and the BSI IT-Grundschutz.\n\
Classify the control below by the security practice it belongs to and describe that practice.\n\
Answer with a single JSON object that matches the schema. Set `name` to \"practice\",\n\
put a short practice title in `title`, a one-paragraph description in `prose` and the\n\
practice classification as `props` entries (for example name \"practice\", value \"GOV\").";

/// Property on a generated part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PracticeProp {
    /// Property name
    pub name: String,
    /// Property value
    pub value: String,
}

/// Shape of a generated practice part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PracticePart {
    /// Always `practice`
    pub name: String,
    /// Practice title
    pub title: String,
    /// Practice description
    pub prose: String,
    /// Classification
    #[serde(default)]
    pub props: Vec<PracticeProp>,
}

/// Default output schema, derived from [`PracticePart`]
#[must_use]
pub fn default_practice_schema() -> Value {
    crate::jobs::inline_schema_for::<PracticePart>()
}

/// Practice generation for every control
#[derive(Debug, Clone)]
pub struct PracticeJob {
    prompt: String,
    schema: Arc<OutputSchema>,
}

impl PracticeJob {
    /// Job with the built-in prompt and schema
    ///
    /// # Errors
    /// [`ConfigError::InvalidSchema`] if the derived schema does not compile
    pub fn new() -> Result<Self, ConfigError> {
        Ok(Self {
            prompt: DEFAULT_PROMPT.to_string(),
            schema: Arc::new(OutputSchema::new(default_practice_schema())?),
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

    /// With a prompt text
    #[inline]
    #[must_use]
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    /// Output schema
    #[inline]
    #[must_use]
    pub fn schema(&self) -> &OutputSchema {
        &self.schema
    }
}

#[async_trait]
impl EnrichmentJob for PracticeJob {
    fn name(&self) -> &str {
        "practice"
    }

    fn dimensions(&self) -> Vec<String> {
        vec![DIMENSION.to_string()]
    }

    fn extract(&self, catalog: &Catalog) -> Vec<Extracted> {
        catalog
            .index()
            .collect_kind(NodeKind::Control)
            .into_iter()
            .filter_map(|control| {
                let id = control.id()?;
                Some(Extracted::new(
                    id,
                    json!({"id": id, "title": control.title()}),
                    MergeTarget::id(id),
                ))
            })
            .collect()
    }

    fn batch_limits(&self, _config: &BatchConfig) -> BatchConfig {
        BatchConfig {
            limit_tokens: 0,
            overhead_tokens: 0,
        }
    }

    fn request(&self, label: &str, items: &[WorkItem], _missing: &[String]) -> Result<GenerationRequest, GenerationError> {
        let item = single_item(items)?;
        let control = serde_json::to_string_pretty(&item.payload).unwrap_or_default();
        let schema = serde_json::to_string_pretty(self.schema.original()).unwrap_or_default();
        Ok(GenerationRequest::new(
            label,
            format!("{}\n\nControl data:\n{control}\n\nSchema for your JSON response:\n{schema}", self.prompt),
            Arc::clone(&self.schema),
        ))
    }

    fn decode(&self, items: &[WorkItem], _missing: &[String], output: Value) -> Result<Vec<ResultsMap>, GenerationError> {
        single_item(items)?;
        let Value::Object(mut part) = output else {
            return Err(GenerationError::MalformedOutput(
                "practice part must be an object".to_string(),
            ));
        };
        // the merge key must be exact or re-runs would not replace the part
        part.insert("name".to_string(), Value::String(PRACTICE_PART_NAME.to_string()));
        Ok(vec![ResultsMap::from([(
            DIMENSION.to_string(),
            Value::Object(part),
        )])])
    }

    fn merge_ops(&self, item: &WorkItem) -> Vec<MergeOp> {
        let Some(part) = item.results.get(DIMENSION) else {
            return Vec::new();
        };
        item.targets
            .iter()
            .map(|target| MergeOp::append_replacing(target.clone(), "parts", "name", vec![part.clone()]))
            .collect()
    }

    fn render_outputs(&self, merged: &Catalog, _items: &[WorkItem]) -> Vec<OutputArtifact> {
        vec![OutputArtifact::new("with_practices", merged.clone())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::deduplicate;
    use pretty_assertions::assert_eq;

    fn catalog() -> Catalog {
        Catalog::from_value(json!({
            "catalog": {
                "groups": [{
                    "id": "ORP.4",
                    "title": "Identitäts- und Berechtigungsmanagement",
                    "controls": [
                        {"id": "ORP.4.A1", "title": "Regelung für Benutzerkennungen", "parts": []},
                        {"id": "ORP.4.A2", "title": "Einrichtung von Benutzern"}
                    ]
                }]
            }
        }))
        .unwrap()
    }

    #[test]
    fn default_schema_is_conditioned() {
        let job = PracticeJob::new().unwrap();
        let conditioned = job.schema().conditioned();
        assert!(conditioned.get("$schema").is_none());
        assert!(conditioned.get("title").is_none());
        assert!(conditioned["properties"].get("title").is_some());
        assert!(job
            .schema()
            .validate(&json!({"name": "practice", "title": "IAM", "prose": "..."}))
            .is_ok());
        assert!(job.schema().validate(&json!({"name": "practice"})).is_err());
    }

    #[test]
    fn one_item_per_control() {
        let job = PracticeJob::new().unwrap();
        let items = deduplicate(job.extract(&catalog()));
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].fingerprint, "ORP.4.A1");
        assert_eq!(items[0].payload, json!({"id": "ORP.4.A1", "title": "Regelung für Benutzerkennungen"}));

        let request = job.request("ORP.4.A1", &items[..1], &job.dimensions()).unwrap();
        assert!(request.prompt.contains("\"ORP.4.A1\""));
        assert!(job.request("both", &items, &job.dimensions()).is_err());
    }

    #[test]
    fn decode_forces_part_name() {
        let job = PracticeJob::new().unwrap();
        let items = deduplicate(job.extract(&catalog()));
        let results = job
            .decode(&items[..1], &[], json!({"name": "Practice", "title": "IAM", "prose": "p"}))
            .unwrap();
        assert_eq!(results[0][DIMENSION]["name"], "practice");
    }

    #[test]
    fn merge_replaces_previous_practice() {
        let job = PracticeJob::new().unwrap();
        let mut items = deduplicate(job.extract(&catalog()));
        let mut tree = catalog().into_value();

        for title in ["first", "second"] {
            items[0].absorb(ResultsMap::from([(
                DIMENSION.to_string(),
                json!({"name": "practice", "title": title, "prose": "p"}),
            )]));
            for op in job.merge_ops(&items[0]) {
                op.apply(&mut tree).unwrap();
            }
        }

        let parts = tree["catalog"]["groups"][0]["controls"][0]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0]["title"], "second");
        assert!(job.merge_ops(&items[1]).is_empty());
    }
}
