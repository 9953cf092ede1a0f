//! Parts stubs generated from Baustein source documents
//!
//! Every document under the source prefix describes one Baustein. The model
//! reads the document and answers with the Baustein id and its top-level
//! `parts`; those replace the `parts` of the group with that id.

use crate::config::{BatchConfig, EnrichConfig};
use crate::error::{ConfigError, EnrichError, GenerationError};
use crate::generation::{DocumentRef, GenerationRequest};
use crate::job::{EnrichmentJob, OutputArtifact};
use crate::jobs::{inline_schema_for, read_prompt, read_schema, single_item};
use crate::schema::OutputSchema;
use crate::store::ObjectStore;
use crate::work::{Extracted, ResultsMap, WorkItem};
use async_trait::async_trait;
use enrich_catalog::{Catalog, NodeKind};
use enrich_merge::{MergeOp, MergeTarget};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

const DIMENSION: &str = "stub";

/// Document extensions the job picks up, with their media types
const DOCUMENT_TYPES: [(&str, &str); 4] = [
    ("pdf", "application/pdf"),
    ("txt", "text/plain"),
    ("md", "text/markdown"),
    ("html", "text/html"),
];

const DEFAULT_PROMPT: &str = "You are an expert for the BSI IT-Grundschutz-Kompendium.\n\
The attached document describes exactly one Baustein. Return its id (for example \"OPS.1.1.2\") \
as `id` and the Baustein's descriptive sections as `parts`: one part per section such as \
introduction, objective, scope and threat landscape, each with a short machine-readable `name`, \
the section heading as `title` and the section text as `prose`. Do not include the requirements.";

/// One generated section of a Baustein
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StubPart {
    /// Section role, e.g. `introduction`
    pub name: String,
    /// Section heading
    pub title: String,
    /// Section text
    pub prose: String,
}

/// Shape of one parts stub
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PartsStub {
    /// Baustein id
    pub id: String,
    /// Replacement for the group's `parts`
    pub parts: Vec<StubPart>,
}

/// Default output schema, derived from [`PartsStub`]
#[must_use]
pub fn default_stub_schema() -> Value {
    inline_schema_for::<PartsStub>()
}

/// Media type of a source document, by extension
#[must_use]
pub fn document_mime_type(key: &str) -> Option<&'static str> {
    let (_, extension) = key.rsplit_once('.')?;
    DOCUMENT_TYPES
        .iter()
        .find(|(known, _)| extension.eq_ignore_ascii_case(known))
        .map(|(_, mime)| *mime)
}

/// Baustein id a document's file name starts with
///
/// `sources/OPS.1.1.2_Ordnungsgemaesse_IT-Administration.pdf` gives
/// `OPS.1.1.2`. Names that do not start with an id give `None`.
#[must_use]
pub fn baustein_id_from_name(key: &str) -> Option<&str> {
    let name = key.rsplit('/').next().unwrap_or(key);
    let stem = name.rsplit_once('.').map_or(name, |(stem, _)| stem);
    let candidate = stem.split(['_', ' ']).next()?;

    let mut segments = candidate.split('.');
    let layer = segments.next()?;
    let layer_ok = (2..=4).contains(&layer.len()) && layer.chars().all(|c| c.is_ascii_uppercase());
    let mut numbers = segments.peekable();
    let numbers_ok = numbers.peek().is_some()
        && numbers.all(|segment| !segment.is_empty() && segment.chars().all(|c| c.is_ascii_digit()));
    (layer_ok && numbers_ok).then_some(candidate)
}

/// Parts stubs for every Baustein document under the source prefix
#[derive(Debug, Clone)]
pub struct StubJob {
    prompt: String,
    schema: Arc<OutputSchema>,
    document_base: Option<String>,
    documents: Vec<String>,
}

impl StubJob {
    /// Job with the built-in prompt and schema
    ///
    /// # Errors
    /// [`ConfigError::InvalidSchema`] if the derived schema does not compile
    pub fn new() -> Result<Self, ConfigError> {
        Ok(Self {
            prompt: DEFAULT_PROMPT.to_string(),
            schema: Arc::new(OutputSchema::new(default_stub_schema())?),
            document_base: None,
            documents: Vec::new(),
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

    /// Prefix the service fetches documents under, e.g. `gs://bucket`
    ///
    /// Without one the object key itself is sent.
    #[must_use]
    pub fn with_document_base(mut self, base: impl Into<String>) -> Self {
        self.document_base = Some(base.into());
        self
    }

    /// Output schema
    #[inline]
    #[must_use]
    pub fn schema(&self) -> &OutputSchema {
        &self.schema
    }

    /// Documents found by [`prepare`](EnrichmentJob::prepare)
    #[inline]
    #[must_use]
    pub fn documents(&self) -> &[String] {
        &self.documents
    }

    fn document_uri(&self, key: &str) -> String {
        match &self.document_base {
            Some(base) => format!("{}/{key}", base.trim_end_matches('/')),
            None => key.to_string(),
        }
    }
}

#[async_trait]
impl EnrichmentJob for StubJob {
    fn name(&self) -> &str {
        "stub"
    }

    async fn prepare(&mut self, store: &dyn ObjectStore, config: &EnrichConfig) -> Result<(), EnrichError> {
        let prefix = config
            .source_prefix
            .as_deref()
            .ok_or(ConfigError::Missing("SOURCE_PREFIX"))?;
        let keys = store
            .list(prefix)
            .await
            .map_err(|e| EnrichError::source_load(prefix, e))?;

        self.documents = keys
            .into_iter()
            .filter(|key| {
                let known = document_mime_type(key).is_some();
                if !known {
                    debug!(key, "not a source document; skipped");
                }
                known
            })
            .collect();

        if self.documents.is_empty() {
            warn!(prefix, "no source documents found");
        } else {
            info!(prefix, documents = self.documents.len(), "source documents listed");
        }
        Ok(())
    }

    fn dimensions(&self) -> Vec<String> {
        vec![DIMENSION.to_string()]
    }

    fn extract(&self, catalog: &Catalog) -> Vec<Extracted> {
        let index = catalog.index();
        self.documents
            .iter()
            .map(|key| {
                let hint = baustein_id_from_name(key);
                match hint {
                    Some(id) if index.find_by_id(id).is_some_and(|n| n.kind() == NodeKind::Group) => {}
                    Some(id) => warn!(key, id, "no group with this id; the answer's id decides"),
                    None => debug!(key, "no Baustein id in file name"),
                }
                Extracted::new(
                    key.as_str(),
                    json!({"document": key, "baustein_id": hint}),
                    MergeTarget::id(hint.unwrap_or(key.as_str())),
                )
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
        let key = item
            .payload
            .get("document")
            .and_then(Value::as_str)
            .unwrap_or(&item.fingerprint);
        let mime_type = document_mime_type(key)
            .ok_or_else(|| GenerationError::InvalidRequest(format!("unsupported document `{key}`")))?;

        let hint = item
            .payload
            .get("baustein_id")
            .and_then(Value::as_str)
            .map(|id| format!("\n\nThe file name suggests the Baustein `{id}`."))
            .unwrap_or_default();
        let schema = serde_json::to_string_pretty(self.schema.original()).unwrap_or_default();
        let prompt = format!("{}{hint}\n\nSchema for your JSON response:\n{schema}", self.prompt);

        Ok(GenerationRequest::new(label, prompt, Arc::clone(&self.schema))
            .with_document(DocumentRef::new(self.document_uri(key), mime_type)))
    }

    fn decode(&self, items: &[WorkItem], _missing: &[String], output: Value) -> Result<Vec<ResultsMap>, GenerationError> {
        single_item(items)?;
        if !output.get("id").and_then(Value::as_str).is_some_and(|id| !id.trim().is_empty()) {
            return Err(GenerationError::MalformedOutput("stub has no `id`".to_string()));
        }
        if !output.get("parts").is_some_and(Value::is_array) {
            return Err(GenerationError::MalformedOutput(
                "`parts` must be an array".to_string(),
            ));
        }
        Ok(vec![ResultsMap::from([(DIMENSION.to_string(), output)])])
    }

    fn merge_ops(&self, item: &WorkItem) -> Vec<MergeOp> {
        let Some(stub) = item.results.get(DIMENSION) else {
            return Vec::new();
        };
        let Some(parts) = stub.get("parts").filter(|parts| parts.is_array()) else {
            return Vec::new();
        };
        let targets = match stub.get("id").and_then(Value::as_str) {
            Some(id) => vec![MergeTarget::id(id.trim())],
            None => item.targets.clone(),
        };
        targets
            .into_iter()
            .map(|target| MergeOp::set_field(target, "parts", parts.clone()))
            .collect()
    }

    fn render_outputs(&self, merged: &Catalog, _items: &[WorkItem]) -> Vec<OutputArtifact> {
        vec![OutputArtifact::new("with_parts", merged.clone())]
    }
}
