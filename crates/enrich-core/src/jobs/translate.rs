//! Translation of every `prose` and `title` string
//!
//! Identical source strings are translated once. Batches ask for the union
//! of languages still missing among their items; each language ends up in
//! its own output tree.

use crate::error::GenerationError;
use crate::generation::GenerationRequest;
use crate::job::{EnrichmentJob, OutputArtifact};
use crate::schema::OutputSchema;
use crate::work::{Extracted, ResultsMap, WorkItem};
use async_trait::async_trait;
use enrich_catalog::Catalog;
use enrich_merge::{MergeCoordinator, MergeOp, MergeTarget};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::warn;

/// Fields whose string values are translated
pub const TRANSLATED_FIELDS: [&str; 2] = ["prose", "title"];

/// Placeholder the model returns when it cannot translate a text
pub const FAILURE_MARKER: &str = "TRANSLATION FAILED";

/// Known target languages: code and English name
pub const LANGUAGES: [(&str, &str); 14] = [
    ("en", "english"),
    ("fr", "french"),
    ("nl", "dutch"),
    ("es", "spanish"),
    ("it", "italian"),
    ("cs", "czech"),
    ("hu", "hungarian"),
    ("ps", "pashtu"),
    ("fa", "farsi"),
    ("hi", "hindi"),
    ("zh", "chinese"),
    ("ja", "japanese"),
    ("ru", "russian"),
    ("ko", "korean"),
];

/// English name of a language code
#[must_use]
pub fn language_name(code: &str) -> Option<&'static str> {
    LANGUAGES
        .iter()
        .find(|(known, _)| *known == code)
        .map(|(_, name)| *name)
}

/// Batch translation into a set of languages
#[derive(Debug, Clone)]
pub struct TranslationJob {
    languages: Vec<String>,
    source_language: String,
}

impl TranslationJob {
    /// Translate into `languages` (codes such as `en`)
    #[must_use]
    pub fn new<I, S>(languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            languages: languages.into_iter().map(Into::into).collect(),
            source_language: "German".to_string(),
        }
    }

    /// Every known language
    #[must_use]
    pub fn all_languages() -> Self {
        Self::new(LANGUAGES.iter().map(|(code, _)| *code))
    }

    /// With the language of the source texts, as written in the prompt
    #[inline]
    #[must_use]
    pub fn with_source_language(mut self, language: impl Into<String>) -> Self {
        self.source_language = language.into();
        self
    }

    /// Target language codes
    #[inline]
    #[must_use]
    pub fn languages(&self) -> &[String] {
        &self.languages
    }

    fn batch_schema(items: &[WorkItem], missing: &[String]) -> Value {
        let entry = json!({
            "type": "object",
            "properties": missing
                .iter()
                .map(|lang| (lang.clone(), json!({"type": "string"})))
                .collect::<Map<String, Value>>(),
            "required": missing,
        });
        let ids: Vec<String> = items.iter().map(|item| item.id.to_string()).collect();
        json!({
            "type": "object",
            "properties": ids
                .iter()
                .map(|id| (id.clone(), entry.clone()))
                .collect::<Map<String, Value>>(),
            "required": ids,
            "additionalProperties": false,
        })
    }

    fn prompt(&self, items: &[WorkItem], missing: &[String]) -> String {
        let texts: Map<String, Value> = items
            .iter()
            .map(|item| (item.id.to_string(), item.payload.clone()))
            .collect();
        let codes = missing.join(", ");
        let texts = serde_json::to_string_pretty(&texts).unwrap_or_default();
        let source = &self.source_language;
        format!(
            "You are a professional translator and an expert in IT security terminology.\n\
             Translate the {source} texts below into all of these languages: {codes}.\n\
             The texts are given as a JSON object keyed by text id.\n\n\
             Rules:\n\
             1. Keep the professional tone and precise meaning of an IT security expert.\n\
             2. Return one JSON object and nothing else.\n\
             3. Its keys are exactly the text ids of the input.\n\
             4. Each value is an object mapping every language code ({codes}) to the translation.\n\
             5. Do not translate ids or language codes.\n\
             6. If a text cannot be translated into a language, return \"{FAILURE_MARKER}\" for it.\n\n\
             Texts:\n{texts}\n"
        )
    }
}

#[async_trait]
impl EnrichmentJob for TranslationJob {
    fn name(&self) -> &str {
        "translate"
    }

    fn dimensions(&self) -> Vec<String> {
        self.languages.clone()
    }

    fn extract(&self, catalog: &Catalog) -> Vec<Extracted> {
        catalog
            .index()
            .extract_text_fields(&TRANSLATED_FIELDS)
            .into_iter()
            .map(|field| {
                Extracted::new(
                    field.text.clone(),
                    Value::String(field.text),
                    MergeTarget::Path(field.path),
                )
            })
            .collect()
    }

    fn request(&self, label: &str, items: &[WorkItem], missing: &[String]) -> Result<GenerationRequest, GenerationError> {
        let schema = OutputSchema::new(Self::batch_schema(items, missing))
            .map_err(|e| GenerationError::InvalidRequest(e.to_string()))?;
        Ok(GenerationRequest::new(
            label,
            self.prompt(items, missing),
            Arc::new(schema),
        ))
    }

    fn decode(&self, items: &[WorkItem], missing: &[String], output: Value) -> Result<Vec<ResultsMap>, GenerationError> {
        let Value::Object(mut entries) = output else {
            return Err(GenerationError::MalformedOutput(
                "expected an object keyed by text id".to_string(),
            ));
        };
        if entries.len() != items.len() {
            return Err(GenerationError::MalformedOutput(format!(
                "expected {} translations, got {}",
                items.len(),
                entries.len()
            )));
        }

        items
            .iter()
            .map(|item| {
                let key = item.id.to_string();
                let Some(Value::Object(translations)) = entries.remove(&key) else {
                    return Err(GenerationError::MalformedOutput(format!(
                        "no translations for text {key}"
                    )));
                };
                let mut results = ResultsMap::new();
                for lang in item.missing(missing) {
                    match translations.get(&lang).and_then(Value::as_str).map(str::trim) {
                        Some(text) if !text.is_empty() && text != FAILURE_MARKER => {
                            results.insert(lang, Value::String(text.to_string()));
                        }
                        _ => warn!(item_id = %item.id, lang, "translation missing; left for a later run"),
                    }
                }
                Ok(results)
            })
            .collect()
    }

    fn render_outputs(&self, merged: &Catalog, items: &[WorkItem]) -> Vec<OutputArtifact> {
        let mut outputs = Vec::with_capacity(self.languages.len());
        for lang in &self.languages {
            let ops: Vec<MergeOp> = items
                .iter()
                .filter_map(|item| item.results.get(lang).map(|text| (item, text)))
                .flat_map(|(item, text)| {
                    item.targets.iter().filter_map(move |target| match target {
                        MergeTarget::Path(path) => Some(MergeOp::replace(path.clone(), text.clone())),
                        MergeTarget::Id(_) => None,
                    })
                })
                .collect();

            let coordinator = MergeCoordinator::new(merged.root().clone());
            let report = coordinator.apply_all(&ops);
            match Catalog::from_value(coordinator.into_inner()) {
                Ok(catalog) => {
                    let name = language_name(lang).unwrap_or(lang.as_str());
                    outputs.push(
                        OutputArtifact::new(format!("translated_{name}"), catalog)
                            .with_dropped_merges(report.dropped.len()),
                    );
                }
                Err(err) => warn!(lang, error = %err, "translated tree is not a catalog; skipped"),
            }
        }
        outputs
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
                "metadata": {"title": "Grundschutz"},
                "groups": [{
                    "id": "APP.1",
                    "title": "Anwendungen",
                    "controls": [
                        {"id": "APP.1.1", "title": "Sichere Konfiguration"},
                        {"id": "APP.1.2", "title": "Sichere Konfiguration"}
                    ]
                }]
            }
        }))
        .unwrap()
    }

    fn items(job: &TranslationJob) -> Vec<WorkItem> {
        deduplicate(job.extract(&catalog()))
    }

    #[test]
    fn extracts_titles_with_paths() {
        let job = TranslationJob::new(["en"]);
        let extracted = job.extract(&catalog());
        assert_eq!(extracted.len(), 4);
        assert_eq!(extracted[0].fingerprint, "Grundschutz");
        assert_eq!(items(&job).len(), 3);
    }

    #[test]
    fn request_asks_for_missing_languages() {
        let job = TranslationJob::new(["en", "fr"]);
        let items = items(&job);
        let missing = vec!["fr".to_string()];
        let request = job.request("batch 0", &items, &missing).unwrap();
        assert!(request.prompt.contains("languages: fr."));
        assert!(request.prompt.contains("\"Anwendungen\""));

        let ok = json!({"0": {"fr": "a"}, "1": {"fr": "b"}, "2": {"fr": "c"}});
        assert!(request.schema.validate(&ok).is_ok());
        let short = json!({"0": {"fr": "a"}, "1": {"fr": "b"}});
        assert!(request.schema.validate(&short).is_err());
    }

    #[test]
    fn decode_rejects_wrong_cardinality() {
        let job = TranslationJob::new(["en"]);
        let items = items(&job);
        let langs = job.dimensions();
        let output = json!({"0": {"en": "a"}, "1": {"en": "b"}});
        assert!(matches!(
            job.decode(&items, &langs, output),
            Err(GenerationError::MalformedOutput(_))
        ));
    }

    #[test]
    fn decode_skips_failed_translations() {
        let job = TranslationJob::new(["en", "fr"]);
        let items = items(&job);
        let langs = job.dimensions();
        let output = json!({
            "0": {"en": "Basic protection", "fr": FAILURE_MARKER},
            "1": {"en": "Applications", "fr": "Applications"},
            "2": {"en": "  ", "fr": "Configuration sécurisée"}
        });
        let results = job.decode(&items, &langs, output).unwrap();
        assert_eq!(results[0].len(), 1);
        assert_eq!(results[1].len(), 2);
        assert_eq!(results[2].keys().collect::<Vec<_>>(), vec!["fr"]);
    }

    #[test]
    fn renders_one_tree_per_language() {
        let job = TranslationJob::new(["en", "fr"]);
        let mut items = items(&job);
        for item in &mut items {
            let text = item.payload.as_str().unwrap().to_string();
            item.absorb(ResultsMap::from([("en".to_string(), json!(format!("EN {text}")))]));
        }
        let outputs = job.render_outputs(&catalog(), &items);
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].label, "translated_english");
        assert_eq!(outputs[1].label, "translated_french");

        let en = outputs[0].catalog.root();
        assert_eq!(en["catalog"]["groups"][0]["controls"][0]["title"], "EN Sichere Konfiguration");
        assert_eq!(en["catalog"]["groups"][0]["controls"][1]["title"], "EN Sichere Konfiguration");
        // no French results: source text stays
        let fr = outputs[1].catalog.root();
        assert_eq!(fr["catalog"]["groups"][0]["title"], "Anwendungen");
    }

    #[test]
    fn language_names() {
        assert_eq!(language_name("ps"), Some("pashtu"));
        assert_eq!(language_name("xx"), None);
        assert_eq!(TranslationJob::all_languages().languages().len(), 14);
    }
}
