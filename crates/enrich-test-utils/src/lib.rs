//! Testing utilities for the enrichment workspace
//!
//! Shared fakes, fixtures and configuration helpers.

#![allow(missing_docs)]

use async_trait::async_trait;
use enrich_core::{
    parse_model_json, DocumentRef, EnrichConfig, GenerationClient, GenerationError,
    GenerationRequest, MemoryObjectStore, RetryConfig,
};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const SOURCE_PATH: &str = "source/catalog.json";
pub const OUTPUT_PREFIX: &str = "out";

type Responder = dyn Fn(&GenerationRequest, usize) -> Result<Value, GenerationError> + Send + Sync;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub label: String,
    pub prompt: String,
    pub schema: Value,
    pub document: Option<DocumentRef>,
}

/// Scripted generation client
///
/// The responder gets each request and the 0-based call number. Responses
/// are validated against the request schema like a real client would,
/// unless [`FakeGenerationClient::without_validation`] is used.
pub struct FakeGenerationClient {
    responder: Box<Responder>,
    delay: Duration,
    validate: bool,
    calls: AtomicUsize,
    in_flight: Arc<AtomicUsize>,
    peak: AtomicUsize,
    requests: Mutex<Vec<RecordedRequest>>,
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeGenerationClient {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&GenerationRequest, usize) -> Result<Value, GenerationError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            delay: Duration::ZERO,
            validate: true,
            calls: AtomicUsize::new(0),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Sleep this long inside every call
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Hand responses back without checking them against the schema
    #[must_use]
    pub fn without_validation(mut self) -> Self {
        self.validate = false;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl GenerationClient for FakeGenerationClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<Value, GenerationError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(Arc::clone(&self.in_flight));
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.requests.lock().push(RecordedRequest {
            label: request.label.clone(),
            prompt: request.prompt.clone(),
            schema: request.schema.original().clone(),
            document: request.document.clone(),
        });

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let output = (self.responder)(request, call)?;
        if self.validate {
            request.schema.validate(&output)?;
        }
        Ok(output)
    }

    fn name(&self) -> &str {
        "fake"
    }
}

/// Item ids and requested languages of a translation request
pub fn translation_request_shape(request: &GenerationRequest) -> (Vec<String>, Vec<String>) {
    let schema = request.schema.original();
    let strings = |value: Option<&Value>| -> Vec<String> {
        value
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default()
    };
    let ids = strings(schema.get("required"));
    let langs = ids
        .first()
        .map(|id| strings(schema.pointer(&format!("/properties/{id}/required"))))
        .unwrap_or_default();
    (ids, langs)
}

/// Source texts of a translation request, keyed by item id
pub fn translation_texts(request: &GenerationRequest) -> Map<String, Value> {
    request
        .prompt
        .split_once("Texts:\n")
        .and_then(|(_, texts)| parse_model_json(texts).ok())
        .and_then(|value| value.as_object().cloned())
        .unwrap_or_default()
}

/// Answer every translation request with `"[{lang}] {text}"`
pub fn tagging_translator(request: &GenerationRequest, _call: usize) -> Result<Value, GenerationError> {
    let (ids, langs) = translation_request_shape(request);
    let texts = translation_texts(request);
    let answer: Map<String, Value> = ids
        .into_iter()
        .map(|id| {
            let text = texts.get(&id).and_then(Value::as_str).unwrap_or_default();
            let entry: Map<String, Value> = langs
                .iter()
                .map(|lang| (lang.clone(), Value::String(format!("[{lang}] {text}"))))
                .collect();
            (id, Value::Object(entry))
        })
        .collect();
    Ok(Value::Object(answer))
}

/// A generated practice part titled `title`
pub fn practice_part(title: &str) -> Value {
    json!({
        "name": "practice",
        "title": title,
        "prose": format!("{title} practice"),
        "props": [{"name": "practice", "value": "GOV"}]
    })
}

/// Three controls carrying two distinct statements; the first one repeats
pub fn catalog_with_repeated_prose() -> Value {
    json!({
        "catalog": {
            "uuid": "00000000-0000-4000-8000-000000000000",
            "metadata": {"last-modified": "2024-01-01T00:00:00Z"},
            "groups": [{
                "id": "SYS.1",
                "controls": [
                    {"id": "SYS.1.A1", "parts": [{"name": "statement", "prose": "Zugriff ist zu beschränken."}]},
                    {"id": "SYS.1.A2", "parts": [{"name": "statement", "prose": "Protokolle sind auszuwerten."}]},
                    {"id": "SYS.1.A3", "parts": [{"name": "statement", "prose": "Zugriff ist zu beschränken."}]}
                ]
            }]
        }
    })
}

/// `count` controls in one group, each with a title
pub fn numbered_catalog(count: usize) -> Value {
    let controls: Vec<Value> = (1..=count)
        .map(|n| json!({"id": format!("OPS.1.A{n}"), "title": format!("Anforderung {n}"), "parts": []}))
        .collect();
    json!({
        "catalog": {
            "metadata": {},
            "groups": [{"id": "OPS.1", "title": "Betrieb", "controls": controls}]
        }
    })
}

/// One control that already carries a practice part
pub fn catalog_with_practice() -> Value {
    json!({
        "catalog": {
            "metadata": {},
            "groups": [{
                "id": "ORP.4",
                "title": "Identitäts- und Berechtigungsmanagement",
                "controls": [{
                    "id": "ORP.4.A1",
                    "title": "Regelung für Benutzerkennungen",
                    "parts": [
                        {"name": "statement", "prose": "Kennungen sind zu regeln."},
                        {"name": "practice", "title": "old", "prose": "old practice"}
                    ]
                }]
            }]
        }
    })
}

/// Two Bausteine under one layer; the first has parts from an earlier run
pub fn catalog_with_bausteine() -> Value {
    json!({
        "catalog": {
            "metadata": {},
            "groups": [{
                "id": "OPS",
                "title": "Betrieb",
                "groups": [
                    {
                        "id": "OPS.1.1.2",
                        "title": "Ordnungsgemäße IT-Administration",
                        "parts": [{"name": "introduction", "prose": "veraltet"}],
                        "controls": [{"id": "OPS.1.1.2.A1", "title": "Personalauswahl"}]
                    },
                    {"id": "OPS.1.1.3", "title": "Patch- und Änderungsmanagement"}
                ]
            }]
        }
    })
}

/// A parts stub for Baustein `id`
pub fn parts_stub(id: &str) -> Value {
    json!({
        "id": id,
        "parts": [
            {"name": "introduction", "title": "Einleitung", "prose": format!("{id} Einleitung")},
            {"name": "objective", "title": "Zielsetzung", "prose": format!("{id} Zielsetzung")}
        ]
    })
}

/// Memory store holding `catalog` at [`SOURCE_PATH`]
pub fn store_with_source(catalog: &Value) -> Arc<MemoryObjectStore> {
    let bytes = serde_json::to_vec(catalog).unwrap_or_default();
    Arc::new(MemoryObjectStore::new().with_object(SOURCE_PATH, bytes))
}

/// Read back a JSON object written to `store`
pub fn read_json(store: &MemoryObjectStore, path: &str) -> Value {
    store
        .read(path)
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .unwrap_or(Value::Null)
}

/// Configuration pointing at the fixtures, with fast deterministic retries
pub fn test_config() -> EnrichConfig {
    EnrichConfig::new()
        .with_source_path(SOURCE_PATH)
        .with_output_prefix(OUTPUT_PREFIX)
        .with_retry(RetryConfig {
            max_attempts: 3,
            base_delay_ms: 10,
            jitter: 0.0,
            ..RetryConfig::default()
        })
}
