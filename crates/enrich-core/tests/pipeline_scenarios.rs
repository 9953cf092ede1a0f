//! End-to-end runs against a scripted generation client

use async_trait::async_trait;
use enrich_core::{
    checkpoint_path, EnrichError, FinalValidationPolicy, GenerationError, MemoryObjectStore,
    DocumentRef, ObjectStore, Orchestrator, PracticeJob, QualityCheckJob, RunState, StoreError,
    StubJob, TranslationJob,
};
use enrich_test_utils::{
    catalog_with_bausteine, catalog_with_practice, catalog_with_repeated_prose, numbered_catalog,
    parts_stub, practice_part, read_json, store_with_source, tagging_translator, test_config,
    translation_request_shape, FakeGenerationClient, SOURCE_PATH,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn statements(tree: &Value) -> Vec<String> {
    tree["catalog"]["groups"][0]["controls"]
        .as_array()
        .unwrap()
        .iter()
        .map(|control| control["parts"][0]["prose"].as_str().unwrap().to_string())
        .collect()
}

fn practice_parts(control: &Value) -> Vec<Value> {
    control["parts"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|part| part["name"] == "practice")
        .cloned()
        .collect()
}

#[tokio::test]
async fn repeated_prose_is_translated_once() {
    let store = store_with_source(&catalog_with_repeated_prose());
    let client = Arc::new(FakeGenerationClient::new(tagging_translator));
    let mut orchestrator = Orchestrator::new(test_config(), client.clone(), store.clone());

    let report = orchestrator.run(TranslationJob::new(["en"])).await.unwrap();

    assert_eq!(report.state, RunState::Done);
    assert_eq!(report.summary.occurrences, 3);
    assert_eq!(report.summary.total, 2);
    assert_eq!(report.summary.succeeded, 2);
    assert_eq!(client.calls(), 1);
    assert_eq!(report.outputs.len(), 1);
    assert!(report.outputs[0].starts_with("out/catalog_translated_english_"));

    let tree = read_json(&store, &report.outputs[0]);
    let translated = statements(&tree);
    assert_eq!(
        translated,
        vec![
            "[en] Zugriff ist zu beschränken.",
            "[en] Protokolle sind auszuwerten.",
            "[en] Zugriff ist zu beschränken.",
        ]
    );
    assert_eq!(translated[0], translated[2]);
    assert_ne!(tree["catalog"]["metadata"]["last-modified"], "2024-01-01T00:00:00Z");
}

#[tokio::test(start_paused = true)]
async fn short_batch_answer_is_retried() {
    let store = store_with_source(&catalog_with_repeated_prose());
    let client = Arc::new(FakeGenerationClient::new(|request, call| {
        let mut answer = tagging_translator(request, call)?;
        if call == 0 {
            let (ids, _) = translation_request_shape(request);
            if let (Some(map), Some(last)) = (answer.as_object_mut(), ids.last()) {
                map.remove(last);
            }
        }
        Ok(answer)
    }));
    let mut orchestrator = Orchestrator::new(test_config(), client.clone(), store.clone());

    let report = orchestrator.run(TranslationJob::new(["en"])).await.unwrap();

    assert_eq!(client.calls(), 2);
    assert_eq!(report.summary.succeeded, 2);
    assert_eq!(report.summary.failed_batches, 0);
    let tree = read_json(&store, &report.outputs[0]);
    assert!(statements(&tree).iter().all(|text| text.starts_with("[en] ")));
}

#[tokio::test(start_paused = true)]
async fn short_answer_is_rejected_even_without_schema_checks() {
    let store = store_with_source(&catalog_with_repeated_prose());
    let client = Arc::new(
        FakeGenerationClient::new(|request, call| {
            let mut answer = tagging_translator(request, call)?;
            let (ids, _) = translation_request_shape(request);
            if let (Some(map), Some(last)) = (answer.as_object_mut(), ids.last()) {
                map.remove(last);
            }
            Ok(answer)
        })
        .without_validation(),
    );
    let mut orchestrator = Orchestrator::new(test_config(), client.clone(), store.clone());

    let report = orchestrator.run(TranslationJob::new(["en"])).await.unwrap();

    // every attempt is short: the batch is skipped, never truncated
    assert_eq!(client.calls(), 3);
    assert_eq!(report.state, RunState::Done);
    assert_eq!(report.summary.failed, 2);
    assert_eq!(report.summary.failed_batches, 1);
    let tree = read_json(&store, &report.outputs[0]);
    assert_eq!(statements(&tree)[0], "Zugriff ist zu beschränken.");
}

#[tokio::test(start_paused = true)]
async fn gate_bounds_concurrent_calls() {
    let store = store_with_source(&numbered_catalog(10));
    let client = Arc::new(
        FakeGenerationClient::new(|_, _| Ok(practice_part("Betrieb")))
            .with_delay(Duration::from_millis(50)),
    );
    let config = test_config().with_concurrency(3);
    let mut orchestrator = Orchestrator::new(config, client.clone(), store.clone());

    let report = orchestrator.run(PracticeJob::new().unwrap()).await.unwrap();

    assert_eq!(client.calls(), 10);
    assert!(client.peak_in_flight() <= 3, "peak {}", client.peak_in_flight());
    assert_eq!(client.peak_in_flight(), 3);
    assert!(report.summary.peak_in_flight <= 3);
    assert_eq!(client.in_flight(), 0);
    assert_eq!(report.summary.batches, 10);
    assert_eq!(report.summary.succeeded, 10);
}

#[tokio::test]
async fn second_run_replaces_practice_part() {
    let store = store_with_source(&catalog_with_practice());
    let config = test_config().with_checkpoint(false);

    let first = Arc::new(FakeGenerationClient::new(|_, _| Ok(practice_part("v1"))));
    let report = Orchestrator::new(config.clone(), first, store.clone())
        .run(PracticeJob::new().unwrap())
        .await
        .unwrap();
    let after_first = read_json(&store, &report.outputs[0]);
    let control = &after_first["catalog"]["groups"][0]["controls"][0];
    let parts = practice_parts(control);
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0]["title"], "v1");

    let second = Arc::new(FakeGenerationClient::new(|_, _| Ok(practice_part("v2"))));
    let report = Orchestrator::new(config.with_source_path(report.outputs[0].clone()), second, store.clone())
        .run(PracticeJob::new().unwrap())
        .await
        .unwrap();
    let after_second = read_json(&store, &report.outputs[0]);
    let control = &after_second["catalog"]["groups"][0]["controls"][0];
    let parts = practice_parts(control);
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0]["title"], "v2");
    assert_eq!(control["parts"][0]["name"], "statement");
}

#[tokio::test]
async fn checkpoint_limits_requests_to_missing_languages() {
    let store = store_with_source(&catalog_with_repeated_prose());
    let checkpoint = checkpoint_path("progress", "translate");
    let seeded = json!({
        "Zugriff ist zu beschränken.": {"en": "Access must be restricted.", "fr": "L'accès doit être restreint."},
        "Protokolle sind auszuwerten.": {"en": "Logs must be evaluated."}
    });
    store.insert(checkpoint.clone(), serde_json::to_vec(&seeded).unwrap());

    let client = Arc::new(FakeGenerationClient::new(tagging_translator));
    let mut orchestrator = Orchestrator::new(test_config(), client.clone(), store.clone());
    let report = orchestrator.run(TranslationJob::new(["en", "fr"])).await.unwrap();

    assert_eq!(client.calls(), 1);
    let request = &client.requests()[0];
    assert!(request.prompt.contains("Protokolle sind auszuwerten."));
    assert!(!request.prompt.contains("Zugriff ist zu beschränken."));
    assert_eq!(request.schema["required"], json!(["1"]));
    assert_eq!(request.schema["properties"]["1"]["required"], json!(["fr"]));

    assert_eq!(report.summary.already_complete, 1);
    assert_eq!(report.summary.dispatched, 1);
    assert_eq!(report.checkpoint.as_deref(), Some(checkpoint.as_str()));

    let english = read_json(&store, &report.outputs[0]);
    assert_eq!(
        statements(&english),
        vec![
            "Access must be restricted.",
            "Logs must be evaluated.",
            "Access must be restricted.",
        ]
    );
    let french = read_json(&store, &report.outputs[1]);
    assert_eq!(statements(&french)[1], "[fr] Protokolle sind auszuwerten.");

    let saved = read_json(&store, &checkpoint);
    assert_eq!(saved["Protokolle sind auszuwerten."]["fr"], "[fr] Protokolle sind auszuwerten.");
    assert_eq!(saved["Protokolle sind auszuwerten."]["en"], "Logs must be evaluated.");
}

#[tokio::test]
async fn completed_checkpoint_means_no_calls() {
    let store = store_with_source(&catalog_with_repeated_prose());
    let seeded = json!({
        "Zugriff ist zu beschränken.": {"en": "A"},
        "Protokolle sind auszuwerten.": {"en": "B"}
    });
    store.insert(checkpoint_path("progress", "translate"), serde_json::to_vec(&seeded).unwrap());

    let client = Arc::new(FakeGenerationClient::new(tagging_translator));
    let report = Orchestrator::new(test_config(), client.clone(), store.clone())
        .run(TranslationJob::new(["en"]))
        .await
        .unwrap();

    assert_eq!(client.calls(), 0);
    assert_eq!(report.summary.batches, 0);
    assert_eq!(statements(&read_json(&store, &report.outputs[0])), vec!["A", "B", "A"]);
}

#[tokio::test]
async fn blocked_item_is_skipped_after_one_attempt() {
    let store = store_with_source(&numbered_catalog(3));
    let client = Arc::new(FakeGenerationClient::new(|request, _| {
        if request.prompt.contains("\"OPS.1.A2\"") {
            Err(GenerationError::Blocked("SAFETY".into()))
        } else {
            Ok(practice_part("Betrieb"))
        }
    }));
    let mut orchestrator = Orchestrator::new(test_config(), client.clone(), store.clone());

    let report = orchestrator.run(PracticeJob::new().unwrap()).await.unwrap();

    assert_eq!(client.calls(), 3);
    assert_eq!(report.summary.succeeded, 2);
    assert_eq!(report.summary.failed, 1);
    assert_eq!(report.state, RunState::Done);
    let tree = read_json(&store, &report.outputs[0]);
    let controls = tree["catalog"]["groups"][0]["controls"].as_array().unwrap();
    assert_eq!(practice_parts(&controls[0]).len(), 1);
    assert!(practice_parts(&controls[1]).is_empty());
}

#[tokio::test]
async fn missing_settings_abort_before_any_work() {
    let store = store_with_source(&numbered_catalog(1));
    let client = Arc::new(FakeGenerationClient::new(|_, _| Ok(practice_part("x"))));
    let config = test_config().with_output_prefix("");
    let mut orchestrator = Orchestrator::new(config, client.clone(), store.clone());

    let err = orchestrator.run(PracticeJob::new().unwrap()).await.unwrap_err();

    assert!(matches!(err, EnrichError::Config(_)));
    assert_eq!(err.exit_code(), 2);
    assert_eq!(orchestrator.state(), RunState::AbortedConfig);
    assert_eq!(client.calls(), 0);
    assert_eq!(store.keys(), vec![SOURCE_PATH.to_string()]);
}

#[tokio::test]
async fn unreadable_source_aborts() {
    let client = Arc::new(FakeGenerationClient::new(|_, _| Ok(practice_part("x"))));

    let empty = Arc::new(MemoryObjectStore::new());
    let mut orchestrator = Orchestrator::new(test_config(), client.clone(), empty);
    let err = orchestrator.run(PracticeJob::new().unwrap()).await.unwrap_err();
    assert_eq!(err.exit_code(), 3);
    assert_eq!(orchestrator.state(), RunState::AbortedSourceLoad);

    let corrupt = Arc::new(MemoryObjectStore::new().with_object(SOURCE_PATH, b"{\"catalog\": [".to_vec()));
    let mut orchestrator = Orchestrator::new(test_config(), client.clone(), corrupt);
    let err = orchestrator.run(PracticeJob::new().unwrap()).await.unwrap_err();
    assert!(matches!(err, EnrichError::SourceLoad { .. }));
    assert_eq!(client.calls(), 0);
}

fn catalog_with_duplicate_ids() -> Value {
    json!({
        "catalog": {
            "metadata": {},
            "groups": [{
                "id": "APP.1",
                "controls": [
                    {"id": "APP.1.A1", "title": "Eins", "parts": []},
                    {"id": "APP.1.A1", "title": "Zwei", "parts": []}
                ]
            }]
        }
    })
}

#[tokio::test]
async fn invalid_output_aborts_under_abort_policy() {
    let store = store_with_source(&catalog_with_duplicate_ids());
    let client = Arc::new(FakeGenerationClient::new(|_, _| Ok(practice_part("x"))));
    let config = test_config().with_final_validation(FinalValidationPolicy::Abort);
    let mut orchestrator = Orchestrator::new(config, client, store.clone());

    let err = orchestrator.run(PracticeJob::new().unwrap()).await.unwrap_err();

    assert!(matches!(err, EnrichError::FinalValidation { count: 1, .. }));
    assert_eq!(err.exit_code(), 4);
    assert_eq!(orchestrator.state(), RunState::AbortedValidation);
    assert!(store.keys().iter().all(|key| !key.starts_with("out/")));
}

#[tokio::test]
async fn invalid_output_is_persisted_by_default() {
    let store = store_with_source(&catalog_with_duplicate_ids());
    let client = Arc::new(FakeGenerationClient::new(|_, _| Ok(practice_part("x"))));
    let mut orchestrator = Orchestrator::new(test_config(), client, store.clone());

    let report = orchestrator.run(PracticeJob::new().unwrap()).await.unwrap();

    assert_eq!(report.state, RunState::Done);
    assert_eq!(report.summary.validation_issues, 1);
    assert!(report.validation_issues[0].contains("APP.1.A1"));
    assert!(!report.is_clean());
    assert!(store.read(&report.outputs[0]).is_some());
}

#[tokio::test]
async fn test_mode_dispatches_a_sample() {
    let store = store_with_source(&numbered_catalog(40));
    let client = Arc::new(FakeGenerationClient::new(|_, _| Ok(practice_part("x"))));
    let config = test_config().with_test_mode(true);

    let report = Orchestrator::new(config, client.clone(), store)
        .run(PracticeJob::new().unwrap())
        .await
        .unwrap();

    assert_eq!(client.calls(), 2);
    assert_eq!(report.summary.dispatched, 2);
    assert_eq!(report.summary.skipped, 38);
}

#[tokio::test]
async fn quality_review_reads_components_and_merges() {
    let catalog = json!({
        "catalog": {
            "metadata": {},
            "groups": [{
                "id": "CON.1",
                "title": "Kryptokonzept",
                "controls": [{
                    "id": "CON.1.A1",
                    "title": "Auswahl geeigneter Verfahren",
                    "parts": [{
                        "name": "maturity-level-description",
                        "parts": [{"id": "CON.1.A1-m1", "name": "statement", "prose": "Verfahren sind ausgewählt."}]
                    }]
                }, {
                    "id": "CON.1.A2",
                    "title": "Nicht in der Komponente",
                    "parts": [{
                        "name": "maturity-level-description",
                        "parts": [{"id": "CON.1.A2-m1", "prose": "Bleibt unverändert."}]
                    }]
                }]
            }]
        }
    });
    let component = json!({"component-definition": {"components": [{
        "title": "CON.1: Kryptokonzept",
        "control-implementations": [{"implemented-requirements": [{"control-id": "CON.1.A1"}]}]
    }]}});
    let store = store_with_source(&catalog);
    store.insert("components/con_1.json", serde_json::to_vec(&component).unwrap());

    let client = Arc::new(FakeGenerationClient::new(|_, _| {
        Ok(json!({
            "enriched_prose": [{"part_id": "CON.1.A1-m1", "prose_qs": "Geprüft."}],
            "suggested_new_controls": [{"id": "CON.1.A90", "title": "Neu", "parts": []}]
        }))
    }));
    let config = test_config().with_source_prefix("components/");
    let report = Orchestrator::new(config, client.clone(), store.clone())
        .run(QualityCheckJob::new().unwrap())
        .await
        .unwrap();

    assert_eq!(client.calls(), 1);
    assert!(report.outputs[0].contains("_quality_"));
    let tree = read_json(&store, &report.outputs[0]);
    let controls = tree["catalog"]["groups"][0]["controls"].as_array().unwrap();
    assert_eq!(controls.len(), 3);
    assert_eq!(controls[0]["parts"][0]["parts"][0]["prose_qs"], "Geprüft.");
    assert!(controls[1]["parts"][0]["parts"][0].get("prose_qs").is_none());
    assert_eq!(controls[2]["id"], "CON.1.A90");
}

#[tokio::test]
async fn stubs_replace_baustein_parts() {
    let store = store_with_source(&catalog_with_bausteine());
    for key in [
        "sources/OPS.1.1.2_Ordnungsgemaesse_IT-Administration.pdf",
        "sources/OPS.1.1.3_Patch-und-Aenderungsmanagement.pdf",
        "sources/Vorwort.pdf",
        "sources/inhalt.json",
    ] {
        store.put(key, b"%PDF-1.7".to_vec(), "application/pdf").await.unwrap();
    }
    let client = Arc::new(FakeGenerationClient::new(|request, _| {
        let uri = &request.document.as_ref().unwrap().uri;
        let id = if uri.contains("OPS.1.1.2") {
            "OPS.1.1.2"
        } else if uri.contains("OPS.1.1.3") {
            "OPS.1.1.3"
        } else {
            "APP.9.9"
        };
        Ok(parts_stub(id))
    }));
    let job = StubJob::new().unwrap().with_document_base("gs://grundschutz");

    let report = Orchestrator::new(
        test_config().with_source_prefix("sources/"),
        client.clone(),
        store.clone(),
    )
    .run(job)
    .await
    .unwrap();

    assert_eq!(client.calls(), 3);
    assert_eq!(report.summary.succeeded, 3);
    assert_eq!(report.summary.merges_dropped, 1, "no Baustein APP.9.9 in the catalog");
    assert!(report.outputs[0].contains("_with_parts_"));

    let documents: Vec<DocumentRef> = client
        .requests()
        .into_iter()
        .filter_map(|request| request.document)
        .collect();
    assert!(documents.contains(&DocumentRef::new(
        "gs://grundschutz/sources/OPS.1.1.2_Ordnungsgemaesse_IT-Administration.pdf",
        "application/pdf"
    )));

    let tree = read_json(&store, &report.outputs[0]);
    let bausteine = &tree["catalog"]["groups"][0]["groups"];
    assert_eq!(bausteine[0]["parts"], parts_stub("OPS.1.1.2")["parts"]);
    assert_eq!(bausteine[1]["parts"], parts_stub("OPS.1.1.3")["parts"]);
    assert_eq!(bausteine[0]["controls"][0]["id"], "OPS.1.1.2.A1");
}

#[tokio::test]
async fn stub_job_needs_a_source_prefix() {
    let store = store_with_source(&catalog_with_bausteine());
    let client = Arc::new(FakeGenerationClient::new(|_, _| Ok(parts_stub("OPS.1.1.2"))));

    let mut orchestrator = Orchestrator::new(test_config(), client.clone(), store);
    let err = orchestrator.run(StubJob::new().unwrap()).await.unwrap_err();

    assert_eq!(err.exit_code(), 2);
    assert_eq!(orchestrator.state(), RunState::AbortedConfig);
    assert_eq!(client.calls(), 0);
}

/// Memory store whose writes under one prefix always fail
struct FailingPrefixStore {
    inner: MemoryObjectStore,
    prefix: &'static str,
}

impl FailingPrefixStore {
    fn new(source: &Value, prefix: &'static str) -> Self {
        let inner = MemoryObjectStore::new()
            .with_object(SOURCE_PATH, serde_json::to_vec(source).unwrap());
        Self { inner, prefix }
    }
}

#[async_trait]
impl ObjectStore for FailingPrefixStore {
    async fn get(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        self.inner.get(path).await
    }

    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), StoreError> {
        if path.starts_with(self.prefix) {
            return Err(StoreError::Io {
                path: path.to_string(),
                source: std::io::Error::other("quota exceeded"),
            });
        }
        self.inner.put(path, bytes, content_type).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.inner.list(prefix).await
    }
}

#[tokio::test]
async fn checkpoint_failures_do_not_stop_the_run() {
    let store = Arc::new(FailingPrefixStore::new(&numbered_catalog(2), "progress/"));
    let client = Arc::new(FakeGenerationClient::new(|_, _| Ok(practice_part("x"))));

    let report = Orchestrator::new(test_config(), client, store.clone())
        .run(PracticeJob::new().unwrap())
        .await
        .unwrap();

    assert_eq!(report.summary.succeeded, 2);
    assert!(store.inner.read(&report.outputs[0]).is_some());
    assert!(store.inner.keys().iter().all(|key| !key.starts_with("progress/")));
}

#[tokio::test]
async fn output_write_failure_aborts() {
    let store = Arc::new(FailingPrefixStore::new(&numbered_catalog(2), "out/"));
    let client = Arc::new(FakeGenerationClient::new(|_, _| Ok(practice_part("x"))));

    let mut orchestrator = Orchestrator::new(test_config(), client, store.clone());
    let err = orchestrator.run(PracticeJob::new().unwrap()).await.unwrap_err();

    assert!(matches!(err, EnrichError::Store(StoreError::Io { ref path, .. }) if path.starts_with("out/")));
    assert_eq!(err.exit_code(), 1);
    assert_eq!(orchestrator.state(), RunState::AbortedPersist);
    assert!(orchestrator.state().is_terminal());
    // completed work survives for the next run
    assert!(store.inner.keys().iter().any(|key| key.starts_with("progress/")));
}
