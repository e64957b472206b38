//! End-to-end runs: REST source through staging, packaging and loading

use odm_common::checksum::compute_file_checksum;
use odm_pipeline::load::MemoryDestination;
use odm_pipeline::models::{ExecutionStatus, LoadMode, Resource};
use odm_pipeline::orchestrator::RunOutcome;
use odm_pipeline::package::{verify_bundle, DATA_FILE, METADATA_FILE, MODELS_FILE, SCHEMA_FILE};
use odm_pipeline::versioning::BumpType;
use odm_pipeline::{staging, RunReport};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod common;
use common::{rest_resource, TestEnv};

async fn serve(server: &MockServer, route: &str, payload: Value) {
    server.reset().await;
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_json(payload))
        .mount(server)
        .await;
}

async fn run_ok(env: &TestEnv, resource_id: Uuid) -> RunOutcome {
    match env.pipeline.run(resource_id).await.expect("run should succeed") {
        RunReport::Completed(outcome) => *outcome,
        other => panic!("expected a completed run, got {:?}", other),
    }
}

#[tokio::test]
async fn test_rest_run_produces_versioned_bundle() {
    let server = MockServer::start().await;
    serve(
        &server,
        "/museums",
        json!([
            {"id": 1, "name": "Prado", "visitors": 3200000},
            {"id": 2, "name": "Thyssen", "visitors": null}
        ]),
    )
    .await;

    let env = TestEnv::new();
    let resource = env
        .add(rest_resource("museums", format!("{}/museums", server.uri())))
        .await;

    let outcome = run_ok(&env, resource.id).await;
    assert_eq!(outcome.total_records, 2);
    assert_eq!(outcome.artifact.version.to_string(), "1.0.0");
    assert_eq!(outcome.bump, BumpType::Major);
    assert_eq!(outcome.artifact.record_count, 2);
    assert!(outcome.deliveries.is_empty());

    // staged under the execution id
    assert_eq!(
        outcome.staging_path,
        env.dir
            .path()
            .join("staging")
            .join(resource.id.to_string())
            .join(format!("{}.jsonl", outcome.execution_id))
    );
    let staged = staging::read_records(&outcome.staging_path)
        .await
        .expect("staging file should be readable");
    assert_eq!(staged.len(), 2);
    assert_eq!(staged[0]["name"], json!("Prado"));

    // bundle contents
    let bundle = Path::new(&outcome.artifact.data_path);
    for file in [DATA_FILE, SCHEMA_FILE, MODELS_FILE, METADATA_FILE] {
        assert!(bundle.join(file).is_file(), "missing {}", file);
    }
    let schema: Value = serde_json::from_slice(
        &tokio::fs::read(bundle.join(SCHEMA_FILE)).await.expect("schema.json"),
    )
    .expect("schema.json is JSON");
    assert_eq!(schema["properties"]["id"]["type"], json!("integer"));
    assert_eq!(schema["properties"]["name"]["type"], json!("string"));

    let models = tokio::fs::read_to_string(bundle.join(MODELS_FILE))
        .await
        .expect("models.rs");
    assert!(models.contains("pub struct"));
    assert!(models.contains("pub id: i64"));

    // catalog state
    let execution = env
        .catalog
        .executions(resource.id)
        .await
        .pop()
        .expect("one execution");
    assert_eq!(execution.id, outcome.execution_id);
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.total_records, Some(2));
    assert_eq!(
        execution.staging_path.as_deref(),
        Some(outcome.staging_path.display().to_string().as_str())
    );
    assert!(execution.error_message.is_none());
    assert_eq!(env.catalog.artifacts(resource.id).await, vec![outcome.artifact.clone()]);
}

#[tokio::test]
async fn test_checksum_matches_staged_bytes() {
    let server = MockServer::start().await;
    serve(&server, "/data", json!([{"a": 1}, {"a": 2}, {"a": 3}])).await;

    let env = TestEnv::new();
    let resource = env
        .add(rest_resource("checksums", format!("{}/data", server.uri())))
        .await;
    let outcome = run_ok(&env, resource.id).await;

    let staged = compute_file_checksum(&outcome.staging_path).expect("hash staging file");
    assert_eq!(staged, outcome.artifact.checksum);
    assert_eq!(staged.len(), 64);

    let metadata = verify_bundle(Path::new(&outcome.artifact.data_path))
        .await
        .expect("bundle should verify");
    assert_eq!(metadata.artifact_id, outcome.artifact.id);
    assert_eq!(metadata.checksum, outcome.artifact.checksum);
    assert_eq!(metadata.record_count, 3);
}

#[tokio::test]
async fn test_versions_follow_schema_changes() {
    let server = MockServer::start().await;
    let env = TestEnv::new();
    let resource = env
        .add(rest_resource("evolving", format!("{}/feed", server.uri())))
        .await;

    let steps = [
        (json!([{"id": 1, "name": "a"}]), "1.0.0", BumpType::Major),
        // same shape, new values
        (json!([{"id": 2, "name": "b"}]), "1.0.1", BumpType::Patch),
        // field added
        (json!([{"id": 3, "name": "c", "city": "Lugo"}]), "1.1.0", BumpType::Minor),
        // field removed
        (json!([{"id": 4, "city": "Vigo"}]), "2.0.0", BumpType::Major),
        // type changed
        (json!([{"id": "5", "city": "Ourense"}]), "3.0.0", BumpType::Major),
    ];

    for (payload, expected, bump) in steps {
        serve(&server, "/feed", payload).await;
        let outcome = run_ok(&env, resource.id).await;
        assert_eq!(outcome.artifact.version.to_string(), expected);
        assert_eq!(outcome.bump, bump, "bump for {}", expected);
    }

    let versions: Vec<String> = env
        .catalog
        .artifacts(resource.id)
        .await
        .iter()
        .map(|a| a.version.to_string())
        .collect();
    assert_eq!(versions, vec!["1.0.0", "1.0.1", "1.1.0", "2.0.0", "3.0.0"]);
    assert_eq!(env.catalog.executions(resource.id).await.len(), 5);
}

#[tokio::test]
async fn test_scalar_and_empty_payloads_stage() {
    let server = MockServer::start().await;
    let env = TestEnv::new();
    let resource = env
        .add(rest_resource("scalar", format!("{}/one", server.uri())))
        .await;

    // a single object stages as one record
    serve(&server, "/one", json!({"status": "ok", "count": 4})).await;
    let outcome = run_ok(&env, resource.id).await;
    assert_eq!(outcome.total_records, 1);

    // an empty list is still a run, with an empty schema
    serve(&server, "/one", json!([])).await;
    let outcome = run_ok(&env, resource.id).await;
    assert_eq!(outcome.total_records, 0);
    assert_eq!(outcome.artifact.record_count, 0);
    assert_eq!(outcome.bump, BumpType::Major);
}

#[tokio::test]
async fn test_load_into_destination() {
    let server = MockServer::start().await;
    serve(&server, "/rows", json!([{"id": 1, "v": "a"}, {"id": 2, "v": "b"}])).await;

    let destination = Arc::new(MemoryDestination::new());
    let env = TestEnv::with_destination(destination.clone());
    let mut resource = rest_resource("loaded", format!("{}/rows", server.uri()));
    resource.enable_load = true;
    resource.target_table = Some("loaded_rows".to_string());
    resource.load_mode = LoadMode::Replace;
    let resource = env.add(resource).await;

    let outcome = run_ok(&env, resource.id).await;
    assert_eq!(outcome.records_loaded, Some(2));
    assert!(outcome.load_error.is_none());
    assert_eq!(destination.rows("loaded_rows").await.len(), 2);

    // replace mode swaps the table contents
    serve(&server, "/rows", json!([{"id": 3, "v": "c"}])).await;
    run_ok(&env, resource.id).await;
    let rows = destination.rows("loaded_rows").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"], json!(3));

    let executions = env.catalog.executions(resource.id).await;
    assert_eq!(executions[1].records_loaded, Some(1));
}

#[tokio::test]
async fn test_load_settings_stay_out_of_source_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/buscar"))
        .and(query_param("q", "museo"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            "<html><head><title>Resultados</title></head><body></body></html>",
            "text/html; charset=utf-8",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let destination = Arc::new(MemoryDestination::new());
    let env = TestEnv::with_destination(destination);
    let mut resource = Resource::new("search", "integration", "HTML")
        .with_param("url", format!("{}/buscar", server.uri()))
        .with_param("q", "museo")
        .with_param("upsert_key", "id");
    resource.enable_load = true;
    resource.target_table = Some("search_rows".to_string());
    resource.load_mode = LoadMode::Upsert;
    let resource = env.add(resource).await;

    run_ok(&env, resource.id).await;

    let requests = server.received_requests().await.unwrap_or_default();
    assert_eq!(requests.len(), 1);
    let query = requests[0].url.query().unwrap_or_default().to_string();
    assert!(query.contains("q=museo"), "{}", query);
    assert!(!query.contains("upsert_key"), "{}", query);
}

#[tokio::test]
async fn test_load_failure_does_not_fail_run() {
    let server = MockServer::start().await;
    serve(&server, "/rows", json!([{"id": 1}])).await;

    // loading enabled but nowhere to load into
    let env = TestEnv::new();
    let mut resource = rest_resource("unloadable", format!("{}/rows", server.uri()));
    resource.enable_load = true;
    resource.target_table = Some("rows".to_string());
    let resource = env.add(resource).await;

    let outcome = run_ok(&env, resource.id).await;
    assert!(outcome.records_loaded.is_none());
    let load_error = outcome.load_error.expect("load error recorded");
    assert!(load_error.contains("destination"));

    let execution = &env.catalog.executions(resource.id).await[0];
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert!(execution
        .error_message
        .as_deref()
        .is_some_and(|m| m.contains("destination")));
    assert_eq!(env.catalog.artifacts(resource.id).await.len(), 1);
}

#[tokio::test]
async fn test_run_all_isolates_failures() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/good"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"ok": true}])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/bad"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let env = TestEnv::new();
    let mut bad = rest_resource("bad", format!("{}/bad", server.uri()));
    bad.execution_priority = 10;
    let bad = env.add(bad).await;
    let good = env
        .add(rest_resource("good", format!("{}/good", server.uri())))
        .await;
    let mut off = rest_resource("off", format!("{}/good", server.uri()));
    off.active = false;
    let off = env.add(off).await;

    let summary = env.pipeline.run_all().await.expect("run_all itself succeeds");
    assert_eq!(summary.completed(), 1);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].resource_id, bad.id);
    assert_eq!(summary.failures[0].kind, "TransportError");

    assert_eq!(env.catalog.artifacts(good.id).await.len(), 1);
    assert_eq!(
        env.catalog.executions(bad.id).await[0].status,
        ExecutionStatus::Failed
    );
    assert!(env.catalog.executions(off.id).await.is_empty());
}

#[tokio::test]
async fn test_run_all_concurrent_runs_every_resource() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"n": 1}, {"n": 2}])))
        .expect(4)
        .mount(&server)
        .await;

    let env = TestEnv::new();
    let mut ids = Vec::new();
    for i in 0..4 {
        let resource = env
            .add(rest_resource(&format!("r{}", i), format!("{}/r{}", server.uri(), i)))
            .await;
        ids.push(resource.id);
    }

    let summary = env
        .pipeline
        .run_all_concurrent(2)
        .await
        .expect("run_all_concurrent succeeds");
    assert_eq!(summary.completed(), 4);
    assert!(summary.failures.is_empty());

    for id in ids {
        let artifacts = env.catalog.artifacts(id).await;
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].record_count, 2);
    }
}
