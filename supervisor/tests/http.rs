use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use common::catalog::InMemorySegmentCatalog;
use supervisor::{handlers, AppState, SupervisorConfig};

fn app(root: &std::path::Path) -> Router {
    let config = SupervisorConfig {
        work_dir: root.join("work"),
        shuffle_dir: root.join("shuffle"),
        segment_dir: root.join("segments"),
        ..SupervisorConfig::default()
    };
    handlers::build_router(AppState::new(config, Arc::new(InMemorySegmentCatalog::new())))
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match body {
            Some(v) => Body::from(v.to_string()),
            None => Body::empty(),
        })
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn spec() -> Value {
    json!({
        "datasource": "wiki",
        "schema": {
            "columns": ["ts", "dim", "val"],
            "timestamp": {"column": "ts"},
            "dimensions": ["dim"],
            "metrics": [{"type": "longSum", "name": "val", "field": "val"}]
        },
        "input": {"type": "inline", "data": "2020-01-01T01:00:00Z,a,1\n2020-01-01T02:00:00Z,b,2"}
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn job_por_http_de_punta_a_punta() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(dir.path());

    let (status, body) = call(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::Null);

    let (status, info) = call(&app, "POST", "/api/v1/jobs", Some(spec())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["status"], "ACCEPTED");
    let id = info["id"].as_str().unwrap().to_string();
    assert!(id.starts_with("index_parallel_wiki_"));

    let mut last = Value::Null;
    for _ in 0..200 {
        let (status, info) = call(&app, "GET", &format!("/api/v1/jobs/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        last = info;
        if last["status"] == "SUCCEEDED" || last["status"] == "FAILED" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(last["status"], "SUCCEEDED", "{last}");
    assert_eq!(last["report"]["rowStats"]["buildSegments"]["processed"], 2);

    let (status, segments) = call(&app, "GET", "/api/v1/datasources/wiki/segments", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(segments.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn errores_mapeados_a_codigos_http() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(dir.path());

    let (status, body) = call(&app, "GET", "/api/v1/jobs/nadie", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("nadie"));
    assert_eq!(body["code"], "UNKNOWN_TASK");

    let (status, body) = call(
        &app,
        "POST",
        "/api/v1/supervisors/nadie/segments/allocate",
        Some(json!({"timestamp": "2020-01-01T00:00:00Z"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "SUPERVISOR_NOT_FOUND");

    let mut invalid = spec();
    invalid["schema"]["timestamp"]["column"] = json!("otra");
    let (status, body) = call(&app, "POST", "/api/v1/jobs", Some(invalid)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("spec inválido"));
}
