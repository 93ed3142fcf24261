use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use actix_web::{App, http::StatusCode, test, web};
use assert_json_diff::assert_json_include;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

use codebox::Coordinator;
use codebox::config::{EngineConfig, LanguageConfig, MilliSecond};
use codebox::routes::CompileResponse;
use codebox::web_server::{configure_app, json_config};

// Global counter to ensure unique workspace roots
static TEST_ROOT_COUNTER: AtomicU32 = AtomicU32::new(0);

fn create_coordinator() -> (Arc<Coordinator>, PathBuf) {
    let id = TEST_ROOT_COUNTER.fetch_add(1, Ordering::SeqCst);
    let root = std::env::temp_dir().join(format!(
        "codebox-server-test-{}-{id}",
        std::process::id()
    ));
    let config = EngineConfig {
        max_concurrency: 2,
        queue_capacity: 4,
        admission_timeout: MilliSecond(5_000),
        max_processes: 4096,
        workspace_root: Some(root.join("workspaces")),
        cache_root: Some(root.join("cache")),
        default_language: "sh".to_string(),
        ..EngineConfig::default()
    };
    let sh = LanguageConfig {
        name: "sh".to_string(),
        file_name: "main.sh".to_string(),
        command: vec!["/bin/sh".to_string(), "%INPUT%".to_string()],
        compile: None,
        env: HashMap::new(),
        max_processes: None,
    };
    let missing = LanguageConfig {
        name: "missing".to_string(),
        command: vec!["/nonexistent/codebox-runtime".to_string()],
        ..sh.clone()
    };
    let languages = [sh, missing];
    let coordinator = Coordinator::build(config, &languages).expect("Failed to build coordinator");
    (Arc::new(coordinator), root)
}

macro_rules! init_app {
    ($coordinator:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::from($coordinator.clone()))
                .app_data(json_config($coordinator.config()))
                .configure(configure_app),
        )
        .await
    };
}

#[actix_web::test]
async fn test_index() {
    let (coordinator, root) = create_coordinator();
    let app = init_app!(coordinator);

    let req = test::TestRequest::get().uri("/").to_request();
    let body = test::call_and_read_body(&app, req).await;
    assert_eq!(body, "Hello World!".as_bytes());

    fs::remove_dir_all(root).unwrap();
}

#[actix_web::test]
async fn test_compile_hello() {
    let (coordinator, root) = create_coordinator();
    let app = init_app!(coordinator);

    let req = test::TestRequest::post()
        .uri("/compile")
        .set_json(json!({
            "code": "echo hello\necho warn >&2",
            "language": "sh",
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let body: Value = test::read_body_json(resp).await;
    assert_json_include!(
        actual: body.clone(),
        expected: json!({
            "result": "hello\nwarn\n",
            "stdout": "hello\n",
            "stderr": "warn\n",
            "exit_code": 0,
            "signal": null,
            "truncated": false,
            "limit_exceeded": "none",
            "stage": "run",
        })
    );
    let response: CompileResponse = serde_json::from_value(body).unwrap();
    assert_eq!(response.exit_code, Some(0));

    assert_eq!(coordinator.workspace_stats().live, 0);
    fs::remove_dir_all(root).unwrap();
}

#[actix_web::test]
async fn test_compile_uses_default_language_and_limits() {
    let (coordinator, root) = create_coordinator();
    let app = init_app!(coordinator);

    let req = test::TestRequest::post()
        .uri("/compile")
        .set_json(json!({
            "code": "while :; do :; done",
            "time_limit": 1000,
        }))
        .to_request();
    let resp: CompileResponse = test::call_and_read_body_json(&app, req).await;
    assert_eq!(resp.limit_exceeded, codebox::LimitExceeded::Time);
    assert_eq!(resp.exit_code, None);
    assert!(resp.signal.is_some());
    assert!(resp.peak_memory_kb > 0);

    fs::remove_dir_all(root).unwrap();
}

#[actix_web::test]
async fn test_compile_rejects_unknown_language() {
    let (coordinator, root) = create_coordinator();
    let app = init_app!(coordinator);

    let req = test::TestRequest::post()
        .uri("/compile")
        .set_json(json!({
            "code": "print(1)",
            "language": "cobol",
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let body: Value = test::read_body_json(resp).await;
    assert_json_include!(
        actual: body,
        expected: json!({
            "reason": "ERR_INVALID_ARGUMENT",
            "code": 1,
        })
    );
    assert_eq!(coordinator.gate_stats().acquired, 0);

    fs::remove_dir_all(root).unwrap();
}

#[actix_web::test]
async fn test_compile_rejects_out_of_range_limit() {
    let (coordinator, root) = create_coordinator();
    let app = init_app!(coordinator);

    let req = test::TestRequest::post()
        .uri("/compile")
        .set_json(json!({
            "code": "echo hi",
            "time_limit": 0,
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    fs::remove_dir_all(root).unwrap();
}

#[actix_web::test]
async fn test_malformed_json_is_invalid_argument() {
    let (coordinator, root) = create_coordinator();
    let app = init_app!(coordinator);

    let req = test::TestRequest::post()
        .uri("/compile")
        .insert_header(("content-type", "application/json"))
        .set_payload("{\"code\": ")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body, json!({ "reason": "ERR_INVALID_ARGUMENT", "code": 1 }));

    fs::remove_dir_all(root).unwrap();
}

#[actix_web::test]
async fn test_sandbox_failure_is_opaque_internal_error() {
    let (coordinator, root) = create_coordinator();
    let app = init_app!(coordinator);

    let req = test::TestRequest::post()
        .uri("/compile")
        .set_json(json!({
            "code": "echo hi",
            "language": "missing",
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

    // No paths or OS errors leak to the client
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body, json!({ "reason": "ERR_INTERNAL", "code": 6 }));

    let gate = coordinator.gate_stats();
    assert_eq!(gate.acquired, 1);
    assert_eq!(gate.released, 1);
    assert_eq!(coordinator.workspace_stats().live, 0);

    fs::remove_dir_all(root).unwrap();
}

#[actix_web::test]
async fn test_overloaded_after_shutdown() {
    let (coordinator, root) = create_coordinator();
    let app = init_app!(coordinator);
    coordinator.shutdown();

    let req = test::TestRequest::post()
        .uri("/compile")
        .set_json(json!({ "code": "echo hi" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body, json!({ "reason": "ERR_OVERLOADED", "code": 4 }));

    fs::remove_dir_all(root).unwrap();
}

#[actix_web::test]
async fn test_status_reports_counters() {
    let (coordinator, root) = create_coordinator();
    let app = init_app!(coordinator);

    let req = test::TestRequest::post()
        .uri("/compile")
        .set_json(json!({ "code": "true" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let req = test::TestRequest::get().uri("/status").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_json_include!(
        actual: body,
        expected: json!({
            "gate": {
                "capacity": 2,
                "in_flight": 0,
                "waiting": 0,
                "acquired": 1,
                "released": 1,
                "rejected": 0,
            },
            "workspaces": {
                "created": 1,
                "destroyed": 1,
                "live": 0,
            },
        })
    );

    fs::remove_dir_all(root).unwrap();
}
