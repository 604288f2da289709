//! HTTP document processor client against a mock server

use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use reduction_scheduler::job::FieldSelection;
use reduction_scheduler::processing::{
    DocumentProcessor, ExtractionRequest, HttpDocumentProcessor, ProcessorError, ReductionRequest,
    RemoteTaskRef,
};

async fn client(server: &MockServer) -> HttpDocumentProcessor {
    HttpDocumentProcessor::new(server.uri()).unwrap()
}

#[tokio::test]
async fn test_ping() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    client(&server).await.ping().await.unwrap();
}

#[tokio::test]
async fn test_ping_failure_is_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = client(&server).await.ping().await.unwrap_err();
    assert!(matches!(err, ProcessorError::Unavailable(_)));
}

#[tokio::test]
async fn test_create_extraction_task() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/tasks"))
        .and(body_partial_json(json!({
            "kind": "hierarchy_extraction",
            "source_path": "/work/job/master/a.qvw",
            "output_dir": "/work/job/hierarchy",
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "task-17"})))
        .expect(1)
        .mount(&server)
        .await;

    let task = client(&server)
        .await
        .create_extraction_task(&ExtractionRequest {
            source_path: "/work/job/master/a.qvw".into(),
            output_dir: "/work/job/hierarchy".into(),
        })
        .await
        .unwrap();

    assert_eq!(task, RemoteTaskRef("task-17".into()));
}

#[tokio::test]
async fn test_create_reduction_task_sends_selections() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/tasks"))
        .and(body_partial_json(json!({
            "kind": "reduction",
            "selections": [{"field_name": "region", "value": "West"}],
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "task-18"})))
        .expect(1)
        .mount(&server)
        .await;

    let task = client(&server)
        .await
        .create_reduction_task(&ReductionRequest {
            source_path: "/work/job/master/a.qvw".into(),
            selections: vec![FieldSelection::new("region", "West")],
            output_path: "/work/job/reduced/a.qvw".into(),
        })
        .await
        .unwrap();

    assert_eq!(task.0, "task-18");
}

#[tokio::test]
async fn test_run_and_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/tasks/task-1/run"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/tasks/task-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "started_at": "2025-03-01T10:00:00Z",
            "finished_at": null,
        })))
        .mount(&server)
        .await;

    let processor = client(&server).await;
    let task = RemoteTaskRef("task-1".into());
    processor.run(&task).await.unwrap();
    let status = processor.get_status(&task).await.unwrap();

    assert!(status.is_started());
    assert!(!status.is_finished());
}

#[tokio::test]
async fn test_unknown_task() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/tasks/ghost"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = client(&server)
        .await
        .get_status(&RemoteTaskRef("ghost".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, ProcessorError::TaskNotFound(t) if t.0 == "ghost"));
}

#[tokio::test]
async fn test_delete() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/tasks/task-1"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/tasks/task-2"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let processor = client(&server).await;
    assert!(processor.delete(&RemoteTaskRef("task-1".into())).await.unwrap());
    assert!(!processor.delete(&RemoteTaskRef("task-2".into())).await.unwrap());
}

#[tokio::test]
async fn test_rejected_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/tasks"))
        .respond_with(ResponseTemplate::new(422).set_body_string("unsupported document"))
        .mount(&server)
        .await;

    let err = client(&server)
        .await
        .create_extraction_task(&ExtractionRequest {
            source_path: "/work/a.qvw".into(),
            output_dir: "/work/out".into(),
        })
        .await
        .unwrap_err();

    match err {
        ProcessorError::Rejected(message) => assert!(message.contains("unsupported document")),
        other => panic!("unexpected error: {other:?}"),
    }
}
