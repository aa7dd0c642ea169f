//! API integration tests.
//!
//! Drives the full router against a fake container runtime, covering the
//! submit/poll/cleanup flows end to end.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use serde_json::Value;
use tower::ServiceExt;

use runbox::api::{AppState, create_router};
use runbox::container::{
    ContainerConfig, ContainerError, ContainerResult, ContainerRuntimeApi, ContainerState,
};
use runbox::session::{SessionService, SessionServiceConfig};

/// Fake runtime serving a scripted container state.
struct FakeRuntime {
    state: Mutex<Option<ContainerState>>,
    logs: Mutex<String>,
}

impl FakeRuntime {
    fn new(state: Option<ContainerState>) -> Self {
        Self {
            state: Mutex::new(state),
            logs: Mutex::new(String::new()),
        }
    }

    fn with_logs(self, logs: &str) -> Self {
        *self.logs.lock().unwrap() = logs.to_string();
        self
    }
}

#[async_trait]
impl ContainerRuntimeApi for FakeRuntime {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;
        Ok("fake-container-id".to_string())
    }

    async fn stop_container(
        &self,
        _container_id: &str,
        _timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        Ok(())
    }

    async fn remove_container(&self, _container_id: &str, _force: bool) -> ContainerResult<()> {
        Ok(())
    }

    async fn container_state(
        &self,
        _container_id: &str,
    ) -> ContainerResult<Option<ContainerState>> {
        Ok(*self.state.lock().unwrap())
    }

    async fn logs(&self, _container_id: &str) -> ContainerResult<String> {
        Ok(self.logs.lock().unwrap().clone())
    }

    async fn image_exists(&self, _image: &str) -> ContainerResult<bool> {
        Ok(true)
    }

    async fn pull_image(&self, _image: &str) -> ContainerResult<()> {
        Ok(())
    }
}

/// A runtime whose create call always fails, for provisioning-fault tests.
struct BrokenRuntime;

#[async_trait]
impl ContainerRuntimeApi for BrokenRuntime {
    async fn create_container(&self, _config: &ContainerConfig) -> ContainerResult<String> {
        Err(ContainerError::CommandFailed {
            command: "run".to_string(),
            message: "daemon unavailable".to_string(),
        })
    }

    async fn stop_container(
        &self,
        _container_id: &str,
        _timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        Ok(())
    }

    async fn remove_container(&self, _container_id: &str, _force: bool) -> ContainerResult<()> {
        Ok(())
    }

    async fn container_state(
        &self,
        _container_id: &str,
    ) -> ContainerResult<Option<ContainerState>> {
        Ok(None)
    }

    async fn logs(&self, _container_id: &str) -> ContainerResult<String> {
        Ok(String::new())
    }

    async fn image_exists(&self, _image: &str) -> ContainerResult<bool> {
        Ok(true)
    }

    async fn pull_image(&self, _image: &str) -> ContainerResult<()> {
        Ok(())
    }
}

fn test_app(runtime: Arc<dyn ContainerRuntimeApi>) -> (Router, tempfile::TempDir) {
    let work_dir = tempfile::tempdir().unwrap();
    let config = SessionServiceConfig {
        work_dir: work_dir.path().to_path_buf(),
        ..Default::default()
    };
    let service = Arc::new(SessionService::new(runtime, config));
    let app = create_router(AppState::new(service), 10, &[]);
    (app, work_dir)
}

/// Build a multipart request body containing one field.
fn multipart_body(field_name: &str, filename: Option<&str>, content: &[u8]) -> (String, Vec<u8>) {
    let boundary = "runbox-test-boundary";
    let mut body = Vec::new();

    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    match filename {
        Some(name) => body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{field_name}\"; filename=\"{name}\"\r\n")
                .as_bytes(),
        ),
        None => body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{field_name}\"\r\n").as_bytes(),
        ),
    }
    body.extend_from_slice(b"Content-Type: text/x-python\r\n\r\n");
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    (format!("multipart/form-data; boundary={boundary}"), body)
}

fn execute_request(field_name: &str, filename: Option<&str>, content: &[u8]) -> Request<Body> {
    let (content_type, body) = multipart_body(field_name, filename, content);
    Request::builder()
        .uri("/execute")
        .method(Method::POST)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(body))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

/// Test that the health endpoint reports service state.
#[tokio::test]
async fn test_health_endpoint() {
    let (app, _work_dir) = test_app(Arc::new(FakeRuntime::new(Some(ContainerState::Running))));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
    assert_eq!(json["sessions"], 0);
}

/// Submitting a script returns a session ID, and an immediate poll on it is
/// never NotFound.
#[tokio::test]
async fn test_execute_then_poll_still_running() {
    let (app, _work_dir) = test_app(Arc::new(FakeRuntime::new(Some(ContainerState::Running))));

    let response = app
        .clone()
        .oneshot(execute_request("file", Some("main.py"), b"print(\"hi\")"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    let session_id = json["session_id"].as_str().unwrap().to_string();
    assert!(!session_id.is_empty());

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/result/{session_id}"))
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = json_body(response).await;
    assert_eq!(json["status"], "still running");
}

/// A multipart request without a `file` field is rejected.
#[tokio::test]
async fn test_execute_without_file_is_bad_request() {
    let (app, _work_dir) = test_app(Arc::new(FakeRuntime::new(Some(ContainerState::Running))));

    let response = app
        .oneshot(execute_request("data", Some("main.py"), b"print(\"hi\")"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = json_body(response).await;
    assert_eq!(json["error"], "No file provided");
}

/// An empty upload is rejected before touching the backend.
#[tokio::test]
async fn test_execute_empty_file_is_bad_request() {
    let (app, _work_dir) = test_app(Arc::new(FakeRuntime::new(Some(ContainerState::Running))));

    let response = app
        .oneshot(execute_request("file", Some("main.py"), b""))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

/// Provisioning faults surface as 500 and leave no session behind.
#[tokio::test]
async fn test_execute_backend_failure_is_internal_error() {
    let (app, _work_dir) = test_app(Arc::new(BrokenRuntime));

    let response = app
        .clone()
        .oneshot(execute_request("file", Some("main.py"), b"print(\"hi\")"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = json_body(response).await;
    assert_eq!(json["sessions"], 0);
}

/// Polling an unknown session is a 404.
#[tokio::test]
async fn test_result_unknown_session_is_not_found() {
    let (app, _work_dir) = test_app(Arc::new(FakeRuntime::new(Some(ContainerState::Running))));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/result/abc")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = json_body(response).await;
    assert_eq!(json["error"], "Session not found");
}

/// A finished script returns its logs, repeatably.
#[tokio::test]
async fn test_result_finished_returns_logs() {
    let runtime = FakeRuntime::new(Some(ContainerState::Exited(0))).with_logs("hi\n");
    let (app, _work_dir) = test_app(Arc::new(runtime));

    let response = app
        .clone()
        .oneshot(execute_request("file", Some("main.py"), b"print(\"hi\")"))
        .await
        .unwrap();
    let session_id = json_body(response).await["session_id"]
        .as_str()
        .unwrap()
        .to_string();

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/result/{session_id}"))
                    .method(Method::GET)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["logs"], "hi\n");
        assert!(json.get("error").is_none());
    }
}

/// An abnormally terminated script still returns 200, with the reason.
#[tokio::test]
async fn test_result_failed_script_reports_reason() {
    let runtime = FakeRuntime::new(Some(ContainerState::Exited(2))).with_logs("Traceback\n");
    let (app, _work_dir) = test_app(Arc::new(runtime));

    let response = app
        .clone()
        .oneshot(execute_request("file", Some("main.py"), b"boom"))
        .await
        .unwrap();
    let session_id = json_body(response).await["session_id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/result/{session_id}"))
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["logs"], "Traceback\n");
    assert!(json["error"].as_str().unwrap().contains('2'));
}

/// Cleanup succeeds once, then reports the session gone.
#[tokio::test]
async fn test_cleanup_twice_is_ok_then_not_found() {
    let (app, _work_dir) = test_app(Arc::new(FakeRuntime::new(Some(ContainerState::Running))));

    let response = app
        .clone()
        .oneshot(execute_request("file", Some("main.py"), b"print(\"hi\")"))
        .await
        .unwrap();
    let session_id = json_body(response).await["session_id"]
        .as_str()
        .unwrap()
        .to_string();

    let cleanup_request = || {
        Request::builder()
            .uri(format!("/cleanup/{session_id}"))
            .method(Method::POST)
            .body(Body::empty())
            .unwrap()
    };

    let response = app.clone().oneshot(cleanup_request()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["status"], "cleaned up");

    let response = app.clone().oneshot(cleanup_request()).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = json_body(response).await;
    assert_eq!(json["error"], "Session not found");

    // Polling after cleanup is gone too.
    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/result/{session_id}"))
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
