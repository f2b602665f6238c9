//! Test utilities and common setup.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;
use toolbox::api::{self, AppState, StateOptions};

/// A router over a fresh data directory.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub dir: TempDir,
}

impl TestApp {
    pub fn data_dir(&self) -> PathBuf {
        self.dir.path().join("data")
    }

    pub async fn request(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().uri(uri).method(method);
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_string(&body).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }
}

/// A stand-in server that ignores its arguments and sleeps.
///
/// Written once per test binary before anything forks, so no child can
/// inherit a writable handle to it.
pub fn fake_server_binary() -> &'static Path {
    static BINARY: OnceLock<(TempDir, PathBuf)> = OnceLock::new();
    let (_, path) = BINARY.get_or_init(|| {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fake-rag");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"#!/bin/sh\nexec sleep 60\n").unwrap();
        file.sync_all().unwrap();
        drop(file);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        (dir, path)
    });
    path
}

/// Create a test application with all services initialized.
pub fn test_app() -> TestApp {
    let dir = TempDir::new().unwrap();
    let mut options = StateOptions::new(dir.path().join("data"), dir.path().join("logs"));
    options.lock.timeout = Duration::from_secs(5);
    options.supervisor.grace_period = Duration::from_secs(2);
    options.supervisor.launch.rag_binary = fake_server_binary().display().to_string();
    options.supervisor.launch.model_binary = "/nonexistent/byzerllm".to_string();
    options.supervisor.launch.openai_binary = fake_server_binary().display().to_string();
    options.progress_interval = Duration::from_millis(20);

    let state = AppState::new(options);
    let router = api::create_router(state.clone());
    TestApp { router, state, dir }
}
