//! Download-and-install pipeline driven through the HTTP surface.

use std::io::Write;
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode},
    routing::get,
};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::json;
use tower::ServiceExt;

use toolbox::install::{InstallOutcome, InstallRequest, Phase, ProgressEvent, ProgressSnapshot};

mod common;
use common::{TestApp, test_app};

fn tar_gz(files: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, body) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, *body).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

fn zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default().unix_permissions(0o644);
    for (path, body) in files {
        zip.start_file(*path, options).unwrap();
        zip.write_all(body).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

/// Bytes that gzip cannot shrink much.
fn noise(len: usize) -> Vec<u8> {
    let mut state = 0x2545_f491_4f6c_dd1d_u64;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect()
}

/// An engine distribution large enough to span several download chunks.
fn engine_files() -> Vec<(&'static str, Vec<u8>)> {
    vec![
        ("bin/byzer.sh", b"#!/bin/sh\necho started\n".to_vec()),
        ("conf/byzer.properties", b"streaming.name=byzer\n".to_vec()),
        ("libs/engine.jar", noise(400_000)),
        ("README.md", b"byzer engine\n".to_vec()),
    ]
}

async fn serve_archives(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn start_download(app: &TestApp, url: String, install_dir: &std::path::Path) -> String {
    let (status, json) = app
        .request(
            Method::POST,
            "/byzer-sql/download",
            Some(json!({"download_url": url, "install_dir": install_dir})),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{json}");
    assert_eq!(json["message"], "Download started");
    json["task_id"].as_str().unwrap().to_string()
}

/// Collect the SSE stream for a task until the server closes it.
async fn read_progress(app: &TestApp, task_id: &str) -> (Vec<ProgressSnapshot>, usize) {
    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/download-progress/{task_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = tokio::time::timeout(
        std::time::Duration::from_secs(30),
        axum::body::to_bytes(response.into_body(), 64 * 1024 * 1024),
    )
    .await
    .expect("progress stream did not finish")
    .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();

    let mut snapshots = Vec::new();
    let mut keepalives = 0;
    for line in text.lines() {
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data == "keepalive" {
            keepalives += 1;
        } else {
            snapshots.push(serde_json::from_str(data).unwrap());
        }
    }
    (snapshots, keepalives)
}

fn assert_monotonic(snapshots: &[ProgressSnapshot]) {
    let mut seen_extract = false;
    let mut last = 0u8;
    for snapshot in snapshots {
        match snapshot.phase {
            Phase::Download => {
                assert!(!seen_extract, "download after extract: {snapshots:?}");
                assert!(snapshot.progress >= last, "regressed: {snapshots:?}");
            }
            Phase::Extract if !seen_extract => {
                seen_extract = true;
            }
            Phase::Extract => assert!(snapshot.progress >= last, "regressed: {snapshots:?}"),
        }
        last = snapshot.progress;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_install_tar_gz_reports_progress() {
    let files = engine_files();
    let refs: Vec<(&str, &[u8])> = files.iter().map(|(p, b)| (*p, b.as_slice())).collect();
    let archive = tar_gz(&refs);
    let addr = serve_archives(Router::new().route(
        "/releases/byzer-lang-2.3.9.tar.gz",
        get(move || {
            let archive = archive.clone();
            async move { archive }
        }),
    ))
    .await;

    let app = test_app();
    let install_dir = app.dir.path().join("byzer");
    let task_id = start_download(
        &app,
        format!("http://{addr}/releases/byzer-lang-2.3.9.tar.gz"),
        &install_dir,
    )
    .await;

    let (snapshots, _) = read_progress(&app, &task_id).await;
    let last = snapshots.last().unwrap();
    assert!(last.completed);
    assert_eq!(last.error, None);
    assert_eq!(last.phase, Phase::Extract);
    assert_eq!(last.progress, 100);
    assert!(snapshots.iter().all(|s| s.task_id == task_id));
    assert_monotonic(&snapshots);

    let script = install_dir.join("bin/byzer.sh");
    let mode = std::fs::metadata(&script).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o755);
    assert_eq!(
        std::fs::read(install_dir.join("libs/engine.jar")).unwrap(),
        files[2].1
    );
    assert!(!install_dir.join("byzer-lang-2.3.9.tar.gz").exists());
    assert!(app.state.progress.get(&task_id).is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_install_zip_through_handle() {
    let archive = zip_bytes(&[("bin/byzer.sh", b"#!/bin/sh\n"), ("conf/a", b"a")]);
    let addr = serve_archives(Router::new().route(
        "/engine.zip",
        get(move || {
            let archive = archive.clone();
            async move { archive }
        }),
    ))
    .await;

    let app = test_app();
    let install_dir = app.dir.path().join("zipped");
    let handle = app
        .state
        .installer
        .start(InstallRequest {
            download_url: format!("http://{addr}/engine.zip"),
            install_dir: install_dir.clone(),
        })
        .unwrap();
    let task_id = handle.task_id.clone();

    assert_eq!(handle.wait().await, InstallOutcome::Succeeded);
    assert!(install_dir.join("conf/a").is_file());
    let done = app.state.progress.get(&task_id).unwrap();
    assert!(done.completed);
    assert!(app.state.installer.active_tasks().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_install_http_error_is_reported() {
    let addr = serve_archives(Router::new()).await;

    let app = test_app();
    let task_id = start_download(
        &app,
        format!("http://{addr}/missing.tar.gz"),
        &app.dir.path().join("byzer"),
    )
    .await;

    let (snapshots, _) = read_progress(&app, &task_id).await;
    let last = snapshots.last().unwrap();
    assert!(last.completed);
    assert_eq!(last.phase, Phase::Download);
    assert!(last.error.as_deref().unwrap().contains("404"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_install_can_be_cancelled() {
    // One chunk, then the body stalls forever.
    let addr = serve_archives(Router::new().route(
        "/stall.tar.gz",
        get(|| async {
            let first = futures::stream::once(async {
                Ok::<_, std::io::Error>(Bytes::from(vec![0u8; 1024]))
            });
            Body::from_stream(first.chain(futures::stream::pending()))
        }),
    ))
    .await;

    let app = test_app();
    let install_dir = app.dir.path().join("byzer");
    let task_id = start_download(&app, format!("http://{addr}/stall.tar.gz"), &install_dir).await;

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let (status, _) = app
        .request(Method::DELETE, &format!("/api/download/{task_id}"), None)
        .await;
    assert_eq!(status, StatusCode::OK);

    let (snapshots, _) = read_progress(&app, &task_id).await;
    let last = snapshots.last().unwrap();
    assert!(last.completed);
    assert_eq!(last.error.as_deref(), Some("cancelled"));
    assert!(!install_dir.join("stall.tar.gz").exists());
}

/// Cancelling mid-extraction still leaves a final snapshot for subscribers.
#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_during_extraction_is_final() {
    let files: Vec<(String, Vec<u8>)> = (0..3000)
        .map(|i| (format!("libs/part-{i:04}.bin"), noise(2048)))
        .collect();
    let refs: Vec<(&str, &[u8])> = files
        .iter()
        .map(|(p, b)| (p.as_str(), b.as_slice()))
        .collect();
    let archive = tar_gz(&refs);
    let addr = serve_archives(Router::new().route(
        "/big.tar.gz",
        get(move || {
            let archive = archive.clone();
            async move { archive }
        }),
    ))
    .await;

    let app = test_app();
    let handle = app
        .state
        .installer
        .start(InstallRequest {
            download_url: format!("http://{addr}/big.tar.gz"),
            install_dir: app.dir.path().join("big"),
        })
        .unwrap();
    let task_id = handle.task_id.clone();

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(20);
    loop {
        let snapshot = app.state.progress.get(&task_id).unwrap();
        assert!(!snapshot.completed, "finished before it could be cancelled: {snapshot:?}");
        if snapshot.phase == Phase::Extract && snapshot.progress >= 5 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "extraction never started");
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }

    handle.cancel();
    assert_eq!(handle.wait().await, InstallOutcome::Cancelled);
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    let last = app.state.progress.get(&task_id).unwrap();
    assert!(last.completed, "{last:?}");
    assert_eq!(last.phase, Phase::Extract);
    assert_eq!(last.error.as_deref(), Some("cancelled"));

    let (snapshots, _) = read_progress(&app, &task_id).await;
    assert_eq!(snapshots, vec![last]);
    assert!(app.state.progress.get(&task_id).is_none());
}

#[tokio::test]
async fn test_cancel_unknown_task_is_not_found() {
    let app = test_app();
    let (status, json) = app
        .request(Method::DELETE, "/api/download/no-such-task", None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_download_rejects_bad_url() {
    let app = test_app();
    let (status, _) = app
        .request(
            Method::POST,
            "/byzer-sql/download",
            Some(json!({"download_url": "not a url", "install_dir": "/tmp/x"})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

/// Unknown tasks get keepalives until a snapshot shows up.
#[tokio::test]
async fn test_progress_stream_keepalive_for_unknown_task() {
    let app = test_app();
    {
        let mut events = Box::pin(
            app.state
                .progress
                .subscribe("later", std::time::Duration::from_millis(10)),
        );
        assert_eq!(events.next().await, Some(ProgressEvent::KeepAlive));
    }

    let mut done = ProgressSnapshot::new("later", Phase::Extract, 100);
    done.completed = true;
    app.state.progress.publish(done.clone());

    let (snapshots, keepalives) = read_progress(&app, "later").await;
    assert_eq!(keepalives, 0);
    assert_eq!(snapshots, vec![done]);
}
