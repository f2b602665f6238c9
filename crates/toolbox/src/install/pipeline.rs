//! Background download-then-extract tasks.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::BytesMut;
use dashmap::DashMap;
use futures::StreamExt;
use log::{error, info, warn};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::archive;
use super::progress::{Phase, ProgressSnapshot, ProgressStore};
use crate::error::{ToolboxError, ToolboxResult};

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
const FALLBACK_ARCHIVE_NAME: &str = "byzer.tar.gz";

/// What to fetch and where to unpack it.
#[derive(Debug, Clone, Deserialize)]
pub struct InstallRequest {
    pub download_url: String,
    pub install_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct InstallerOptions {
    /// Bytes written per progress update.
    pub chunk_size: usize,
    /// Made executable after extraction if present, relative to the install dir.
    pub start_script: PathBuf,
}

impl Default for InstallerOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            start_script: PathBuf::from("bin/byzer.sh"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    Succeeded,
    Failed(String),
    Cancelled,
}

/// Handle to a running install. Dropping it does not stop the task.
#[derive(Debug)]
pub struct InstallHandle {
    pub task_id: String,
    cancel: CancellationToken,
    join: JoinHandle<InstallOutcome>,
}

impl InstallHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> InstallOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) => InstallOutcome::Failed(format!("install task panicked: {e}")),
        }
    }
}

/// Starts install pipelines and tracks them for cancellation.
#[derive(Debug)]
pub struct Installer {
    client: reqwest::Client,
    progress: ProgressStore,
    options: InstallerOptions,
    tasks: Arc<DashMap<String, CancellationToken>>,
    shutdown: CancellationToken,
}

impl Installer {
    pub fn new(progress: ProgressStore, options: InstallerOptions) -> Self {
        Self::with_client(reqwest::Client::new(), progress, options)
    }

    pub fn with_client(
        client: reqwest::Client,
        progress: ProgressStore,
        options: InstallerOptions,
    ) -> Self {
        Self {
            client,
            progress,
            options,
            tasks: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn progress(&self) -> &ProgressStore {
        &self.progress
    }

    /// Ids of tasks that have not finished.
    pub fn active_tasks(&self) -> Vec<String> {
        self.tasks.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Kick off a pipeline and return immediately.
    pub fn start(&self, request: InstallRequest) -> ToolboxResult<InstallHandle> {
        let url = reqwest::Url::parse(&request.download_url)
            .map_err(|e| ToolboxError::invalid(format!("invalid download_url: {e}")))?;
        if request.install_dir.as_os_str().is_empty() {
            return Err(ToolboxError::invalid("install_dir is required"));
        }

        let task_id = Uuid::new_v4().to_string();
        self.progress
            .publish(ProgressSnapshot::new(&task_id, Phase::Download, 0));

        let cancel = self.shutdown.child_token();
        self.tasks.insert(task_id.clone(), cancel.clone());

        let task = Pipeline {
            task_id: task_id.clone(),
            url,
            install_dir: request.install_dir,
            client: self.client.clone(),
            progress: self.progress.clone(),
            options: self.options.clone(),
            cancel: cancel.clone(),
        };
        let tasks = self.tasks.clone();
        let join = tokio::spawn(async move {
            let task_id = task.task_id.clone();
            let outcome = task.run().await;
            tasks.remove(&task_id);
            outcome
        });

        info!("Install task {} started", task_id);
        Ok(InstallHandle {
            task_id,
            cancel,
            join,
        })
    }

    /// Cancel a running task. Returns false if no such task is running.
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.tasks.get(task_id) {
            Some(token) => {
                info!("Cancelling install task {}", task_id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every in-flight task.
    pub fn shutdown(&self) {
        let active = self.tasks.len();
        if active > 0 {
            info!("Cancelling {} install tasks", active);
        }
        self.shutdown.cancel();
    }
}

/// One install task's state.
struct Pipeline {
    task_id: String,
    url: reqwest::Url,
    install_dir: PathBuf,
    client: reqwest::Client,
    progress: ProgressStore,
    options: InstallerOptions,
    cancel: CancellationToken,
}

impl Pipeline {
    async fn run(self) -> InstallOutcome {
        let archive_path = self.install_dir.join(archive_file_name(&self.url));
        let mut phase = Phase::Download;

        // Extraction is never abandoned mid-entry: `install` only returns once
        // the blocking thread has stopped, so nothing publishes after us.
        let result = self.install(&archive_path, &mut phase).await;

        match result {
            Ok(()) => {
                info!("Install task {} completed in {}", self.task_id, self.install_dir.display());
                InstallOutcome::Succeeded
            }
            Err(_) if self.cancel.is_cancelled() => {
                warn!("Install task {} cancelled", self.task_id);
                self.finish_with_error(phase, "cancelled".to_string());
                let _ = tokio::fs::remove_file(&archive_path).await;
                InstallOutcome::Cancelled
            }
            Err(e) => {
                error!("Install task {} failed: {}", self.task_id, e);
                self.finish_with_error(phase, e.to_string());
                let _ = tokio::fs::remove_file(&archive_path).await;
                InstallOutcome::Failed(e.to_string())
            }
        }
    }

    fn finish_with_error(&self, phase: Phase, message: String) {
        let progress = self
            .progress
            .get(&self.task_id)
            .map(|s| s.progress)
            .unwrap_or(0);
        let mut snapshot = ProgressSnapshot::new(&self.task_id, phase, progress);
        snapshot.completed = true;
        snapshot.error = Some(message);
        self.progress.publish(snapshot);
    }

    async fn install(&self, archive_path: &Path, phase: &mut Phase) -> ToolboxResult<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return Err(ToolboxError::DownloadFailure("cancelled".to_string()));
            }
            downloaded = self.download(archive_path) => downloaded?,
        }

        *phase = Phase::Extract;
        self.progress
            .publish(ProgressSnapshot::new(&self.task_id, Phase::Extract, 0));
        let entries = self.extract(archive_path).await?;
        if self.cancel.is_cancelled() {
            return Err(ToolboxError::ExtractionFailure("cancelled".to_string()));
        }
        info!("Install task {} extracted {} entries", self.task_id, entries);

        tokio::fs::remove_file(archive_path).await?;
        let script = self.install_dir.join(&self.options.start_script);
        if tokio::fs::try_exists(&script).await.unwrap_or(false) {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).await?;
        }

        let mut done = ProgressSnapshot::new(&self.task_id, Phase::Extract, 100);
        done.completed = true;
        self.progress.publish(done);
        Ok(())
    }

    async fn download(&self, archive_path: &Path) -> ToolboxResult<()> {
        tokio::fs::create_dir_all(&self.install_dir).await?;
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(|e| download_error(e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ToolboxError::DownloadFailure(format!(
                "{} returned {}",
                self.url, status
            )));
        }
        let total = response.content_length().filter(|n| *n > 0);
        info!(
            "Downloading {} ({} bytes) to {}",
            self.url,
            total.map_or_else(|| "unknown".to_string(), |n| n.to_string()),
            archive_path.display()
        );

        let mut file = tokio::fs::File::create(archive_path)
            .await
            .map_err(|e| download_error(e))?;
        let chunk_size = self.options.chunk_size.max(1);
        let mut pending = BytesMut::with_capacity(chunk_size);
        let mut received: u64 = 0;
        let mut body = response.bytes_stream();

        loop {
            let next = body.next().await;
            let finished = next.is_none();
            if let Some(item) = next {
                pending.extend_from_slice(&item.map_err(|e| download_error(e))?);
            }
            while pending.len() >= chunk_size || (finished && !pending.is_empty()) {
                let take = chunk_size.min(pending.len());
                let chunk = pending.split_to(take);
                file.write_all(&chunk).await.map_err(|e| download_error(e))?;
                received += chunk.len() as u64;
                if let Some(total) = total {
                    let pct = (received.saturating_mul(100) / total).min(100);
                    self.progress.publish(ProgressSnapshot::new(
                        &self.task_id,
                        Phase::Download,
                        u8::try_from(pct).unwrap_or(100),
                    ));
                }
            }
            if finished {
                break;
            }
        }
        file.flush().await.map_err(|e| download_error(e))?;
        info!("Downloaded {} bytes for task {}", received, self.task_id);
        Ok(())
    }

    async fn extract(&self, archive_path: &Path) -> ToolboxResult<usize> {
        let archive = archive_path.to_path_buf();
        let dest = self.install_dir.clone();
        let cancel = self.cancel.clone();
        let progress = self.progress.clone();
        let task_id = self.task_id.clone();

        tokio::task::spawn_blocking(move || {
            archive::extract_blocking(&archive, &dest, &cancel, |pct| {
                progress.publish(ProgressSnapshot::new(&task_id, Phase::Extract, pct));
            })
        })
        .await
        .map_err(|e| ToolboxError::ExtractionFailure(format!("extraction task failed: {e}")))?
    }
}

fn download_error(e: impl std::fmt::Display) -> ToolboxError {
    ToolboxError::DownloadFailure(e.to_string())
}

/// Last path segment of the URL, or a fixed name if it has none.
fn archive_file_name(url: &reqwest::Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .map(str::to_string)
        .unwrap_or_else(|| FALLBACK_ARCHIVE_NAME.to_string())
}
