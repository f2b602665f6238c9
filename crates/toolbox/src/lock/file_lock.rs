//! Marker-file lock shared between toolbox processes on the same host.
//!
//! A resource `path` is guarded by `<path>.lock`. The marker is created with
//! create-if-absent semantics, so existence means "held". Within one process an
//! async mutex per resource queues callers before they touch the filesystem.
//!
//! Each marker names its holder's pid and a per-acquisition token. A guard only
//! ever deletes a marker carrying its own token, and stale markers are reclaimed
//! under a second `<path>.lock.reclaim` marker so two waiters cannot both
//! remove the same dead holder.

use std::ffi::OsString;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, info, warn};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use uuid::Uuid;

use super::clock::{Backoff, Clock, TokioClock};
use crate::error::{ToolboxError, ToolboxResult};

/// Default acquisition budget.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Tunables for lock acquisition.
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Give up after this long.
    pub timeout: Duration,
    /// Delay schedule between attempts.
    pub backoff: Backoff,
    /// Remove markers whose recorded holder pid is no longer alive.
    pub reclaim_stale: bool,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_LOCK_TIMEOUT,
            backoff: Backoff::default(),
            reclaim_stale: true,
        }
    }
}

/// Acquisition progress for one caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Nothing attempted yet.
    Idle,
    /// Marker exists; retrying.
    Waiting { since: Instant, attempts: u32 },
    /// Marker created by this caller.
    Held { since: Instant },
}

impl LockState {
    fn on_conflict(self, now: Instant) -> Self {
        match self {
            LockState::Idle => LockState::Waiting {
                since: now,
                attempts: 1,
            },
            LockState::Waiting { since, attempts } => LockState::Waiting {
                since,
                attempts: attempts.saturating_add(1),
            },
            held @ LockState::Held { .. } => held,
        }
    }
}

/// Hands out [`FileLockGuard`]s.
///
/// One manager is owned by the application context; clones of the `Arc`
/// share the in-process queue.
#[derive(Debug)]
pub struct LockManager {
    options: LockOptions,
    clock: Arc<dyn Clock>,
    local: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl LockManager {
    /// Create a manager using the tokio clock.
    pub fn new(options: LockOptions) -> Self {
        Self::with_clock(options, Arc::new(TokioClock))
    }

    /// Create a manager with an explicit clock.
    pub fn with_clock(options: LockOptions, clock: Arc<dyn Clock>) -> Self {
        Self {
            options,
            clock,
            local: DashMap::new(),
        }
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    /// Acquire the lock for `resource` with the configured timeout.
    pub async fn acquire(&self, resource: &Path) -> ToolboxResult<FileLockGuard> {
        self.acquire_with_timeout(resource, self.options.timeout)
            .await
    }

    /// Acquire the lock for `resource`, failing with `LockTimeout` after `timeout`.
    pub async fn acquire_with_timeout(
        &self,
        resource: &Path,
        timeout: Duration,
    ) -> ToolboxResult<FileLockGuard> {
        let marker = marker_path(resource);
        let started = self.clock.now();
        if let Some(parent) = marker.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let local = self.local_slot(&marker);
        let local_guard = tokio::select! {
            biased;
            guard = local.lock_owned() => guard,
            _ = self.clock.sleep(timeout) => {
                warn!("Timed out waiting for in-process lock on {}", marker.display());
                return Err(ToolboxError::LockTimeout {
                    path: resource.to_path_buf(),
                    timeout,
                });
            }
        };

        let token = Uuid::new_v4().to_string();
        let mut state = LockState::Idle;
        loop {
            match create_marker(&marker, &token).await {
                Ok(()) => {
                    let since = self.clock.now();
                    state = LockState::Held { since };
                    debug!("Acquired {} ({:?})", marker.display(), state);
                    return Ok(FileLockGuard {
                        marker,
                        token,
                        held_since: since,
                        released: false,
                        _local: local_guard,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let now = self.clock.now();
                    state = state.on_conflict(now);
                    let LockState::Waiting { attempts, .. } = state else {
                        continue;
                    };

                    let elapsed = now.saturating_duration_since(started);
                    if elapsed >= timeout {
                        warn!(
                            "Gave up on {} after {} attempts ({:?})",
                            marker.display(),
                            attempts,
                            elapsed
                        );
                        return Err(ToolboxError::LockTimeout {
                            path: resource.to_path_buf(),
                            timeout,
                        });
                    }

                    if self.options.reclaim_stale && reclaim_if_stale(&marker).await? {
                        continue;
                    }

                    let delay = self
                        .options
                        .backoff
                        .delay(attempts - 1)
                        .min(timeout - elapsed);
                    self.clock.sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Run `f` while holding the lock for `resource`.
    pub async fn with_lock<T, F, Fut>(&self, resource: &Path, f: F) -> ToolboxResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ToolboxResult<T>>,
    {
        let guard = self.acquire(resource).await?;
        let result = f().await;
        guard.release().await?;
        result
    }

    /// Remove the marker for `resource` regardless of who holds it.
    ///
    /// Administrative escape hatch for markers left behind by a crashed
    /// holder. Returns whether a marker existed.
    pub async fn force_unlock(resource: &Path) -> ToolboxResult<bool> {
        let marker = marker_path(resource);
        match fs::remove_file(&marker).await {
            Ok(()) => {
                info!("Removed lock marker {}", marker.display());
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn local_slot(&self, marker: &Path) -> Arc<Mutex<()>> {
        self.local
            .entry(marker.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(LockOptions::default())
    }
}

/// Scoped ownership of a resource lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct FileLockGuard {
    marker: PathBuf,
    token: String,
    held_since: Instant,
    released: bool,
    _local: OwnedMutexGuard<()>,
}

impl FileLockGuard {
    pub fn marker_path(&self) -> &Path {
        &self.marker
    }

    pub fn held_since(&self) -> Instant {
        self.held_since
    }

    /// Delete the marker and hand the resource to the next waiter.
    ///
    /// A marker that no longer carries this guard's token is left alone.
    pub async fn release(mut self) -> ToolboxResult<()> {
        self.released = true;
        let body = match fs::read_to_string(&self.marker).await {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if parse_token(&body) != Some(self.token.as_str()) {
            warn!("Lock marker {} was taken over; leaving it", self.marker.display());
            return Ok(());
        }
        let result = match fs::remove_file(&self.marker).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        };
        debug!("Released {}", self.marker.display());
        result
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Runs before `_local` is dropped, so in-process waiters never see our marker.
        let owned = std::fs::read_to_string(&self.marker)
            .is_ok_and(|body| parse_token(&body) == Some(self.token.as_str()));
        if owned
            && let Err(e) = std::fs::remove_file(&self.marker)
            && e.kind() != ErrorKind::NotFound
        {
            warn!("Failed to remove lock marker {}: {}", self.marker.display(), e);
        }
    }
}

/// `<resource>.lock`
pub fn marker_path(resource: &Path) -> PathBuf {
    let mut name = OsString::from(resource.as_os_str());
    name.push(".lock");
    PathBuf::from(name)
}

/// `<marker>.reclaim`
fn reclaim_path(marker: &Path) -> PathBuf {
    let mut name = OsString::from(marker.as_os_str());
    name.push(".reclaim");
    PathBuf::from(name)
}

async fn create_marker(marker: &Path, token: &str) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(marker)
        .await?;
    let body = format!(
        "pid={}\ntoken={}\nacquired_at={}\n",
        std::process::id(),
        token,
        chrono::Utc::now().to_rfc3339()
    );
    file.write_all(body.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

fn field<'a>(body: &'a str, key: &str) -> Option<&'a str> {
    body.lines()
        .find_map(|line| line.strip_prefix(key)?.strip_prefix('='))
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Holder pid recorded in a marker body, if the body is complete.
fn parse_holder(body: &str) -> Option<u32> {
    field(body, "pid").and_then(|pid| pid.parse().ok())
}

fn parse_token(body: &str) -> Option<&str> {
    field(body, "token")
}

/// What a marker file says about its holder.
#[derive(Debug, PartialEq, Eq)]
enum Holder {
    Missing,
    /// Alive, unreadable, or not fully written yet.
    Held,
    /// Recorded pid is gone; carries the exact body that was read.
    Dead { pid: u32, body: String },
}

async fn inspect(marker: &Path) -> Holder {
    let body = match fs::read_to_string(marker).await {
        Ok(body) => body,
        Err(e) if e.kind() == ErrorKind::NotFound => return Holder::Missing,
        Err(_) => return Holder::Held,
    };
    match parse_holder(&body) {
        Some(pid) if pid != std::process::id() && !holder_alive(pid) => Holder::Dead { pid, body },
        _ => Holder::Held,
    }
}

/// Removes the reclaim marker on every exit path, including cancellation.
struct ReclaimGuard(PathBuf);

impl Drop for ReclaimGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0)
            && e.kind() != ErrorKind::NotFound
        {
            warn!("Failed to remove reclaim marker {}: {}", self.0.display(), e);
        }
    }
}

/// Remove the marker if its holder is dead. Returns true when the marker is
/// gone and creation should be retried immediately.
///
/// The remove happens under `<marker>.reclaim` and only if the marker still
/// holds the body that named the dead pid, so a marker created by another
/// waiter in the meantime is never touched.
async fn reclaim_if_stale(marker: &Path) -> ToolboxResult<bool> {
    let (pid, expected) = match inspect(marker).await {
        Holder::Missing => return Ok(true),
        Holder::Held => return Ok(false),
        Holder::Dead { pid, body } => (pid, body),
    };

    let reclaim = reclaim_path(marker);
    match create_marker(&reclaim, &Uuid::new_v4().to_string()).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            // Another waiter is reclaiming; clear its marker only if it died mid-way.
            if let Holder::Dead { pid, .. } = inspect(&reclaim).await {
                warn!("Removing reclaim marker left by dead process {}", pid);
                let _ = fs::remove_file(&reclaim).await;
            }
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    }
    let _reclaiming = ReclaimGuard(reclaim);

    match fs::read_to_string(marker).await {
        Ok(body) if body == expected => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
        _ => return Ok(false),
    }
    warn!(
        "Reclaiming {} left behind by dead process {}",
        marker.display(),
        pid
    );
    match fs::remove_file(marker).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e.into()),
    }
}

fn holder_alive(pid: u32) -> bool {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs permission and existence checks only.
    let rc = unsafe { libc::kill(raw, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
