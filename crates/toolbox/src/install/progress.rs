//! Latest-value progress snapshots per install task.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::Stream;
use log::debug;
use serde::{Deserialize, Serialize};

/// Default poll interval for subscribers.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Download,
    Extract,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub task_id: String,
    #[serde(rename = "type")]
    pub phase: Phase,
    /// 0..=100 within the current phase.
    pub progress: u8,
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProgressSnapshot {
    pub fn new(task_id: impl Into<String>, phase: Phase, progress: u8) -> Self {
        Self {
            task_id: task_id.into(),
            phase,
            progress: progress.min(100),
            completed: false,
            error: None,
        }
    }

    /// Failures are terminal too.
    pub fn is_terminal(&self) -> bool {
        self.completed
    }
}

/// What a subscriber sees on each tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Snapshot(ProgressSnapshot),
    /// No snapshot stored for the task (yet, or any more).
    KeepAlive,
}

/// Concurrent map of task id to its latest snapshot.
///
/// Written by the owning pipeline, read and finally cleared by a poller.
#[derive(Debug, Clone, Default)]
pub struct ProgressStore {
    inner: Arc<DashMap<String, ProgressSnapshot>>,
}

impl ProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `snapshot` as the task's latest. A terminal snapshot is final:
    /// later publishes for that task are dropped until a subscriber clears it.
    pub fn publish(&self, snapshot: ProgressSnapshot) {
        match self.inner.entry(snapshot.task_id.clone()) {
            Entry::Occupied(entry) if entry.get().is_terminal() => {
                debug!("Ignoring progress for finished task {}", snapshot.task_id);
            }
            Entry::Occupied(mut entry) => {
                entry.insert(snapshot);
            }
            Entry::Vacant(entry) => {
                entry.insert(snapshot);
            }
        }
    }

    pub fn get(&self, task_id: &str) -> Option<ProgressSnapshot> {
        self.inner.get(task_id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, task_id: &str) -> Option<ProgressSnapshot> {
        self.inner.remove(task_id).map(|(_, snapshot)| snapshot)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Poll `task_id` every `every`.
    ///
    /// Ends right after yielding a terminal snapshot, which is then removed.
    /// Dropping the stream leaves the task running.
    pub fn subscribe<T: Into<String>>(
        &self,
        task_id: T,
        every: Duration,
    ) -> impl Stream<Item = ProgressEvent> + Send + 'static + use<T> {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let state = Some((self.clone(), task_id.into(), ticker));

        futures::stream::unfold(state, |state| async move {
            let (store, task_id, mut ticker) = state?;
            ticker.tick().await;
            match store.get(&task_id) {
                Some(snapshot) if snapshot.is_terminal() => {
                    store.remove(&task_id);
                    Some((ProgressEvent::Snapshot(snapshot), None))
                }
                Some(snapshot) => Some((
                    ProgressEvent::Snapshot(snapshot),
                    Some((store, task_id, ticker)),
                )),
                None => Some((ProgressEvent::KeepAlive, Some((store, task_id, ticker)))),
            }
        })
    }
}
