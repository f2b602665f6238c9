//! Application state shared across handlers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::info;

use crate::install::{DEFAULT_POLL_INTERVAL, Installer, InstallerOptions, ProgressStore};
use crate::lock::{LockManager, LockOptions};
use crate::registry::{EntityClass, RecordStore, SettingsStore};
use crate::supervisor::{OsProcessTable, ProcessTable, Supervisor, SupervisorOptions};

/// Name of the lock resource that serializes port checks, relative to the data dir.
pub const PORTS_RESOURCE: &str = "ports";

/// Everything needed to assemble [`AppState`].
#[derive(Debug, Clone)]
pub struct StateOptions {
    /// Directory holding the JSON documents and lock markers.
    pub data_dir: PathBuf,
    pub lock: LockOptions,
    pub supervisor: SupervisorOptions,
    pub installer: InstallerOptions,
    /// How often progress subscribers poll.
    pub progress_interval: Duration,
}

impl StateOptions {
    pub fn new(data_dir: impl Into<PathBuf>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            lock: LockOptions::default(),
            supervisor: SupervisorOptions {
                log_dir: log_dir.into(),
                grace_period: Duration::from_secs(10),
                launch: Default::default(),
            },
            installer: InstallerOptions::default(),
            progress_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Model, RAG and SQL engine managers plus the OpenAI-compatible gateway.
    pub supervisor: Arc<Supervisor>,
    /// The `config.json` document.
    pub settings: SettingsStore,
    /// Background install tasks.
    pub installer: Arc<Installer>,
    /// Latest snapshot per install task.
    pub progress: ProgressStore,
    pub locks: Arc<LockManager>,
    pub progress_interval: Duration,
}

impl AppState {
    /// Build the state against the real process table.
    pub fn new(options: StateOptions) -> Self {
        Self::with_process_table(options, Arc::new(OsProcessTable))
    }

    pub fn with_process_table(options: StateOptions, processes: Arc<dyn ProcessTable>) -> Self {
        let data_dir = options.data_dir;
        let locks = Arc::new(LockManager::new(options.lock));

        let settings = SettingsStore::new(EntityClass::Config.path_in(&data_dir), locks.clone());
        let supervisor = Supervisor::new(
            RecordStore::new(EntityClass::Models.path_in(&data_dir), locks.clone()),
            RecordStore::new(EntityClass::Rags.path_in(&data_dir), locks.clone()),
            RecordStore::new(EntityClass::SqlServices.path_in(&data_dir), locks.clone()),
            settings.clone(),
            locks.clone(),
            processes,
            options.supervisor,
            data_dir.join(PORTS_RESOURCE),
        );
        let progress = ProgressStore::new();
        let installer = Installer::new(progress.clone(), options.installer);

        info!("Registry documents in {}", data_dir.display());
        Self {
            supervisor: Arc::new(supervisor),
            settings,
            installer: Arc::new(installer),
            progress,
            locks,
            progress_interval: options.progress_interval,
        }
    }

    /// Cancel in-flight installs and, if asked, stop every running service.
    pub async fn shutdown(&self, stop_services: bool) {
        self.installer.shutdown();
        if stop_services {
            let stopped = self.supervisor.stop_all().await;
            info!("Stopped {} running service(s)", stopped);
        }
    }
}
