//! Lifecycle operations for one entity table.

use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::launch::{Launch, LaunchSettings};
use super::logs::{self, LogChunk, LogStream};
use super::process::{self, ProcessState, ProcessTable, Termination};
use crate::error::{ToolboxError, ToolboxResult};
use crate::lock::LockManager;
use crate::registry::{
    ModelConfig, RagConfig, RagRecord, RecordStore, ServiceRecord, ServiceStatus, SettingsStore,
    SqlServiceConfig, SqlServiceRecord, Table,
};

use super::openai::{self, OPENAI_SERVICE_NAME, OpenAiService};

/// Which table an entity lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Model,
    Rag,
    SqlService,
    OpenAiService,
}

impl ServiceKind {
    pub fn label(&self) -> &'static str {
        match self {
            ServiceKind::Model => "Model",
            ServiceKind::Rag => "RAG",
            ServiceKind::SqlService => "Byzer SQL",
            ServiceKind::OpenAiService => "OpenAI compatible service",
        }
    }
}

/// Entity configuration the supervisor can manage.
pub trait ServiceConfig:
    Launch + Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static
{
    const KIND: ServiceKind;

    /// Names that collide with static routes under the table's prefix.
    const RESERVED_NAMES: &'static [&'static str] = &["add"];

    /// Directories that must exist while the entity is registered.
    fn required_dirs(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    /// Business rules against the other records of the same table.
    fn check_siblings(
        &self,
        _name: &str,
        _table: &Table<ServiceRecord<Self>>,
    ) -> ToolboxResult<()> {
        Ok(())
    }
}

impl ServiceConfig for ModelConfig {
    const KIND: ServiceKind = ServiceKind::Model;
}

impl ServiceConfig for RagConfig {
    const KIND: ServiceKind = ServiceKind::Rag;

    fn check_siblings(&self, name: &str, table: &Table<RagRecord>) -> ToolboxResult<()> {
        match table
            .iter()
            .find(|(other, record)| other.as_str() != name && record.config.port == self.port)
        {
            Some((other, _)) => Err(ToolboxError::conflict(format!(
                "port {} is already in use by RAG {}",
                self.port, other
            ))),
            None => Ok(()),
        }
    }
}

impl ServiceConfig for SqlServiceConfig {
    const KIND: ServiceKind = ServiceKind::SqlService;
    const RESERVED_NAMES: &'static [&'static str] = &["add", "download"];

    fn required_dirs(&self) -> Vec<PathBuf> {
        vec![self.install_dir.clone()]
    }
}

/// Names become log file names, so they must be a single path component.
pub fn validate_name(name: &str) -> ToolboxResult<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if bad {
        return Err(ToolboxError::invalid(format!("invalid name: {name:?}")));
    }
    Ok(())
}

/// Supervisor-wide settings.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub log_dir: PathBuf,
    /// How long SIGTERM gets before SIGKILL.
    pub grace_period: Duration,
    pub launch: LaunchSettings,
}

/// Result of a status probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub name: String,
    pub status: ServiceStatus,
    pub process_id: Option<u32>,
    pub is_alive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Started {
    pub process_id: u32,
    /// The recorded process was still alive; nothing was spawned.
    pub already_running: bool,
}

/// State shared by every table's manager.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) locks: Arc<LockManager>,
    pub(crate) processes: Arc<dyn ProcessTable>,
    pub(crate) options: SupervisorOptions,
    /// Serializes check-and-spawn for listening entities.
    pub(crate) ports_resource: PathBuf,
    pub(crate) rags: RecordStore<RagRecord>,
    pub(crate) sql: RecordStore<SqlServiceRecord>,
    /// Holds the OpenAI-compatible server list.
    pub(crate) settings: SettingsStore,
}

impl Shared {
    pub(super) fn is_alive(&self, pid: Option<u32>) -> bool {
        pid.is_some_and(|pid| !matches!(self.processes.probe(pid), Ok(ProcessState::Gone)))
    }

    /// Conflict if a live record other than `(kind, name)` holds `port`.
    ///
    /// Must be called with the ports lock held.
    pub(super) async fn ensure_port_free(&self, kind: ServiceKind, name: &str, port: u16) -> ToolboxResult<()> {
        let claims = |other_kind: ServiceKind, other: &str| !(other_kind == kind && other == name);

        for (other, record) in self.rags.load().await? {
            if record.is_running()
                && record.config.port == port
                && claims(ServiceKind::Rag, other.as_str())
                && self.is_alive(record.process_id)
            {
                return Err(ToolboxError::conflict(format!(
                    "port {port} is already in use by RAG {other}"
                )));
            }
        }
        for (other, record) in self.sql.load().await? {
            if record.is_running()
                && record.config.port == Some(port)
                && claims(ServiceKind::SqlService, other.as_str())
                && self.is_alive(record.process_id)
            {
                return Err(ToolboxError::conflict(format!(
                    "port {port} is already in use by Byzer SQL {other}"
                )));
            }
        }
        if claims(ServiceKind::OpenAiService, OPENAI_SERVICE_NAME) {
            let settings = self.settings.load().await?;
            if openai::recorded_servers(&settings)
                .iter()
                .any(|server| server.port == port && self.is_alive(Some(server.pid)))
            {
                return Err(ToolboxError::conflict(format!(
                    "port {port} is already in use by the OpenAI compatible service"
                )));
            }
        }
        Ok(())
    }
}

/// Add/update/delete/start/stop/status for one entity table.
#[derive(Debug)]
pub struct ServiceManager<C> {
    store: RecordStore<ServiceRecord<C>>,
    shared: Arc<Shared>,
}

impl<C: ServiceConfig> ServiceManager<C> {
    pub(crate) fn new(store: RecordStore<ServiceRecord<C>>, shared: Arc<Shared>) -> Self {
        Self { store, shared }
    }

    pub fn kind(&self) -> ServiceKind {
        C::KIND
    }

    pub fn store(&self) -> &RecordStore<ServiceRecord<C>> {
        &self.store
    }

    fn not_found(name: &str) -> ToolboxError {
        ToolboxError::not_found(format!("{} {}", C::KIND.label(), name))
    }

    fn report(op: &str, name: &str, err: &ToolboxError) {
        error!("{} {} {} failed: {}", C::KIND.label(), name, op, err);
    }

    /// All records, ordered by name.
    pub async fn list(&self) -> ToolboxResult<Vec<(String, ServiceRecord<C>)>> {
        Ok(self.store.load().await?.into_iter().collect())
    }

    pub async fn get(&self, name: &str) -> ToolboxResult<ServiceRecord<C>> {
        self.store
            .load()
            .await?
            .remove(name)
            .ok_or_else(|| Self::not_found(name))
    }

    /// Register a new, stopped entity.
    pub async fn add(&self, name: &str, config: C) -> ToolboxResult<()> {
        self.add_inner(name, config)
            .await
            .inspect_err(|e| Self::report("add", name, e))
    }

    async fn add_inner(&self, name: &str, config: C) -> ToolboxResult<()> {
        validate_name(name)?;
        if C::RESERVED_NAMES.contains(&name) {
            return Err(ToolboxError::invalid(format!(
                "{name:?} is reserved for {} routes",
                C::KIND.label()
            )));
        }
        let mut txn = self.store.begin().await?;
        if txn.table().contains_key(name) {
            return Err(ToolboxError::conflict(format!(
                "{} {} already exists",
                C::KIND.label(),
                name
            )));
        }
        config.check_siblings(name, txn.table())?;
        for dir in config.required_dirs() {
            tokio::fs::create_dir_all(&dir).await?;
        }
        txn.table_mut()
            .insert(name.to_string(), ServiceRecord::stopped(config));
        txn.commit().await?;
        info!("{} {} added", C::KIND.label(), name);
        Ok(())
    }

    /// Replace the configuration of a stopped entity.
    pub async fn update(&self, name: &str, config: C) -> ToolboxResult<()> {
        self.update_inner(name, config)
            .await
            .inspect_err(|e| Self::report("update", name, e))
    }

    async fn update_inner(&self, name: &str, config: C) -> ToolboxResult<()> {
        let mut txn = self.store.begin().await?;
        let Some(record) = txn.table().get(name) else {
            return Err(Self::not_found(name));
        };
        if record.is_running() {
            return Err(ToolboxError::conflict(format!(
                "cannot update running {} {}; stop it first",
                C::KIND.label(),
                name
            )));
        }
        config.check_siblings(name, txn.table())?;
        for dir in config.required_dirs() {
            tokio::fs::create_dir_all(&dir).await?;
        }
        if let Some(record) = txn.table_mut().get_mut(name) {
            record.config = config;
        }
        txn.commit().await?;
        info!("{} {} updated", C::KIND.label(), name);
        Ok(())
    }

    /// Remove a stopped entity and its logs.
    pub async fn delete(&self, name: &str) -> ToolboxResult<()> {
        self.store
            .update(|table| {
                match table.get(name) {
                    None => return Err(Self::not_found(name)),
                    Some(record) if record.is_running() => {
                        return Err(ToolboxError::conflict(format!(
                            "cannot delete running {} {}; stop it first",
                            C::KIND.label(),
                            name
                        )));
                    }
                    Some(_) => {}
                }
                table.remove(name);
                Ok(())
            })
            .await
            .inspect_err(|e| Self::report("delete", name, e))?;

        if validate_name(name).is_ok() {
            logs::remove_logs(&self.shared.options.log_dir, name).await;
        }
        info!("{} {} deleted", C::KIND.label(), name);
        Ok(())
    }

    /// Spawn the entity's process and mark it running.
    pub async fn start(&self, name: &str) -> ToolboxResult<Started> {
        self.start_inner(name)
            .await
            .inspect_err(|e| Self::report("start", name, e))
    }

    async fn start_inner(&self, name: &str) -> ToolboxResult<Started> {
        validate_name(name)?;
        let record = self.get(name).await?;
        if let Some(started) = self.already_running(&record) {
            return Ok(started);
        }
        // Render early so a bad config fails before any lock is contended.
        record.config.invocation(name, &self.shared.options.launch)?;

        let ports_guard = match record.config.port() {
            Some(_) => Some(self.shared.locks.acquire(&self.shared.ports_resource).await?),
            None => None,
        };
        let result = self.check_and_spawn(name).await;
        if let Some(guard) = ports_guard {
            guard.release().await?;
        }
        result
    }

    async fn check_and_spawn(&self, name: &str) -> ToolboxResult<Started> {
        // Port scan takes and releases the listening tables' locks before
        // ours is taken below.
        let port = self.get(name).await?.config.port();
        if let Some(port) = port {
            self.shared.ensure_port_free(C::KIND, name, port).await?;
        }

        let mut txn = self.store.begin().await?;
        let Some(record) = txn.table_mut().get_mut(name) else {
            return Err(Self::not_found(name));
        };
        if let Some(started) = self.already_running(record) {
            txn.rollback().await?;
            return Ok(started);
        }
        if record.config.port() != port {
            return Err(ToolboxError::conflict(format!(
                "{} {} changed while starting",
                C::KIND.label(),
                name
            )));
        }

        let invocation = record.config.invocation(name, &self.shared.options.launch)?;
        info!("Starting {} {}: {}", C::KIND.label(), name, invocation);
        let log_dir = &self.shared.options.log_dir;
        let pid = process::spawn_detached(
            name,
            &invocation,
            &logs::log_path(log_dir, name, LogStream::Out),
            &logs::log_path(log_dir, name, LogStream::Err),
        )?;

        record.mark_running(pid);
        if let Err(e) = txn.commit().await {
            // Never leave an untracked process behind.
            warn!("Could not record PID {} for {}; terminating it", pid, name);
            let _ = process::terminate_tree(
                self.shared.processes.clone(),
                name,
                pid,
                self.shared.options.grace_period,
            )
            .await;
            return Err(e);
        }
        Ok(Started {
            process_id: pid,
            already_running: false,
        })
    }

    fn already_running(&self, record: &ServiceRecord<C>) -> Option<Started> {
        if !record.is_running() || !self.shared.is_alive(record.process_id) {
            return None;
        }
        let pid = record.process_id?;
        debug!("{} already running with PID {}", C::KIND.label(), pid);
        Some(Started {
            process_id: pid,
            already_running: true,
        })
    }

    /// Terminate the entity's process tree and mark it stopped.
    ///
    /// The record ends `stopped` even when termination fails; the failure is
    /// still returned.
    pub async fn stop(&self, name: &str) -> ToolboxResult<Termination> {
        self.stop_inner(name)
            .await
            .inspect_err(|e| Self::report("stop", name, e))
    }

    async fn stop_inner(&self, name: &str) -> ToolboxResult<Termination> {
        let record = self.get(name).await?;
        let outcome = match record.process_id {
            Some(pid) => {
                process::terminate_tree(
                    self.shared.processes.clone(),
                    name,
                    pid,
                    self.shared.options.grace_period,
                )
                .await
            }
            None => Ok(Termination::AlreadyGone),
        };

        self.store
            .update(|table| {
                let Some(current) = table.get_mut(name) else {
                    return Err(Self::not_found(name));
                };
                // A different pid means someone restarted it meanwhile.
                if current.process_id.is_none() || current.process_id == record.process_id {
                    current.mark_stopped();
                }
                Ok(())
            })
            .await?;

        if outcome.is_ok() {
            info!("{} {} stopped", C::KIND.label(), name);
        }
        outcome
    }

    /// Probe the recorded process and persist the reconciled status.
    pub async fn status(&self, name: &str) -> ToolboxResult<StatusReport> {
        let mut txn = self.store.begin().await?;
        let Some(record) = txn.table_mut().get_mut(name) else {
            let err = Self::not_found(name);
            Self::report("status", name, &err);
            return Err(err);
        };

        let probe = match record.process_id {
            Some(pid) => self.shared.processes.probe(pid),
            None => Ok(ProcessState::Gone),
        };
        match probe {
            Ok(state) => {
                let is_alive = state == ProcessState::Alive;
                if is_alive {
                    record.status = ServiceStatus::Running;
                } else {
                    if record.is_running() {
                        info!(
                            "{} {} (PID {:?}) is no longer running",
                            C::KIND.label(),
                            name,
                            record.process_id
                        );
                    }
                    record.mark_stopped();
                }
                let report = StatusReport {
                    name: name.to_string(),
                    status: record.status,
                    process_id: record.process_id,
                    is_alive,
                    error: None,
                };
                txn.commit().await?;
                Ok(report)
            }
            Err(e) => {
                warn!("Status probe for {} {} failed: {}", C::KIND.label(), name, e);
                let report = StatusReport {
                    name: name.to_string(),
                    status: ServiceStatus::Error,
                    process_id: record.process_id,
                    is_alive: false,
                    error: Some(e.to_string()),
                };
                txn.rollback().await?;
                Ok(report)
            }
        }
    }

    pub async fn read_log(
        &self,
        name: &str,
        stream: LogStream,
        offset: i64,
    ) -> ToolboxResult<LogChunk> {
        validate_name(name)?;
        logs::read_log(
            &logs::log_path(&self.shared.options.log_dir, name, stream),
            offset,
        )
        .await
        .inspect_err(|e| Self::report("read_log", name, e))
    }

    pub fn log_path(&self, name: &str, stream: LogStream) -> PathBuf {
        logs::log_path(&self.shared.options.log_dir, name, stream)
    }

    /// Stop every running entity; failures are logged and skipped.
    pub async fn stop_running(&self) -> usize {
        let Ok(records) = self.list().await else {
            return 0;
        };
        let mut stopped = 0;
        for (name, record) in records {
            if record.is_running() && self.stop(&name).await.is_ok() {
                stopped += 1;
            }
        }
        stopped
    }
}

/// Process supervisor over the model, RAG and SQL tables and the
/// OpenAI-compatible gateway.
#[derive(Debug)]
pub struct Supervisor {
    pub models: ServiceManager<ModelConfig>,
    pub rags: ServiceManager<RagConfig>,
    pub sql: ServiceManager<SqlServiceConfig>,
    pub openai: OpenAiService,
}

impl Supervisor {
    pub fn new(
        models: RecordStore<ServiceRecord<ModelConfig>>,
        rags: RecordStore<RagRecord>,
        sql: RecordStore<SqlServiceRecord>,
        settings: SettingsStore,
        locks: Arc<LockManager>,
        processes: Arc<dyn ProcessTable>,
        options: SupervisorOptions,
        ports_resource: impl AsRef<Path>,
    ) -> Self {
        let shared = Arc::new(Shared {
            locks,
            processes,
            options,
            ports_resource: ports_resource.as_ref().to_path_buf(),
            rags: rags.clone(),
            sql: sql.clone(),
            settings,
        });
        Self {
            models: ServiceManager::new(models, shared.clone()),
            rags: ServiceManager::new(rags, shared.clone()),
            sql: ServiceManager::new(sql, shared.clone()),
            openai: OpenAiService::new(shared),
        }
    }

    /// Stop every running entity across all tables.
    pub async fn stop_all(&self) -> usize {
        let openai = match self.openai.stop().await {
            Ok(stopped) => usize::from(stopped),
            Err(_) => 0,
        };
        self.models.stop_running().await
            + self.rags.stop_running().await
            + self.sql.stop_running().await
            + openai
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockOptions;
    use crate::registry::{EntityClass, SettingsStore};
    use crate::supervisor::process::Signal;
    use serde_json::json;
    use std::collections::HashMap;
    use std::io;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Process table where liveness is whatever the test says.
    #[derive(Debug, Default)]
    struct FakeProcessTable {
        alive: Mutex<HashMap<u32, bool>>,
        broken: Mutex<bool>,
    }

    impl FakeProcessTable {
        fn set_alive(&self, pid: u32, alive: bool) {
            self.alive.lock().unwrap().insert(pid, alive);
        }

        fn break_probe(&self) {
            *self.broken.lock().unwrap() = true;
        }
    }

    impl ProcessTable for FakeProcessTable {
        fn probe(&self, pid: u32) -> io::Result<ProcessState> {
            if *self.broken.lock().unwrap() {
                return Err(io::Error::other("procfs unavailable"));
            }
            Ok(match self.alive.lock().unwrap().get(&pid) {
                Some(true) => ProcessState::Alive,
                _ => ProcessState::Gone,
            })
        }

        fn descendants(&self, _pid: u32) -> io::Result<Vec<u32>> {
            Ok(Vec::new())
        }

        fn signal(&self, pid: u32, _signal: Signal) -> io::Result<()> {
            self.set_alive(pid, false);
            Ok(())
        }

        fn signal_group(&self, _pgid: u32, _signal: Signal) -> io::Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        _dir: TempDir,
        data_dir: PathBuf,
        supervisor: Supervisor,
        processes: Arc<FakeProcessTable>,
        settings: SettingsStore,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().to_path_buf();
        let locks = Arc::new(LockManager::new(LockOptions::default()));
        let processes = Arc::new(FakeProcessTable::default());
        let options = SupervisorOptions {
            log_dir: data_dir.join("logs"),
            grace_period: Duration::from_millis(200),
            launch: LaunchSettings {
                rag_binary: "/nonexistent/auto-coder.rag".to_string(),
                openai_binary: "/nonexistent/byzerllm".to_string(),
                ..LaunchSettings::default()
            },
        };
        let settings = SettingsStore::new(EntityClass::Config.path_in(&data_dir), locks.clone());
        let supervisor = Supervisor::new(
            RecordStore::new(EntityClass::Models.path_in(&data_dir), locks.clone()),
            RecordStore::new(EntityClass::Rags.path_in(&data_dir), locks.clone()),
            RecordStore::new(EntityClass::SqlServices.path_in(&data_dir), locks.clone()),
            settings.clone(),
            locks,
            processes.clone(),
            options,
            data_dir.join("ports"),
        );
        Fixture {
            _dir: dir,
            data_dir,
            supervisor,
            processes,
            settings,
        }
    }

    fn rag(port: u16) -> RagConfig {
        serde_json::from_value(json!({
            "model": "deepseek_chat",
            "tokenizer_path": "/tok",
            "doc_dir": "/docs",
            "port": port
        }))
        .unwrap()
    }

    async fn mark_running<C: ServiceConfig>(manager: &ServiceManager<C>, name: &str, pid: u32) {
        manager
            .store()
            .update(|table| {
                table.get_mut(name).unwrap().mark_running(pid);
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_add_rejects_duplicates_and_port_reuse() {
        let f = fixture();
        let rags = &f.supervisor.rags;
        rags.add("docs", rag(8100)).await.unwrap();

        let err = rags.add("docs", rag(8200)).await.unwrap_err();
        assert!(matches!(err, ToolboxError::Conflict(_)));

        let err = rags.add("docs2", rag(8100)).await.unwrap_err();
        assert!(matches!(err, ToolboxError::Conflict(_)));

        rags.add("docs2", rag(8101)).await.unwrap();
        assert_eq!(rags.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_add_rejects_path_like_names() {
        let f = fixture();
        let err = f.supervisor.rags.add("../etc", rag(8100)).await.unwrap_err();
        assert!(matches!(err, ToolboxError::InvalidConfiguration(_)));
    }

    #[tokio::test]
    async fn test_add_rejects_route_names() {
        let f = fixture();
        let sql = |dir: &str| SqlServiceConfig {
            install_dir: f.data_dir.join(dir),
            port: None,
            extra: Default::default(),
        };
        for name in ["add", "download"] {
            let err = f.supervisor.sql.add(name, sql(name)).await.unwrap_err();
            assert!(matches!(err, ToolboxError::InvalidConfiguration(_)), "{name}");
        }
        let err = f.supervisor.rags.add("add", rag(8100)).await.unwrap_err();
        assert!(matches!(err, ToolboxError::InvalidConfiguration(_)));
        // Only the SQL table has a download route.
        f.supervisor.rags.add("download", rag(8100)).await.unwrap();
    }

    #[tokio::test]
    async fn test_sql_add_creates_install_dir() {
        let f = fixture();
        let install_dir = f.data_dir.join("engines/sql1");
        let config = SqlServiceConfig {
            install_dir: install_dir.clone(),
            port: Some(9003),
            extra: Default::default(),
        };
        f.supervisor.sql.add("sql1", config).await.unwrap();
        assert!(install_dir.is_dir());

        let err = f.supervisor.sql.start("sql1").await.unwrap_err();
        assert!(matches!(err, ToolboxError::InvalidConfiguration(_)));
        let record = f.supervisor.sql.get("sql1").await.unwrap();
        assert_eq!(record.status, ServiceStatus::Stopped);
        assert!(record.process_id.is_none());
    }

    #[tokio::test]
    async fn test_update_and_delete_refuse_running() {
        let f = fixture();
        let rags = &f.supervisor.rags;
        rags.add("docs", rag(8100)).await.unwrap();
        mark_running(rags, "docs", 4242).await;
        f.processes.set_alive(4242, true);

        let err = rags.update("docs", rag(8102)).await.unwrap_err();
        assert!(matches!(err, ToolboxError::Conflict(_)));
        let err = rags.delete("docs").await.unwrap_err();
        assert!(matches!(err, ToolboxError::Conflict(_)));

        let err = rags.update("ghost", rag(8102)).await.unwrap_err();
        assert!(matches!(err, ToolboxError::NotFound(_)));
        let err = rags.delete("ghost").await.unwrap_err();
        assert!(matches!(err, ToolboxError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_removes_logs() {
        let f = fixture();
        let rags = &f.supervisor.rags;
        rags.add("docs", rag(8100)).await.unwrap();
        let out = rags.log_path("docs", LogStream::Out);
        std::fs::create_dir_all(out.parent().unwrap()).unwrap();
        std::fs::write(&out, "log").unwrap();

        rags.delete("docs").await.unwrap();
        assert!(!out.exists());
        assert!(rags.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_status_self_heals_dead_process() {
        let f = fixture();
        let rags = &f.supervisor.rags;
        rags.add("docs", rag(8100)).await.unwrap();
        mark_running(rags, "docs", 777).await;

        f.processes.set_alive(777, true);
        let report = rags.status("docs").await.unwrap();
        assert_eq!(report.status, ServiceStatus::Running);
        assert!(report.is_alive);

        f.processes.set_alive(777, false);
        let report = rags.status("docs").await.unwrap();
        assert_eq!(report.status, ServiceStatus::Stopped);
        assert_eq!(report.process_id, None);

        let stored = rags.get("docs").await.unwrap();
        assert_eq!(stored.status, ServiceStatus::Stopped);
        assert!(stored.process_id.is_none());
    }

    #[tokio::test]
    async fn test_status_probe_failure_is_reported_not_persisted() {
        let f = fixture();
        let rags = &f.supervisor.rags;
        rags.add("docs", rag(8100)).await.unwrap();
        mark_running(rags, "docs", 777).await;
        f.processes.break_probe();

        let report = rags.status("docs").await.unwrap();
        assert_eq!(report.status, ServiceStatus::Error);
        assert!(report.error.is_some());

        let stored = rags.get("docs").await.unwrap();
        assert_eq!(stored.status, ServiceStatus::Running);
        assert_eq!(stored.process_id, Some(777));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let f = fixture();
        let rags = &f.supervisor.rags;
        rags.add("docs", rag(8100)).await.unwrap();
        mark_running(rags, "docs", 555).await;
        f.processes.set_alive(555, true);

        assert_eq!(rags.stop("docs").await.unwrap(), Termination::Graceful);
        assert_eq!(rags.stop("docs").await.unwrap(), Termination::AlreadyGone);

        let stored = rags.get("docs").await.unwrap();
        assert_eq!(stored.status, ServiceStatus::Stopped);
        assert!(stored.process_id.is_none());
        assert!(matches!(
            rags.stop("ghost").await.unwrap_err(),
            ToolboxError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_start_conflicts_with_live_port_holder() {
        let f = fixture();
        let rags = &f.supervisor.rags;
        rags.add("docs", rag(8100)).await.unwrap();
        mark_running(rags, "docs", 901).await;
        f.processes.set_alive(901, true);

        let sql_dir = f.data_dir.join("sql");
        std::fs::create_dir_all(sql_dir.join("bin")).unwrap();
        std::fs::write(sql_dir.join("bin/byzer.sh"), "#!/bin/sh\nsleep 30\n").unwrap();
        f.supervisor
            .sql
            .add(
                "sql",
                SqlServiceConfig {
                    install_dir: sql_dir,
                    port: Some(8100),
                    extra: Default::default(),
                },
            )
            .await
            .unwrap();

        let err = f.supervisor.sql.start("sql").await.unwrap_err();
        assert!(matches!(err, ToolboxError::Conflict(_)));
        assert!(!crate::lock::marker_path(&f.data_dir.join("ports")).exists());
    }

    #[tokio::test]
    async fn test_start_is_noop_while_recorded_process_lives() {
        let f = fixture();
        let rags = &f.supervisor.rags;
        rags.add("docs", rag(8100)).await.unwrap();
        mark_running(rags, "docs", 321).await;
        f.processes.set_alive(321, true);

        let started = rags.start("docs").await.unwrap();
        assert_eq!(
            started,
            Started {
                process_id: 321,
                already_running: true
            }
        );
    }

    async fn record_openai(f: &Fixture, pid: u32, port: u16) {
        f.settings
            .modify(|settings| {
                settings.insert(
                    openai::OPENAI_SERVER_LIST.to_string(),
                    json!([{"host": "0.0.0.0", "port": port, "pid": pid}]),
                );
                Ok(())
            })
            .await
            .unwrap();
    }

    async fn openai_list(f: &Fixture) -> serde_json::Value {
        let settings = f.settings.load().await.unwrap();
        settings[openai::OPENAI_SERVER_LIST].clone()
    }

    #[tokio::test]
    async fn test_openai_status_self_heals() {
        let f = fixture();
        assert!(!f.supervisor.openai.status().await.unwrap().is_running);

        record_openai(&f, 610, 8000).await;
        f.processes.set_alive(610, true);
        let status = f.supervisor.openai.status().await.unwrap();
        assert!(status.is_running);
        assert_eq!(status.server.unwrap().pid, 610);

        f.processes.set_alive(610, false);
        assert!(!f.supervisor.openai.status().await.unwrap().is_running);
        assert_eq!(openai_list(&f).await, json!([]));
    }

    #[tokio::test]
    async fn test_openai_start_reuses_live_server() {
        let f = fixture();
        record_openai(&f, 611, 8000).await;
        f.processes.set_alive(611, true);

        let started = f.supervisor.openai.start("", 8001).await.unwrap();
        assert_eq!(
            started,
            Started {
                process_id: 611,
                already_running: true
            }
        );
    }

    #[tokio::test]
    async fn test_openai_stop_terminates_and_clears() {
        let f = fixture();
        assert!(!f.supervisor.openai.stop().await.unwrap());

        record_openai(&f, 612, 8000).await;
        f.processes.set_alive(612, true);
        assert!(f.supervisor.openai.stop().await.unwrap());
        assert_eq!(f.processes.probe(612).unwrap(), ProcessState::Gone);
        assert_eq!(openai_list(&f).await, json!([]));
    }

    #[tokio::test]
    async fn test_openai_port_blocks_listening_start() {
        let f = fixture();
        record_openai(&f, 613, 8100).await;
        f.processes.set_alive(613, true);
        f.supervisor.rags.add("docs", rag(8100)).await.unwrap();

        let err = f.supervisor.rags.start("docs").await.unwrap_err();
        assert!(matches!(err, ToolboxError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_openai_spawn_failure_records_nothing() {
        let f = fixture();
        let err = f.supervisor.openai.start("127.0.0.1", 8000).await.unwrap_err();
        assert!(matches!(err, ToolboxError::ProcessSpawnFailure { .. }));
        assert_eq!(openai_list(&f).await, json!([]));
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_record_stopped() {
        let f = fixture();
        let rags = &f.supervisor.rags;
        rags.add("docs", rag(8100)).await.unwrap();

        let err = rags.start("docs").await.unwrap_err();
        assert!(matches!(err, ToolboxError::ProcessSpawnFailure { .. }));
        let stored = rags.get("docs").await.unwrap();
        assert_eq!(stored.status, ServiceStatus::Stopped);
        assert!(stored.process_id.is_none());
    }
}
