//! The OpenAI-compatible gateway.
//!
//! At most one `serve` process, recorded in `config.json` under
//! `openaiServerList` rather than in an entity table. Start and stop hold the
//! ports lock, so they are serialized with each other and with every other
//! listening start.

use std::sync::Arc;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::launch;
use super::logs::{self, LogStream};
use super::process::{self, ProcessState};
use super::service::{ServiceKind, Shared, Started};
use crate::error::{ToolboxError, ToolboxResult};

/// Settings key holding the recorded servers.
pub const OPENAI_SERVER_LIST: &str = "openaiServerList";

/// Log file stem for the gateway.
pub const OPENAI_SERVICE_NAME: &str = "openai_compatible_service";

pub const DEFAULT_OPENAI_HOST: &str = "0.0.0.0";
pub const DEFAULT_OPENAI_PORT: u16 = 8000;

/// One entry of `openaiServerList`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenAiServer {
    pub host: String,
    pub port: u16,
    pub pid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenAiStatus {
    pub is_running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<OpenAiServer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OpenAiStatus {
    fn stopped() -> Self {
        Self {
            is_running: false,
            server: None,
            error: None,
        }
    }
}

/// Parseable entries of the server list. Anything else in the list is
/// ignored.
pub fn recorded_servers(settings: &Map<String, Value>) -> Vec<OpenAiServer> {
    settings
        .get(OPENAI_SERVER_LIST)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

fn label() -> &'static str {
    ServiceKind::OpenAiService.label()
}

#[derive(Debug)]
pub struct OpenAiService {
    shared: Arc<Shared>,
}

impl OpenAiService {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Spawn the gateway unless a recorded one is still alive.
    pub async fn start(&self, host: &str, port: u16) -> ToolboxResult<Started> {
        let host = match host.trim() {
            "" => DEFAULT_OPENAI_HOST,
            host => host,
        };
        let guard = self.shared.locks.acquire(&self.shared.ports_resource).await?;
        let result = self.check_and_spawn(host, port).await;
        guard.release().await?;
        result.inspect_err(|e| error!("{} start failed: {}", label(), e))
    }

    async fn check_and_spawn(&self, host: &str, port: u16) -> ToolboxResult<Started> {
        let settings = self.shared.settings.load().await?;
        if let Some(server) = recorded_servers(&settings)
            .into_iter()
            .find(|server| self.shared.is_alive(Some(server.pid)))
        {
            debug!("{} already running with PID {}", label(), server.pid);
            return Ok(Started {
                process_id: server.pid,
                already_running: true,
            });
        }
        self.shared
            .ensure_port_free(ServiceKind::OpenAiService, OPENAI_SERVICE_NAME, port)
            .await?;

        let invocation = launch::openai_invocation(&self.shared.options.launch, host, port);
        info!("Starting {}: {}", label(), invocation);
        let log_dir = &self.shared.options.log_dir;
        let pid = process::spawn_detached(
            OPENAI_SERVICE_NAME,
            &invocation,
            &logs::log_path(log_dir, OPENAI_SERVICE_NAME, LogStream::Out),
            &logs::log_path(log_dir, OPENAI_SERVICE_NAME, LogStream::Err),
        )?;

        let entry = serde_json::to_value(OpenAiServer {
            host: host.to_string(),
            port,
            pid,
        })?;
        let recorded = self
            .shared
            .settings
            .modify(|settings| {
                // Dead entries are replaced, not accumulated.
                settings.insert(OPENAI_SERVER_LIST.to_string(), Value::Array(vec![entry]));
                Ok(())
            })
            .await;
        if let Err(e) = recorded {
            warn!("Could not record PID {} for {}; terminating it", pid, label());
            let _ = process::terminate_tree(
                self.shared.processes.clone(),
                OPENAI_SERVICE_NAME,
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

    /// Terminate every recorded server tree and clear the list.
    ///
    /// Returns false when nothing was recorded. The list is cleared even if a
    /// termination fails; the first failure is still returned.
    pub async fn stop(&self) -> ToolboxResult<bool> {
        let guard = self.shared.locks.acquire(&self.shared.ports_resource).await?;
        let result = self.stop_recorded().await;
        guard.release().await?;
        result.inspect_err(|e| error!("{} stop failed: {}", label(), e))
    }

    async fn stop_recorded(&self) -> ToolboxResult<bool> {
        let settings = self.shared.settings.load().await?;
        let listed = settings
            .get(OPENAI_SERVER_LIST)
            .and_then(Value::as_array)
            .is_some_and(|items| !items.is_empty());
        if !listed {
            return Ok(false);
        }

        let mut failure: Option<ToolboxError> = None;
        for server in recorded_servers(&settings) {
            let outcome = process::terminate_tree(
                self.shared.processes.clone(),
                OPENAI_SERVICE_NAME,
                server.pid,
                self.shared.options.grace_period,
            )
            .await;
            match outcome {
                Ok(termination) => debug!("{} PID {}: {:?}", label(), server.pid, termination),
                Err(e) => {
                    warn!("{} PID {} survived termination: {}", label(), server.pid, e);
                    failure.get_or_insert(e);
                }
            }
        }

        self.shared
            .settings
            .modify(|settings| {
                settings.insert(OPENAI_SERVER_LIST.to_string(), Value::Array(Vec::new()));
                Ok(())
            })
            .await?;
        match failure {
            Some(e) => Err(e),
            None => {
                info!("{} stopped", label());
                Ok(true)
            }
        }
    }

    /// Probe the first recorded server; clear the list if it is gone.
    pub async fn status(&self) -> ToolboxResult<OpenAiStatus> {
        let settings = self.shared.settings.load().await?;
        let Some(server) = recorded_servers(&settings).into_iter().next() else {
            return Ok(OpenAiStatus::stopped());
        };

        match self.shared.processes.probe(server.pid) {
            Ok(ProcessState::Alive) => Ok(OpenAiStatus {
                is_running: true,
                server: Some(server),
                error: None,
            }),
            Ok(ProcessState::Gone) => {
                info!("{} (PID {}) is no longer running", label(), server.pid);
                self.shared
                    .settings
                    .modify(|settings| {
                        // A restart in the meantime recorded a different server.
                        if recorded_servers(settings).first() == Some(&server) {
                            settings
                                .insert(OPENAI_SERVER_LIST.to_string(), Value::Array(Vec::new()));
                        }
                        Ok(())
                    })
                    .await?;
                Ok(OpenAiStatus::stopped())
            }
            Err(e) => {
                warn!("Status probe for {} failed: {}", label(), e);
                Ok(OpenAiStatus {
                    is_running: false,
                    server: Some(server),
                    error: Some(e.to_string()),
                })
            }
        }
    }
}
