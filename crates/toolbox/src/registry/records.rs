//! Persisted row types.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Last known lifecycle state of a managed entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    #[default]
    Stopped,
    Running,
    /// Report-only; never persisted by the supervisor.
    Error,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Running => "running",
            ServiceStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of an entity table: status bookkeeping plus the entity's config,
/// flattened into the same JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord<C> {
    #[serde(default)]
    pub status: ServiceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<u32>,
    #[serde(flatten)]
    pub config: C,
}

impl<C> ServiceRecord<C> {
    /// A freshly added, stopped record.
    pub fn stopped(config: C) -> Self {
        Self {
            status: ServiceStatus::Stopped,
            process_id: None,
            config,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ServiceStatus::Running
    }

    pub fn mark_running(&mut self, pid: u32) {
        self.status = ServiceStatus::Running;
        self.process_id = Some(pid);
    }

    pub fn mark_stopped(&mut self) {
        self.status = ServiceStatus::Stopped;
        self.process_id = None;
    }
}

/// `name -> record` map; one per JSON document.
pub type Table<R> = BTreeMap<String, R>;

fn default_cpus_per_worker() -> f64 {
    0.001
}

fn default_num_workers() -> u32 {
    1
}

fn default_relevance() -> f64 {
    2.0
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_rag_port() -> u16 {
    8000
}

/// `"saas"` means "use the default backend".
fn normalize_infer_backend<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|backend| !backend.is_empty() && backend != "saas"))
}

/// Deployment parameters for a model worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub pretrained_model_type: String,
    #[serde(default = "default_cpus_per_worker")]
    pub cpus_per_worker: f64,
    #[serde(default)]
    pub gpus_per_worker: u32,
    #[serde(default = "default_num_workers")]
    pub num_workers: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_concurrency: Option<u32>,
    #[serde(default)]
    pub infer_params: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_path: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "normalize_infer_backend"
    )]
    pub infer_backend: Option<String>,
    /// Keys written by other tools; preserved on save.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Retrieval service settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RagConfig {
    pub model: String,
    pub tokenizer_path: String,
    pub doc_dir: String,
    #[serde(default = "default_relevance")]
    pub rag_doc_filter_relevance: f64,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_rag_port")]
    pub port: u16,
    #[serde(default)]
    pub required_exts: String,
    #[serde(default)]
    pub disable_inference_enhance: bool,
    #[serde(default)]
    pub inference_deep_thought: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// SQL engine installation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlServiceConfig {
    pub install_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

pub type ModelRecord = ServiceRecord<ModelConfig>;
pub type RagRecord = ServiceRecord<RagConfig>;
pub type SqlServiceRecord = ServiceRecord<SqlServiceConfig>;
