//! Rendering entity configs into process invocations.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ToolboxError, ToolboxResult};
use crate::registry::{ModelConfig, RagConfig, SqlServiceConfig};

/// A fully rendered command line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// `--flag value`
    fn opt(self, flag: &str, value: impl ToString) -> Self {
        self.arg(flag).arg(value.to_string())
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg.replace('\'', "'\\''"))?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Programs used by the default renderers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchSettings {
    /// Model deployment CLI.
    pub model_binary: String,
    /// RAG server CLI.
    pub rag_binary: String,
    /// Start script relative to a SQL engine's install dir.
    pub sql_start_script: PathBuf,
    /// CLI serving the OpenAI-compatible endpoint.
    pub openai_binary: String,
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            model_binary: "byzerllm".to_string(),
            rag_binary: "auto-coder.rag".to_string(),
            sql_start_script: PathBuf::from("bin/byzer.sh"),
            openai_binary: "byzerllm".to_string(),
        }
    }
}

/// Turns an entity config into something the supervisor can spawn.
pub trait Launch {
    fn invocation(&self, name: &str, settings: &LaunchSettings) -> ToolboxResult<Invocation>;

    /// Port the entity listens on, if it is a listening entity.
    fn port(&self) -> Option<u16> {
        None
    }
}

/// `serve` against the local Ray cluster.
pub fn openai_invocation(settings: &LaunchSettings, host: &str, port: u16) -> Invocation {
    Invocation::new(&settings.openai_binary)
        .arg("serve")
        .opt("--ray_address", "auto")
        .opt("--host", host)
        .opt("--port", port)
}

/// String values go through verbatim; everything else as JSON.
fn param_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl Launch for ModelConfig {
    fn invocation(&self, name: &str, settings: &LaunchSettings) -> ToolboxResult<Invocation> {
        if self.pretrained_model_type.trim().is_empty() {
            return Err(ToolboxError::invalid(format!(
                "model {name} has no pretrained_model_type"
            )));
        }

        let mut inv = Invocation::new(&settings.model_binary)
            .arg("deploy")
            .opt("--pretrained_model_type", &self.pretrained_model_type)
            .opt("--cpus_per_worker", self.cpus_per_worker)
            .opt("--gpus_per_worker", self.gpus_per_worker)
            .opt("--num_workers", self.num_workers);
        if let Some(concurrency) = self.worker_concurrency.filter(|c| *c > 0) {
            inv = inv.opt("--worker_concurrency", concurrency);
        }
        if !self.infer_params.is_empty() {
            inv = inv.arg("--infer_params").with_args(
                self.infer_params
                    .iter()
                    .map(|(key, value)| format!("{key}={}", param_value(value))),
            );
        }
        inv = inv.opt("--model", name);
        if let Some(path) = &self.model_path {
            inv = inv.opt("--model_path", path);
        }
        if let Some(backend) = &self.infer_backend {
            inv = inv.opt("--infer_backend", backend);
        }
        Ok(inv)
    }
}

impl Launch for RagConfig {
    fn invocation(&self, _name: &str, settings: &LaunchSettings) -> ToolboxResult<Invocation> {
        for (field, value) in [
            ("model", &self.model),
            ("tokenizer_path", &self.tokenizer_path),
            ("doc_dir", &self.doc_dir),
        ] {
            if value.trim().is_empty() {
                return Err(ToolboxError::invalid(format!("RAG {field} is required")));
            }
        }
        let host = if self.host.is_empty() {
            "0.0.0.0"
        } else {
            self.host.as_str()
        };

        // The server takes the relevance threshold as an integer.
        let relevance = self.rag_doc_filter_relevance.trunc() as i64;
        let mut inv = Invocation::new(&settings.rag_binary)
            .arg("serve")
            .opt("--model", &self.model)
            .opt("--tokenizer_path", &self.tokenizer_path)
            .opt("--doc_dir", &self.doc_dir)
            .opt("--rag_doc_filter_relevance", relevance)
            .opt("--host", host)
            .opt("--port", self.port);
        if !self.required_exts.is_empty() {
            inv = inv.opt("--required_exts", &self.required_exts);
        }
        if self.disable_inference_enhance {
            inv = inv.arg("--disable_inference_enhance");
        }
        if self.inference_deep_thought {
            inv = inv.arg("--inference_deep_thought");
        }
        Ok(inv)
    }

    fn port(&self) -> Option<u16> {
        Some(self.port)
    }
}

impl Launch for SqlServiceConfig {
    fn invocation(&self, name: &str, settings: &LaunchSettings) -> ToolboxResult<Invocation> {
        let script = self.install_dir.join(&settings.sql_start_script);
        if !script.is_file() {
            return Err(ToolboxError::invalid(format!(
                "invalid installation directory for {name}: missing {}",
                script.display()
            )));
        }
        Ok(Invocation::new(script.to_string_lossy())
            .arg("start")
            .current_dir(&self.install_dir))
    }

    fn port(&self) -> Option<u16> {
        self.port
    }
}
