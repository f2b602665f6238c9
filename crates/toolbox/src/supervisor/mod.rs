//! Process supervision for models, RAG services, SQL engines and the
//! OpenAI-compatible gateway.

mod launch;
mod logs;
mod openai;
mod process;
mod service;

pub use launch::{Invocation, Launch, LaunchSettings};
pub use logs::{LogChunk, LogStream, log_path, read_log};
pub use openai::{
    DEFAULT_OPENAI_HOST, DEFAULT_OPENAI_PORT, OPENAI_SERVER_LIST, OPENAI_SERVICE_NAME,
    OpenAiServer, OpenAiService, OpenAiStatus, recorded_servers,
};
pub use process::{
    OsProcessTable, ProcessState, ProcessTable, Signal, Termination, spawn_detached,
    terminate_tree,
};
pub use service::{
    ServiceConfig, ServiceKind, ServiceManager, Started, StatusReport, Supervisor,
    SupervisorOptions, validate_name,
};
