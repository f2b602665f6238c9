//! Toolbox Library
//!
//! Local operations console for model servers, RAG servers and SQL engines:
//! lock-guarded JSON registries, a process supervisor and an install pipeline.

pub mod api;
pub mod error;
pub mod install;
pub mod lock;
pub mod registry;
pub mod supervisor;

pub use error::{ToolboxError, ToolboxResult};
