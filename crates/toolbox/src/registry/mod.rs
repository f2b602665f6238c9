//! JSON-backed entity tables guarded by the advisory lock.

mod records;
mod settings;
mod store;

use std::path::{Path, PathBuf};

pub use records::{
    ModelConfig, ModelRecord, RagConfig, RagRecord, ServiceRecord, ServiceStatus,
    SqlServiceConfig, SqlServiceRecord, Table,
};
pub use settings::{SettingsStore, default_settings};
pub use store::{RecordStore, TableTxn};

/// Persisted document classes and their file names in the data directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityClass {
    Models,
    Rags,
    SqlServices,
    Config,
    Users,
}

impl EntityClass {
    pub const ALL: [EntityClass; 5] = [
        EntityClass::Models,
        EntityClass::Rags,
        EntityClass::SqlServices,
        EntityClass::Config,
        EntityClass::Users,
    ];

    pub fn file_name(&self) -> &'static str {
        match self {
            EntityClass::Models => "models.json",
            EntityClass::Rags => "rags.json",
            EntityClass::SqlServices => "byzer_sql.json",
            EntityClass::Config => "config.json",
            EntityClass::Users => "users.json",
        }
    }

    pub fn path_in(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(self.file_name())
    }

    /// Match a document by file name or by its stem (`rags`, `byzer_sql`).
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|class| {
            let file = class.file_name();
            name == file || Some(name) == file.strip_suffix(".json")
        })
    }
}
