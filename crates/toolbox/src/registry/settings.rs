//! The free-form `config.json` document shown in the console's settings page.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;
use serde_json::{Map, Value, json};

use super::store::{read_document, write_document};
use crate::error::{ToolboxError, ToolboxResult};
use crate::lock::LockManager;

/// Top-level keys every loaded document is guaranteed to have.
pub fn default_settings() -> Map<String, Value> {
    let defaults = json!({
        "saasBaseUrls": [
            {"value": "https://api.siliconflow.cn/v1", "label": "SiliconFlow"},
            {"value": "https://api.deepseek.com/beta", "label": "DeepSeek"},
            {"value": "https://dashscope.aliyuncs.com/compatible-mode/v1", "label": "Qwen"},
            {"value": "https://api.moonshot.cn/v1", "label": "Kimi"}
        ],
        "pretrainedModelTypes": [
            {"value": "saas/openai", "label": "OpenAI compatible"},
            {"value": "saas/qianwen", "label": "Qwen"},
            {"value": "saas/qianwen_vl", "label": "Qwen VL"},
            {"value": "saas/claude", "label": "Claude"}
        ],
        "openaiServerList": [],
        "commons": []
    });
    match defaults {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn merge_defaults(mut settings: Map<String, Value>) -> Map<String, Value> {
    for (key, value) in default_settings() {
        settings.entry(key).or_insert(value);
    }
    settings
}

#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
    locks: Arc<LockManager>,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>, locks: Arc<LockManager>) -> Self {
        Self {
            path: path.into(),
            locks,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored document with missing defaults filled in.
    pub async fn load(&self) -> ToolboxResult<Map<String, Value>> {
        let guard = self.locks.acquire(&self.path).await?;
        let stored = read_document::<Map<String, Value>>(&self.path).await;
        guard.release().await?;
        Ok(merge_defaults(stored?.unwrap_or_default()))
    }

    /// Extend list-valued keys that already exist; insert the rest.
    pub async fn add_items(&self, items: Map<String, Value>) -> ToolboxResult<()> {
        self.modify(|settings| {
            for (key, value) in items {
                match (settings.get_mut(&key), value) {
                    (Some(Value::Array(existing)), Value::Array(new_items)) => {
                        existing.extend(new_items);
                    }
                    (Some(_), _) => {
                        return Err(ToolboxError::invalid(format!(
                            "{key} already exists and is not a list"
                        )));
                    }
                    (None, value) => {
                        settings.insert(key, value);
                    }
                }
            }
            Ok(())
        })
        .await
    }

    /// Replace items of `key` whose `value` matches an incoming item; append
    /// the others.
    pub async fn update_items(&self, key: &str, items: Value) -> ToolboxResult<()> {
        let Value::Array(items) = items else {
            return Err(ToolboxError::invalid(format!("{key} must be a list")));
        };
        self.modify(|settings| {
            let Some(existing) = settings.get_mut(key) else {
                return Err(ToolboxError::not_found(format!("configuration item {key}")));
            };
            let Value::Array(existing) = existing else {
                return Err(ToolboxError::invalid(format!("{key} is not a list")));
            };
            for item in items {
                let slot = existing
                    .iter_mut()
                    .find(|current| current.get("value") == item.get("value"));
                match slot {
                    Some(current) if item.get("value").is_some() => *current = item,
                    _ => existing.push(item),
                }
            }
            Ok(())
        })
        .await
    }

    pub async fn delete_key(&self, key: &str) -> ToolboxResult<()> {
        self.modify(|settings| {
            settings
                .remove(key)
                .map(|_| ())
                .ok_or_else(|| ToolboxError::not_found(format!("configuration item {key}")))
        })
        .await?;
        info!("Removed configuration item {}", key);
        Ok(())
    }

    /// Read-modify-write the whole document under its lock. Nothing is
    /// written when `f` fails.
    pub async fn modify<T, F>(&self, f: F) -> ToolboxResult<T>
    where
        F: FnOnce(&mut Map<String, Value>) -> ToolboxResult<T>,
    {
        let guard = self.locks.acquire(&self.path).await?;
        let result = async {
            let stored = read_document::<Map<String, Value>>(&self.path).await?;
            let mut settings = merge_defaults(stored.unwrap_or_default());
            let value = f(&mut settings)?;
            write_document(&self.path, &settings).await?;
            Ok(value)
        }
        .await;
        guard.release().await?;
        result
    }
}
