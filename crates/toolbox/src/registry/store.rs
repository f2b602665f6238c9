//! Lock-guarded JSON documents.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, error};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;

use super::records::Table;
use crate::error::{ToolboxError, ToolboxResult};
use crate::lock::{FileLockGuard, LockManager};

/// Read a document, `None` if it does not exist or is blank.
pub(crate) async fn read_document<T: DeserializeOwned>(path: &Path) -> ToolboxResult<Option<T>> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if content.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&content).map(Some).map_err(|e| {
        error!("Failed to parse {}: {}", path.display(), e);
        ToolboxError::from(e)
    })
}

/// Overwrite a document atomically: temp sibling, then rename.
pub(crate) async fn write_document<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> ToolboxResult<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).await?;
    }
    let body = serde_json::to_vec_pretty(value)?;

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(format!(".tmp-{}", std::process::id()));
    let tmp = PathBuf::from(tmp_name);

    fs::write(&tmp, &body).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    debug!("Wrote {} ({} bytes)", path.display(), body.len());
    Ok(())
}

/// One entity table persisted as a JSON object keyed by name.
#[derive(Debug)]
pub struct RecordStore<R> {
    path: PathBuf,
    locks: Arc<LockManager>,
    _record: PhantomData<fn() -> R>,
}

impl<R> Clone for RecordStore<R> {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            locks: self.locks.clone(),
            _record: PhantomData,
        }
    }
}

impl<R> RecordStore<R>
where
    R: Serialize + DeserializeOwned + Send,
{
    pub fn new(path: impl Into<PathBuf>, locks: Arc<LockManager>) -> Self {
        Self {
            path: path.into(),
            locks,
            _record: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the table. A missing document is an empty table.
    pub async fn load(&self) -> ToolboxResult<Table<R>> {
        let guard = self.locks.acquire(&self.path).await?;
        let table = read_document(&self.path).await;
        guard.release().await?;
        Ok(table?.unwrap_or_default())
    }

    /// Replace the whole table.
    pub async fn save(&self, table: &Table<R>) -> ToolboxResult<()> {
        let guard = self.locks.acquire(&self.path).await?;
        let result = write_document(&self.path, table).await;
        guard.release().await?;
        result
    }

    /// Load, mutate and save under a single lock acquisition.
    ///
    /// An error from `f` aborts without writing.
    pub async fn update<T, F>(&self, f: F) -> ToolboxResult<T>
    where
        F: FnOnce(&mut Table<R>) -> ToolboxResult<T>,
    {
        let mut txn = self.begin().await?;
        let value = f(txn.table_mut())?;
        txn.commit().await?;
        Ok(value)
    }

    /// Open a read-modify-write transaction holding the table lock.
    ///
    /// For mutations that need to await between reading and writing.
    pub async fn begin(&self) -> ToolboxResult<TableTxn<'_, R>> {
        let guard = self.locks.acquire(&self.path).await?;
        let table = read_document(&self.path).await?.unwrap_or_default();
        Ok(TableTxn {
            store: self,
            guard,
            table,
        })
    }
}

/// Locked table. Dropping without [`TableTxn::commit`] discards changes.
#[derive(Debug)]
pub struct TableTxn<'a, R> {
    store: &'a RecordStore<R>,
    guard: FileLockGuard,
    table: Table<R>,
}

impl<R> TableTxn<'_, R>
where
    R: Serialize + DeserializeOwned + Send,
{
    pub fn table(&self) -> &Table<R> {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut Table<R> {
        &mut self.table
    }

    pub async fn commit(self) -> ToolboxResult<()> {
        let result = write_document(&self.store.path, &self.table).await;
        self.guard.release().await?;
        result
    }

    pub async fn rollback(self) -> ToolboxResult<()> {
        self.guard.release().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RagConfig, RagRecord, ServiceStatus};
    use serde_json::json;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> RecordStore<RagRecord> {
        RecordStore::new(
            dir.path().join("rags.json"),
            Arc::new(LockManager::default()),
        )
    }

    fn rag(port: u16) -> RagRecord {
        let config: RagConfig = serde_json::from_value(json!({
            "model": "deepseek_chat",
            "tokenizer_path": "/tok",
            "doc_dir": "/docs",
            "port": port
        }))
        .unwrap();
        RagRecord::stopped(config)
    }

    #[tokio::test]
    async fn test_missing_document_loads_empty() {
        let dir = TempDir::new().unwrap();
        assert!(store(&dir).load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let mut table = Table::new();
        let mut running = rag(8001);
        running.mark_running(1234);
        table.insert("docs".to_string(), rag(8000));
        table.insert("docs2".to_string(), running);

        store.save(&table).await.unwrap();
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, table);

        store.save(&loaded).await.unwrap();
        assert_eq!(store.load().await.unwrap(), table);
        assert!(!crate::lock::marker_path(store.path()).exists());
    }

    #[tokio::test]
    async fn test_update_error_does_not_write() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store
            .update(|table| {
                table.insert("docs".to_string(), rag(8000));
                Ok(())
            })
            .await
            .unwrap();

        let result: ToolboxResult<()> = store
            .update(|table| {
                table.clear();
                Err(ToolboxError::conflict("nope"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(store.load().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_updates_do_not_lose_writes() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let mut tasks = Vec::new();
        for i in 0..16u16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .update(|table| {
                        table.insert(format!("rag-{i}"), rag(9000 + i));
                        Ok(())
                    })
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let table = store.load().await.unwrap();
        assert_eq!(table.len(), 16);
        assert!(table.values().all(|r| r.status == ServiceStatus::Stopped));
    }

    #[tokio::test]
    async fn test_dropped_txn_discards_changes() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        {
            let mut txn = store.begin().await.unwrap();
            txn.table_mut().insert("docs".to_string(), rag(8000));
        }
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_document_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        std::fs::write(store.path(), "{not json").unwrap();
        assert!(matches!(
            store.load().await.unwrap_err(),
            ToolboxError::Json(_)
        ));
        assert!(!crate::lock::marker_path(store.path()).exists());
    }
}
