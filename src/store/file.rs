use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use super::{AlertStore, StoreError};
use crate::models::AlertRecord;

/// Fallback durable store: one JSON document per line.
///
/// Appends go straight to the end of the file. Updates rewrite the whole
/// file through a temporary sibling and a rename, so a crash mid-update
/// leaves either the old or the new contents.
pub struct JsonlAlertStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlAlertStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<Vec<AlertRecord>, StoreError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (line_no, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AlertRecord>(line) {
                Ok(record) => records.push(record),
                // A torn final line from a crash should not hide the rest.
                Err(e) => warn!("Skipping unreadable line {} in {:?}: {}", line_no + 1, self.path, e),
            }
        }
        Ok(records)
    }

    async fn rewrite(&self, records: &[AlertRecord]) -> Result<(), StoreError> {
        let mut contents = String::new();
        for record in records {
            contents.push_str(&serde_json::to_string(record)?);
            contents.push('\n');
        }

        let tmp = self.path.with_extension("tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(contents.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl AlertStore for JsonlAlertStore {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    async fn append(&self, record: &AlertRecord) -> Result<Uuid, StoreError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.lock.lock().await;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_all().await?;
        Ok(record.id)
    }

    async fn mark_delivered(
        &self,
        id: Uuid,
        endpoint: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().await;
        let mut records = self.load().await?;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StoreError::NotFound(id))?;

        if !record.mark_delivered(endpoint, at) {
            return Ok(false);
        }
        self.rewrite(&records).await?;
        Ok(true)
    }

    async fn increment_retry(&self, id: Uuid) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut records = self.load().await?;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StoreError::NotFound(id))?;

        if record.delivered {
            return Ok(());
        }
        record.retry_count = record.retry_count.saturating_add(1);
        self.rewrite(&records).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<AlertRecord>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.into_iter().find(|r| r.id == id))
    }

    async fn list_undelivered(&self) -> Result<Vec<AlertRecord>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self
            .load()
            .await?
            .into_iter()
            .filter(|r| !r.delivered)
            .collect())
    }
}
