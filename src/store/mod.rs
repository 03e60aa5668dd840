//! Durable local queue of alerts not yet confirmed delivered.
//!
//! Records are written to the SQLite store first. When it cannot take a
//! write, the JSON-lines file store is used instead. [`FallbackStore`]
//! composes the tiers and is what the dispatcher holds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::models::AlertRecord;

pub mod file;
pub mod sqlite;

pub use file::JsonlAlertStore;
pub use sqlite::SqliteAlertStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("alert {0} not found")]
    NotFound(Uuid),
    #[error("no durable storage available: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Persists a new record and returns its id.
    async fn append(&self, record: &AlertRecord) -> Result<Uuid, StoreError>;

    /// Flips `delivered` to true. Returns `Ok(false)` when the record was
    /// already delivered, so repeated calls are harmless.
    async fn mark_delivered(
        &self,
        id: Uuid,
        endpoint: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Counts a failed retry. No-op on delivered records.
    async fn increment_retry(&self, id: Uuid) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<AlertRecord>, StoreError>;

    /// Undelivered records in creation order.
    async fn list_undelivered(&self) -> Result<Vec<AlertRecord>, StoreError>;
}

/// Tries each tier in order. Writes land in the first tier that accepts
/// them; reads merge every tier that answers.
pub struct FallbackStore {
    tiers: Vec<Arc<dyn AlertStore>>,
}

impl FallbackStore {
    pub fn new(primary: Arc<dyn AlertStore>, fallback: Arc<dyn AlertStore>) -> Self {
        Self {
            tiers: vec![primary, fallback],
        }
    }
}

#[async_trait]
impl AlertStore for FallbackStore {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn append(&self, record: &AlertRecord) -> Result<Uuid, StoreError> {
        let mut failures = Vec::new();
        for tier in &self.tiers {
            match tier.append(record).await {
                Ok(id) => {
                    if !failures.is_empty() {
                        warn!("Alert {} stored in {} store after: {}", id, tier.name(), failures.join("; "));
                    }
                    return Ok(id);
                }
                Err(e) => {
                    warn!("{} store rejected alert {}: {}", tier.name(), record.id, e);
                    failures.push(format!("{}: {}", tier.name(), e));
                }
            }
        }
        Err(StoreError::Unavailable(failures.join("; ")))
    }

    async fn mark_delivered(
        &self,
        id: Uuid,
        endpoint: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut last_error = None;
        for tier in &self.tiers {
            match tier.mark_delivered(id, endpoint, at).await {
                Ok(changed) => return Ok(changed),
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => {
                    warn!("{} store could not mark {} delivered: {}", tier.name(), id, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(StoreError::NotFound(id)))
    }

    async fn increment_retry(&self, id: Uuid) -> Result<(), StoreError> {
        let mut last_error = None;
        for tier in &self.tiers {
            match tier.increment_retry(id).await {
                Ok(()) => return Ok(()),
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or(StoreError::NotFound(id)))
    }

    async fn get(&self, id: Uuid) -> Result<Option<AlertRecord>, StoreError> {
        let mut last_error = None;
        for tier in &self.tiers {
            match tier.get(id).await {
                Ok(Some(record)) => return Ok(Some(record)),
                Ok(None) => continue,
                Err(e) => last_error = Some(e),
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    async fn list_undelivered(&self) -> Result<Vec<AlertRecord>, StoreError> {
        let mut merged = Vec::new();
        let mut seen = HashSet::new();
        let mut answered = false;
        let mut last_error = None;

        for tier in &self.tiers {
            match tier.list_undelivered().await {
                Ok(records) => {
                    answered = true;
                    merged.extend(records.into_iter().filter(|r| seen.insert(r.id)));
                }
                Err(e) => {
                    warn!("{} store could not list pending alerts: {}", tier.name(), e);
                    last_error = Some(e);
                }
            }
        }

        if !answered {
            if let Some(e) = last_error {
                return Err(e);
            }
        }
        // Stable sort keeps each tier's own order for equal timestamps.
        merged.sort_by_key(|r| r.created_at);
        Ok(merged)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A store whose every operation fails, standing in for a broken disk.
    pub struct BrokenStore;

    #[async_trait]
    impl AlertStore for BrokenStore {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn append(&self, _record: &AlertRecord) -> Result<Uuid, StoreError> {
            Err(StoreError::Unavailable("disk gone".into()))
        }

        async fn mark_delivered(
            &self,
            _id: Uuid,
            _endpoint: &str,
            _at: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("disk gone".into()))
        }

        async fn increment_retry(&self, _id: Uuid) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("disk gone".into()))
        }

        async fn get(&self, _id: Uuid) -> Result<Option<AlertRecord>, StoreError> {
            Err(StoreError::Unavailable("disk gone".into()))
        }

        async fn list_undelivered(&self) -> Result<Vec<AlertRecord>, StoreError> {
            Err(StoreError::Unavailable("disk gone".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::BrokenStore;
    use super::*;
    use crate::models::Situation;

    fn jsonl(dir: &tempfile::TempDir) -> Arc<dyn AlertStore> {
        Arc::new(JsonlAlertStore::new(dir.path().join("pending.jsonl")))
    }

    #[tokio::test]
    async fn falls_back_when_primary_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let secondary = jsonl(&dir);
        let store = FallbackStore::new(Arc::new(BrokenStore), secondary.clone());

        let record = AlertRecord::new("Ana", Situation::Stalking, "", None);
        let id = store.append(&record).await.unwrap();

        assert_eq!(id, record.id);
        assert_eq!(secondary.list_undelivered().await.unwrap(), vec![record.clone()]);
        assert_eq!(store.list_undelivered().await.unwrap(), vec![record.clone()]);

        assert!(store.mark_delivered(id, "http://a", Utc::now()).await.unwrap());
        assert!(!store.mark_delivered(id, "http://a", Utc::now()).await.unwrap());
        assert!(store.list_undelivered().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn append_fails_only_when_every_tier_fails() {
        let store = FallbackStore::new(Arc::new(BrokenStore), Arc::new(BrokenStore));
        let record = AlertRecord::new("", Situation::Other, "", None);

        match store.append(&record).await {
            Err(StoreError::Unavailable(reason)) => assert!(reason.contains("broken")),
            other => panic!("expected Unavailable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn listing_merges_tiers_in_creation_order() {
        let dir = tempfile::tempdir().unwrap();
        let first = Arc::new(JsonlAlertStore::new(dir.path().join("a.jsonl")));
        let second = Arc::new(JsonlAlertStore::new(dir.path().join("b.jsonl")));

        let mut older = AlertRecord::new("old", Situation::Other, "", None);
        older.created_at -= chrono::Duration::seconds(10);
        let newer = AlertRecord::new("new", Situation::Other, "", None);

        first.append(&newer).await.unwrap();
        second.append(&older).await.unwrap();

        let store = FallbackStore::new(first, second);
        let names: Vec<_> = store
            .list_undelivered()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["old", "new"]);
    }

    #[tokio::test]
    async fn marking_an_unknown_id_reports_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FallbackStore::new(jsonl(&dir), jsonl(&dir));
        let missing = Uuid::new_v4();

        assert!(matches!(
            store.mark_delivered(missing, "http://a", Utc::now()).await,
            Err(StoreError::NotFound(id)) if id == missing
        ));
    }
}
