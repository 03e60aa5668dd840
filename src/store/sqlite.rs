use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use super::{AlertStore, StoreError};
use crate::db::{queries, DbPool};
use crate::models::{AlertRecord, Location};

/// Primary durable store backed by a local SQLite file.
#[derive(Clone)]
pub struct SqliteAlertStore {
    pool: DbPool,
}

impl SqliteAlertStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn exists(&self, id: Uuid) -> Result<bool, StoreError> {
        let row = sqlx::query(queries::SELECT_ALERT)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

fn record_from_row(row: &SqliteRow) -> Result<AlertRecord, StoreError> {
    let raw_id: String = row.try_get("alert_id")?;
    let id = Uuid::parse_str(&raw_id)
        .map_err(|e| StoreError::Corrupt(format!("alert_id '{}': {}", raw_id, e)))?;

    let raw_situation: String = row.try_get("situation")?;
    let situation = raw_situation
        .parse()
        .map_err(|e| StoreError::Corrupt(format!("alert {}: {}", id, e)))?;

    let lat: Option<f64> = row.try_get("lat")?;
    let lon: Option<f64> = row.try_get("lon")?;
    let accuracy: Option<f64> = row.try_get("accuracy_m")?;
    let captured_at: Option<DateTime<Utc>> = row.try_get("captured_at")?;
    let location = match (lat, lon, accuracy, captured_at) {
        (Some(lat), Some(lon), Some(accuracy_meters), Some(captured_at)) => Some(Location {
            lat,
            lon,
            accuracy_meters,
            captured_at,
        }),
        _ => None,
    };

    let retry_count: i64 = row.try_get("retry_count")?;

    Ok(AlertRecord {
        id,
        name: row.try_get("name")?,
        situation,
        message: row.try_get("message")?,
        location,
        created_at: row.try_get("created_at")?,
        delivered: row.try_get("delivered")?,
        delivered_at: row.try_get("delivered_at")?,
        delivered_via: row.try_get("delivered_via")?,
        retry_count: u32::try_from(retry_count).unwrap_or(u32::MAX),
    })
}

#[async_trait]
impl AlertStore for SqliteAlertStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn append(&self, record: &AlertRecord) -> Result<Uuid, StoreError> {
        let result = sqlx::query(queries::INSERT_ALERT)
            .bind(record.id.to_string())
            .bind(&record.name)
            .bind(record.situation.as_str())
            .bind(&record.message)
            .bind(record.location.map(|l| l.lat))
            .bind(record.location.map(|l| l.lon))
            .bind(record.location.map(|l| l.accuracy_meters))
            .bind(record.location.map(|l| l.captured_at))
            .bind(record.created_at)
            .bind(record.delivered)
            .bind(record.delivered_at)
            .bind(record.delivered_via.as_deref())
            .bind(i64::from(record.retry_count))
            .execute(&self.pool)
            .await?;

        debug!("Stored alert {} as row {}", record.id, result.last_insert_rowid());
        Ok(record.id)
    }

    async fn mark_delivered(
        &self,
        id: Uuid,
        endpoint: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(queries::MARK_DELIVERED)
            .bind(id.to_string())
            .bind(at)
            .bind(endpoint)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        if self.exists(id).await? {
            Ok(false)
        } else {
            Err(StoreError::NotFound(id))
        }
    }

    async fn increment_retry(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(queries::INCREMENT_RETRY)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 && !self.exists(id).await? {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<AlertRecord>, StoreError> {
        let row = sqlx::query(queries::SELECT_ALERT)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn list_undelivered(&self) -> Result<Vec<AlertRecord>, StoreError> {
        let rows = sqlx::query(queries::SELECT_UNDELIVERED)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::Situation;
    use chrono::SubsecRound;

    async fn open(dir: &tempfile::TempDir) -> SqliteAlertStore {
        let path = dir.path().join("alerts.db");
        let pool = db::init_pool(path.to_str().unwrap()).await.unwrap();
        SqliteAlertStore::new(pool)
    }

    fn located_record() -> AlertRecord {
        let location = Location {
            lat: -23.5505,
            lon: -46.6333,
            accuracy_meters: 4.2,
            captured_at: Utc::now().trunc_subsecs(3),
        };
        AlertRecord::new("Maria", Situation::VerbalThreat, "outside the door", Some(location))
    }

    #[tokio::test]
    async fn appended_record_lists_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;

        let with_location = located_record();
        let without_location = AlertRecord::new("", Situation::Other, "", None);
        store.append(&with_location).await.unwrap();
        store.append(&without_location).await.unwrap();

        let pending = store.list_undelivered().await.unwrap();
        assert_eq!(pending, vec![with_location, without_location]);
    }

    #[tokio::test]
    async fn mark_delivered_twice_is_identical_to_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;
        let record = located_record();
        store.append(&record).await.unwrap();

        let at = Utc::now().trunc_subsecs(3);
        assert!(store.mark_delivered(record.id, "http://one", at).await.unwrap());
        let once = store.get(record.id).await.unwrap().unwrap();

        assert!(!store
            .mark_delivered(record.id, "http://two", Utc::now())
            .await
            .unwrap());
        let twice = store.get(record.id).await.unwrap().unwrap();

        assert_eq!(once, twice);
        assert!(twice.delivered);
        assert_eq!(twice.delivered_via.as_deref(), Some("http://one"));
        assert_eq!(twice.delivered_at, Some(at));
        assert!(store.list_undelivered().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn records_survive_reopening_the_database() {
        let dir = tempfile::tempdir().unwrap();
        let record = located_record();
        {
            let store = open(&dir).await;
            store.append(&record).await.unwrap();
            store.pool.close().await;
        }

        let reopened = open(&dir).await;
        assert_eq!(reopened.list_undelivered().await.unwrap(), vec![record]);
    }

    #[tokio::test]
    async fn concurrent_appends_keep_every_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;

        let records: Vec<_> = (0..10)
            .map(|i| AlertRecord::new(&format!("r{}", i), Situation::Other, "", None))
            .collect();
        let appends = records.iter().map(|r| store.append(r));
        for result in futures::future::join_all(appends).await {
            result.unwrap();
        }

        assert_eq!(store.list_undelivered().await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn retry_counter_and_unknown_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;
        let record = located_record();
        store.append(&record).await.unwrap();

        store.increment_retry(record.id).await.unwrap();
        store.increment_retry(record.id).await.unwrap();
        assert_eq!(store.get(record.id).await.unwrap().unwrap().retry_count, 2);

        let missing = Uuid::new_v4();
        assert!(matches!(
            store.increment_retry(missing).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.mark_delivered(missing, "http://x", Utc::now()).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
