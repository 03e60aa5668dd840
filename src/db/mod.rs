use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::time::Duration;

pub mod queries;

pub type DbPool = Pool<Sqlite>;

pub async fn init_pool(database_path: &str) -> Result<DbPool> {
    let options = SqliteConnectOptions::new()
        .filename(database_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;

    migrate(&pool).await?;
    Ok(pool)
}

pub async fn migrate(pool: &DbPool) -> Result<()> {
    sqlx::query(queries::CREATE_ALERTS_TABLE).execute(pool).await?;
    sqlx::query(queries::CREATE_UNDELIVERED_INDEX)
        .execute(pool)
        .await?;
    Ok(())
}
