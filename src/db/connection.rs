// SQLite connection pool setup; the schema is applied on every connect.

use crate::db::INIT_SCHEMA;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{migrate::MigrateDatabase, Pool, Sqlite, SqlitePool};
use std::str::FromStr;

pub async fn establish_connection(database_url: &str) -> Result<Pool<Sqlite>, sqlx::Error> {
    // Create database if it doesn't exist
    if !Sqlite::database_exists(database_url).await.unwrap_or(false) {
        Sqlite::create_database(database_url).await?;
    }

    let options = SqliteConnectOptions::from_str(database_url)?.foreign_keys(true);
    let pool = SqlitePool::connect_with(options).await?;

    // Enable WAL mode for better concurrency
    sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;

    sqlx::raw_sql(INIT_SCHEMA).execute(&pool).await?;

    Ok(pool)
}

/// Single-connection in-memory database with the full schema.
///
/// One connection only: every `sqlite::memory:` connection is its own database.
pub async fn memory_pool() -> Result<Pool<Sqlite>, sqlx::Error> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    sqlx::raw_sql(INIT_SCHEMA).execute(&pool).await?;

    Ok(pool)
}
