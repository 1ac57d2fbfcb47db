// Queue of events whose persist/projection step failed during a flush.

use crate::models::EventRecord;
use chrono::Utc;
use sqlx::{Pool, Row, Sqlite};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct FailedEvent {
    pub reference_key: String,
    pub event: EventRecord,
    pub error: String,
    pub attempts: i64,
}

/// Records a failure; a repeated failure of the same event bumps `attempts`.
pub async fn record(
    pool: &Pool<Sqlite>,
    environment: &str,
    event: &EventRecord,
    error: &str,
) -> Result<(), sqlx::Error> {
    let payload = serde_json::to_string(event).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

    sqlx::query(
        r#"
        INSERT INTO failed_event (reference_key, environment, payload, error, attempts, failed_at)
        VALUES (?, ?, ?, ?, 1, ?)
        ON CONFLICT(reference_key) DO UPDATE SET
            error = excluded.error,
            attempts = failed_event.attempts + 1,
            failed_at = excluded.failed_at
        "#,
    )
    .bind(event.reference_key(environment))
    .bind(environment)
    .bind(payload)
    .bind(error)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn list(pool: &Pool<Sqlite>, environment: &str) -> Result<Vec<FailedEvent>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT reference_key, payload, error, attempts FROM failed_event
         WHERE environment = ? ORDER BY failed_at ASC",
    )
    .bind(environment)
    .fetch_all(pool)
    .await?;

    let mut failed = Vec::with_capacity(rows.len());
    for row in rows {
        let reference_key: String = row.get("reference_key");
        match serde_json::from_str::<EventRecord>(row.get::<&str, _>("payload")) {
            Ok(event) => failed.push(FailedEvent {
                reference_key,
                event,
                error: row.get("error"),
                attempts: row.get("attempts"),
            }),
            Err(e) => warn!("Skipping unreadable failed event {}: {}", reference_key, e),
        }
    }

    Ok(failed)
}

pub async fn remove(pool: &Pool<Sqlite>, reference_key: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM failed_event WHERE reference_key = ?")
        .bind(reference_key)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::memory_pool;
    use chrono::DateTime;
    use serde_json::Map;

    fn event() -> EventRecord {
        EventRecord {
            event_name: "Transfer".to_string(),
            timestamp: DateTime::from_timestamp(1_650_000_000, 0).unwrap(),
            log_index: 1,
            transaction_index: 2,
            txhash: "0xfeed".to_string(),
            block_number: 300,
            address: "0xB97EF9Ef8734C71904D8002F8b6Bc66Dd9c48a6E".to_string(),
            args: Map::new(),
        }
    }

    #[tokio::test]
    async fn test_record_list_remove() {
        let pool = memory_pool().await.unwrap();
        record(&pool, "mainnet", &event(), "boom").await.unwrap();
        record(&pool, "mainnet", &event(), "boom again").await.unwrap();

        let failed = list(&pool, "mainnet").await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].reference_key, "mainnet-300-2-1");
        assert_eq!(failed[0].attempts, 2);
        assert_eq!(failed[0].error, "boom again");
        assert_eq!(failed[0].event, event());
        assert!(list(&pool, "testnet").await.unwrap().is_empty());

        remove(&pool, "mainnet-300-2-1").await.unwrap();
        assert!(list(&pool, "mainnet").await.unwrap().is_empty());
    }
}
