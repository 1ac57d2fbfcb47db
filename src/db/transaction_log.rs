use crate::models::TransactionLog;
use serde_json::Value;
use sqlx::{Pool, QueryBuilder, Row, Sqlite, SqliteConnection};
use std::collections::HashSet;

// Keeps IN (...) lists well below SQLite's bound-parameter limit.
const KEY_BATCH_SIZE: usize = 500;

/// Returns the subset of `keys` that already have a persisted log row.
pub async fn existing_reference_keys(
    pool: &Pool<Sqlite>,
    keys: &[String],
) -> Result<HashSet<String>, sqlx::Error> {
    let mut existing = HashSet::new();

    for chunk in keys.chunks(KEY_BATCH_SIZE) {
        let mut builder =
            QueryBuilder::<Sqlite>::new("SELECT reference_key FROM transaction_log WHERE reference_key IN (");
        let mut separated = builder.separated(", ");
        for key in chunk {
            separated.push_bind(key.as_str());
        }
        separated.push_unseparated(")");

        let rows = builder.build().fetch_all(pool).await?;
        existing.extend(rows.iter().map(|row| row.get::<String, _>("reference_key")));
    }

    Ok(existing)
}

/// Inserts one log row. Returns `false` when a row with the same reference key
/// or `(txn, contract, log_index)` already exists.
pub async fn insert_log(
    conn: &mut SqliteConnection,
    txn_id: i64,
    contract_id: i64,
    event_name_id: i64,
    log_index: u64,
    data: &Value,
    reference_key: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO transaction_log
        (txn_id, contract_id, event_name_id, log_index, data, reference_key)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(txn_id)
    .bind(contract_id)
    .bind(event_name_id)
    .bind(log_index as i64)
    .bind(data.to_string())
    .bind(reference_key)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Highest block with a persisted log for `addresses` on `environment`.
pub async fn max_block_number(
    pool: &Pool<Sqlite>,
    environment: &str,
    addresses: &[String],
) -> Result<Option<u64>, sqlx::Error> {
    if addresses.is_empty() {
        return Ok(None);
    }

    let mut builder = QueryBuilder::<Sqlite>::new(
        r#"SELECT MAX(b.block_number) AS max_block_number
           FROM transaction_log tl
           JOIN txn t ON tl.txn_id = t.id
           JOIN block b ON t.block_id = b.id
           JOIN environment e ON b.environment_id = e.id
           JOIN contract c ON tl.contract_id = c.id
           WHERE e.environment = "#,
    );
    builder.push_bind(environment);
    builder.push(" AND c.address IN (");
    let mut separated = builder.separated(", ");
    for address in addresses {
        separated.push_bind(address.as_str());
    }
    separated.push_unseparated(")");

    let row = builder.build().fetch_one(pool).await?;
    let max: Option<i64> = row.get("max_block_number");

    Ok(max.map(|block| block as u64))
}

pub async fn get_logs(
    pool: &Pool<Sqlite>,
    environment: &str,
    address: &str,
) -> Result<Vec<TransactionLog>, sqlx::Error> {
    let rows = sqlx::query(
        r#"SELECT tl.reference_key, e.environment, c.address, n.event_name,
                  b.block_number, b.timestamp, t.hash, t.idx, tl.log_index, tl.data
           FROM transaction_log tl
           JOIN txn t ON tl.txn_id = t.id
           JOIN block b ON t.block_id = b.id
           JOIN environment e ON b.environment_id = e.id
           JOIN contract c ON tl.contract_id = c.id
           JOIN event_name n ON tl.event_name_id = n.id
           WHERE e.environment = ? AND c.address = ?
           ORDER BY b.block_number ASC, t.idx ASC, tl.log_index ASC"#,
    )
    .bind(environment)
    .bind(address)
    .fetch_all(pool)
    .await?;

    let logs = rows
        .iter()
        .map(|row| TransactionLog {
            reference_key: row.get("reference_key"),
            environment: row.get("environment"),
            contract_address: row.get("address"),
            event_name: row.get("event_name"),
            block_number: row.get("block_number"),
            block_timestamp: row.get("timestamp"),
            txhash: row.get("hash"),
            transaction_index: row.get("idx"),
            log_index: row.get("log_index"),
            data: serde_json::from_str(row.get::<&str, _>("data")).unwrap_or(Value::Null),
        })
        .collect();

    Ok(logs)
}

pub async fn count_logs(pool: &Pool<Sqlite>) -> Result<i64, sqlx::Error> {
    let count = sqlx::query("SELECT COUNT(*) FROM transaction_log")
        .fetch_one(pool)
        .await?
        .get::<i64, _>(0);

    Ok(count)
}

/// Deletes the logs of the given contract rows.
pub async fn delete_logs_for_contracts(
    pool: &Pool<Sqlite>,
    contract_ids: &[i64],
) -> Result<u64, sqlx::Error> {
    if contract_ids.is_empty() {
        return Ok(0);
    }

    let mut builder = QueryBuilder::<Sqlite>::new("DELETE FROM transaction_log WHERE contract_id IN (");
    let mut separated = builder.separated(", ");
    for id in contract_ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(")");

    let result = builder.build().execute(pool).await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::memory_pool;
    use crate::db::entities;
    use serde_json::json;

    const TOKEN: &str = "0xB97EF9Ef8734C71904D8002F8b6Bc66Dd9c48a6E";

    async fn seed(pool: &Pool<Sqlite>, environment: &str, block: u64, log_index: u64) -> bool {
        let mut conn = pool.acquire().await.unwrap();
        let env = entities::environment_id(&mut conn, environment).await.unwrap();
        let block_id = entities::block_id(&mut conn, env, block, 0).await.unwrap();
        let txn = entities::txn_id(&mut conn, block_id, &format!("0x{:x}", block), 0)
            .await
            .unwrap();
        let name = entities::event_name_id(&mut conn, "Transfer").await.unwrap();
        let contract = entities::contract_id(&mut conn, TOKEN, env).await.unwrap();
        let key = crate::models::reference_key(environment, block, 0, log_index);
        insert_log(&mut conn, txn, contract, name, log_index, &json!({"value": "1"}), &key)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_replayed_log_is_not_duplicated() {
        let pool = memory_pool().await.unwrap();
        assert!(seed(&pool, "mainnet", 10, 0).await);
        assert!(!seed(&pool, "mainnet", 10, 0).await);
        assert_eq!(count_logs(&pool).await.unwrap(), 1);

        let keys = vec!["mainnet-10-0-0".to_string(), "mainnet-11-0-0".to_string()];
        let existing = existing_reference_keys(&pool, &keys).await.unwrap();
        assert!(existing.contains("mainnet-10-0-0"));
        assert!(!existing.contains("mainnet-11-0-0"));
    }

    #[tokio::test]
    async fn test_max_block_number_is_scoped_by_environment_and_contract() {
        let pool = memory_pool().await.unwrap();
        seed(&pool, "mainnet", 10, 0).await;
        seed(&pool, "mainnet", 42, 1).await;
        seed(&pool, "testnet", 99, 0).await;

        let tracked = vec![TOKEN.to_string()];
        assert_eq!(max_block_number(&pool, "mainnet", &tracked).await.unwrap(), Some(42));
        assert_eq!(max_block_number(&pool, "testnet", &tracked).await.unwrap(), Some(99));
        assert_eq!(max_block_number(&pool, "fuji-test", &tracked).await.unwrap(), None);
        assert_eq!(
            max_block_number(&pool, "mainnet", &["0xdead".to_string()]).await.unwrap(),
            None
        );

        let logs = get_logs(&pool, "mainnet", TOKEN).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].block_number, 10);
        assert_eq!(logs[1].data["value"], "1");

        let mainnet = entities::existing_contract_ids(&pool, &[("mainnet".to_string(), TOKEN.to_string())])
            .await
            .unwrap();
        assert_eq!(mainnet.len(), 1);
        assert_eq!(delete_logs_for_contracts(&pool, &mainnet).await.unwrap(), 2);
        assert_eq!(max_block_number(&pool, "testnet", &tracked).await.unwrap(), Some(99));
        assert_eq!(count_logs(&pool).await.unwrap(), 1);
    }
}
