// Get-or-create helpers for the rows a transaction log hangs off:
// environment, block, txn, event name and contract. Rows are never mutated
// after creation.

use sqlx::{Pool, Row, Sqlite, SqliteConnection};

pub async fn environment_id(conn: &mut SqliteConnection, environment: &str) -> Result<i64, sqlx::Error> {
    sqlx::query("INSERT INTO environment (environment) VALUES (?) ON CONFLICT(environment) DO NOTHING")
        .bind(environment)
        .execute(&mut *conn)
        .await?;

    let row = sqlx::query("SELECT id FROM environment WHERE environment = ?")
        .bind(environment)
        .fetch_one(&mut *conn)
        .await?;

    Ok(row.get("id"))
}

pub async fn block_id(
    conn: &mut SqliteConnection,
    environment_id: i64,
    block_number: u64,
    timestamp: i64,
) -> Result<i64, sqlx::Error> {
    let block_number = block_number as i64;

    sqlx::query(
        "INSERT INTO block (environment_id, block_number, timestamp) VALUES (?, ?, ?)
         ON CONFLICT(environment_id, block_number) DO NOTHING",
    )
    .bind(environment_id)
    .bind(block_number)
    .bind(timestamp)
    .execute(&mut *conn)
    .await?;

    let row = sqlx::query("SELECT id FROM block WHERE environment_id = ? AND block_number = ?")
        .bind(environment_id)
        .bind(block_number)
        .fetch_one(&mut *conn)
        .await?;

    Ok(row.get("id"))
}

/// Fails with `RowNotFound` when the block already holds a different
/// transaction at `index`.
pub async fn txn_id(
    conn: &mut SqliteConnection,
    block_id: i64,
    hash: &str,
    index: u64,
) -> Result<i64, sqlx::Error> {
    let index = index as i64;

    sqlx::query("INSERT INTO txn (block_id, hash, idx) VALUES (?, ?, ?) ON CONFLICT DO NOTHING")
        .bind(block_id)
        .bind(hash)
        .bind(index)
        .execute(&mut *conn)
        .await?;

    let row = sqlx::query("SELECT id FROM txn WHERE block_id = ? AND hash = ? AND idx = ?")
        .bind(block_id)
        .bind(hash)
        .bind(index)
        .fetch_one(&mut *conn)
        .await?;

    Ok(row.get("id"))
}

pub async fn event_name_id(conn: &mut SqliteConnection, event_name: &str) -> Result<i64, sqlx::Error> {
    sqlx::query("INSERT INTO event_name (event_name) VALUES (?) ON CONFLICT(event_name) DO NOTHING")
        .bind(event_name)
        .execute(&mut *conn)
        .await?;

    let row = sqlx::query("SELECT id FROM event_name WHERE event_name = ?")
        .bind(event_name)
        .fetch_one(&mut *conn)
        .await?;

    Ok(row.get("id"))
}

pub async fn contract_id(
    conn: &mut SqliteConnection,
    address: &str,
    environment_id: i64,
) -> Result<i64, sqlx::Error> {
    sqlx::query(
        "INSERT INTO contract (address, environment_id) VALUES (?, ?)
         ON CONFLICT(address, environment_id) DO NOTHING",
    )
    .bind(address)
    .bind(environment_id)
    .execute(&mut *conn)
    .await?;

    let row = sqlx::query("SELECT id FROM contract WHERE address = ? AND environment_id = ?")
        .bind(address)
        .bind(environment_id)
        .fetch_one(&mut *conn)
        .await?;

    Ok(row.get("id"))
}

/// Ids of the already stored contracts among `(environment, address)` pairs.
/// Pairs never persisted are left out.
pub async fn existing_contract_ids(
    pool: &Pool<Sqlite>,
    contracts: &[(String, String)],
) -> Result<Vec<i64>, sqlx::Error> {
    let mut ids = Vec::with_capacity(contracts.len());
    for (environment, address) in contracts {
        let row = sqlx::query(
            "SELECT c.id FROM contract c
             JOIN environment e ON c.environment_id = e.id
             WHERE e.environment = ? AND c.address = ?",
        )
        .bind(environment)
        .bind(address)
        .fetch_optional(pool)
        .await?;

        if let Some(row) = row {
            ids.push(row.get("id"));
        }
    }

    ids.sort_unstable();
    ids.dedup();
    Ok(ids)
}
