// Running token balances per (contract, account).
//
// Balances are stored as signed decimal strings since token amounts exceed
// SQLite's 64-bit integers; arithmetic happens in I256.

use crate::models::TokenBalance;
use alloy::primitives::I256;
use sqlx::{Pool, QueryBuilder, Row, Sqlite, SqliteConnection};

fn decode_balance(raw: &str) -> Result<I256, sqlx::Error> {
    I256::from_dec_str(raw).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

pub async fn get_balance(
    conn: &mut SqliteConnection,
    contract_id: i64,
    account: &str,
) -> Result<I256, sqlx::Error> {
    let row = sqlx::query("SELECT balance FROM token_balance WHERE contract_id = ? AND account = ?")
        .bind(contract_id)
        .bind(account)
        .fetch_optional(&mut *conn)
        .await?;

    match row {
        Some(row) => decode_balance(row.get::<&str, _>("balance")),
        None => Ok(I256::ZERO),
    }
}

/// Adds `delta` (possibly negative) to the account's balance, creating the row at zero first.
pub async fn adjust_balance(
    conn: &mut SqliteConnection,
    contract_id: i64,
    account: &str,
    delta: I256,
) -> Result<I256, sqlx::Error> {
    let current = get_balance(conn, contract_id, account).await?;
    let updated = current
        .checked_add(delta)
        .ok_or_else(|| sqlx::Error::Protocol(format!("balance overflow for {}", account)))?;

    sqlx::query(
        "INSERT INTO token_balance (contract_id, account, balance) VALUES (?, ?, ?)
         ON CONFLICT(contract_id, account) DO UPDATE SET balance = excluded.balance",
    )
    .bind(contract_id)
    .bind(account)
    .bind(updated.to_string())
    .execute(&mut *conn)
    .await?;

    Ok(updated)
}

pub async fn balances_for_account(
    pool: &Pool<Sqlite>,
    account: &str,
) -> Result<Vec<TokenBalance>, sqlx::Error> {
    let rows = sqlx::query(
        r#"SELECT e.environment, c.address, tb.account, tb.balance
           FROM token_balance tb
           JOIN contract c ON tb.contract_id = c.id
           JOIN environment e ON c.environment_id = e.id
           WHERE tb.account = ?
           ORDER BY e.environment ASC"#,
    )
    .bind(account)
    .fetch_all(pool)
    .await?;

    let balances = rows
        .iter()
        .map(|row| TokenBalance {
            environment: row.get("environment"),
            contract_address: row.get("address"),
            account: row.get("account"),
            balance: row.get("balance"),
        })
        .collect();

    Ok(balances)
}

/// Sum of the account's balances across every environment and contract.
pub async fn total_balance(pool: &Pool<Sqlite>, account: &str) -> Result<I256, sqlx::Error> {
    let mut total = I256::ZERO;
    for balance in balances_for_account(pool, account).await? {
        total = total
            .checked_add(decode_balance(&balance.balance)?)
            .ok_or_else(|| sqlx::Error::Protocol(format!("balance overflow for {}", account)))?;
    }
    Ok(total)
}

/// Deletes the balances held under the given contracts.
pub async fn clear(pool: &Pool<Sqlite>, contract_ids: &[i64]) -> Result<u64, sqlx::Error> {
    if contract_ids.is_empty() {
        return Ok(0);
    }

    let mut builder = QueryBuilder::<Sqlite>::new("DELETE FROM token_balance WHERE contract_id IN (");
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

    const ALICE: &str = "0x00000000000000000000000000000000000A11cE";

    #[tokio::test]
    async fn test_adjust_and_sum_across_environments() {
        let pool = memory_pool().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();

        let avax = entities::environment_id(&mut conn, "avalanche-mainnet").await.unwrap();
        let polygon = entities::environment_id(&mut conn, "polygon-mainnet").await.unwrap();
        let usdc_avax = entities::contract_id(&mut conn, "0xB97EF9Ef8734C71904D8002F8b6Bc66Dd9c48a6E", avax)
            .await
            .unwrap();
        let usdc_polygon = entities::contract_id(&mut conn, "0x2791Bca1f2de4661ED88A30C99A7a9449Aa84174", polygon)
            .await
            .unwrap();

        adjust_balance(&mut conn, usdc_avax, ALICE, I256::try_from(25i64).unwrap()).await.unwrap();
        adjust_balance(&mut conn, usdc_avax, ALICE, I256::try_from(-10i64).unwrap()).await.unwrap();
        adjust_balance(&mut conn, usdc_polygon, ALICE, I256::try_from(7i64).unwrap()).await.unwrap();
        drop(conn);

        let balances = balances_for_account(&pool, ALICE).await.unwrap();
        assert_eq!(balances.len(), 2);
        assert_eq!(balances[0].balance, "15");
        assert_eq!(total_balance(&pool, ALICE).await.unwrap(), I256::try_from(22i64).unwrap());

        assert_eq!(clear(&pool, &[]).await.unwrap(), 0);
        assert_eq!(clear(&pool, &[usdc_avax]).await.unwrap(), 1);
        assert_eq!(total_balance(&pool, ALICE).await.unwrap(), I256::try_from(7i64).unwrap());
        assert_eq!(clear(&pool, &[usdc_avax, usdc_polygon]).await.unwrap(), 1);
        assert_eq!(total_balance(&pool, ALICE).await.unwrap(), I256::ZERO);
    }

    #[tokio::test]
    async fn test_balance_may_go_negative() {
        let pool = memory_pool().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let env = entities::environment_id(&mut conn, "mainnet").await.unwrap();
        let contract = entities::contract_id(&mut conn, "0xabc", env).await.unwrap();

        let balance = adjust_balance(&mut conn, contract, ALICE, I256::try_from(-3i64).unwrap())
            .await
            .unwrap();
        assert_eq!(balance.to_string(), "-3");
    }
}
