use super::{Projection, ProjectionError};
use crate::db::token_balance;
use crate::models::EventRecord;
use crate::validation::{address_key, normalize_address};
use alloy::primitives::{Address, I256};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

pub const NAME: &str = "token_balance";

/// Running balances from ERC-20 style `Transfer(from, to, value)` events.
/// Mints and burns (either side the zero address) leave balances untouched.
pub struct TokenBalanceProjection;

impl TokenBalanceProjection {
    async fn apply_transfer(
        &self,
        conn: &mut SqliteConnection,
        contract_id: i64,
        event: &EventRecord,
    ) -> Result<(), ProjectionError> {
        let from = address_arg(event, "from")?;
        let to = address_arg(event, "to")?;

        if from == Address::ZERO || to == Address::ZERO {
            debug!("Skipping mint/burn in {} at block {}", event.txhash, event.block_number);
            return Ok(());
        }

        let value = amount_arg(event, "value")?;
        token_balance::adjust_balance(conn, contract_id, &address_key(&from), -value).await?;
        token_balance::adjust_balance(conn, contract_id, &address_key(&to), value).await?;

        Ok(())
    }
}

impl Projection for TokenBalanceProjection {
    fn name(&self) -> &str {
        NAME
    }

    fn events(&self) -> &[&'static str] {
        &["Transfer"]
    }

    fn apply_event<'a>(
        &'a self,
        conn: &'a mut SqliteConnection,
        contract_id: i64,
        event: &'a EventRecord,
    ) -> BoxFuture<'a, Result<(), ProjectionError>> {
        async move {
            match event.event_name.as_str() {
                "Transfer" => self.apply_transfer(conn, contract_id, event).await,
                _ => Ok(()),
            }
        }
        .boxed()
    }

    fn clear<'a>(&'a self, pool: &'a SqlitePool, contract_ids: &'a [i64]) -> BoxFuture<'a, Result<u64, ProjectionError>> {
        async move { Ok(token_balance::clear(pool, contract_ids).await?) }.boxed()
    }
}

fn required<'a>(event: &'a EventRecord, name: &str) -> Result<&'a Value, ProjectionError> {
    event.arg(name).ok_or_else(|| ProjectionError::MissingArgument {
        event: event.event_name.clone(),
        argument: name.to_string(),
    })
}

fn address_arg(event: &EventRecord, name: &str) -> Result<Address, ProjectionError> {
    let value = required(event, name)?;
    value
        .as_str()
        .and_then(|raw| normalize_address(raw).ok())
        .ok_or_else(|| ProjectionError::InvalidArgument {
            argument: name.to_string(),
            value: value.to_string(),
        })
}

fn amount_arg(event: &EventRecord, name: &str) -> Result<I256, ProjectionError> {
    let value = required(event, name)?;
    value
        .as_str()
        .and_then(|raw| I256::from_dec_str(raw).ok())
        .ok_or_else(|| ProjectionError::InvalidArgument {
            argument: name.to_string(),
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::memory_pool;
    use crate::db::entities;
    use chrono::DateTime;
    use serde_json::{json, Map};

    const ALICE: &str = "0x00000000000000000000000000000000000a11ce";
    const BOB: &str = "0x0000000000000000000000000000000000000b0b";
    const ZERO: &str = "0x0000000000000000000000000000000000000000";

    fn transfer(from: &str, to: &str, value: &str) -> EventRecord {
        let mut args = Map::new();
        args.insert("from".to_string(), json!(from));
        args.insert("to".to_string(), json!(to));
        args.insert("value".to_string(), json!(value));
        EventRecord {
            event_name: "Transfer".to_string(),
            timestamp: DateTime::from_timestamp(1_650_000_000, 0).unwrap(),
            log_index: 0,
            transaction_index: 0,
            txhash: "0x01".to_string(),
            block_number: 150,
            address: "0xB97EF9Ef8734C71904D8002F8b6Bc66Dd9c48a6E".to_string(),
            args,
        }
    }

    #[tokio::test]
    async fn test_transfer_moves_balance() {
        let pool = memory_pool().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let env = entities::environment_id(&mut conn, "mainnet").await.unwrap();
        let contract = entities::contract_id(&mut conn, "0xtoken", env).await.unwrap();

        let projection = TokenBalanceProjection;
        projection
            .apply_event(&mut conn, contract, &transfer(ALICE, BOB, "10"))
            .await
            .unwrap();

        assert_eq!(
            token_balance::get_balance(&mut conn, contract, ALICE).await.unwrap(),
            I256::try_from(-10i64).unwrap()
        );
        assert_eq!(
            token_balance::get_balance(&mut conn, contract, BOB).await.unwrap(),
            I256::try_from(10i64).unwrap()
        );
    }

    #[tokio::test]
    async fn test_mint_and_burn_are_skipped() {
        let pool = memory_pool().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let env = entities::environment_id(&mut conn, "mainnet").await.unwrap();
        let contract = entities::contract_id(&mut conn, "0xtoken", env).await.unwrap();

        let projection = TokenBalanceProjection;
        projection
            .apply_event(&mut conn, contract, &transfer(ZERO, BOB, "10"))
            .await
            .unwrap();
        projection
            .apply_event(&mut conn, contract, &transfer(ALICE, ZERO, "10"))
            .await
            .unwrap();

        assert_eq!(token_balance::get_balance(&mut conn, contract, BOB).await.unwrap(), I256::ZERO);
        assert_eq!(token_balance::get_balance(&mut conn, contract, ALICE).await.unwrap(), I256::ZERO);
    }

    #[tokio::test]
    async fn test_malformed_arguments_are_rejected() {
        let pool = memory_pool().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();

        let mut event = transfer(ALICE, BOB, "not a number");
        assert!(matches!(
            TokenBalanceProjection.apply_event(&mut conn, 1, &event).await,
            Err(ProjectionError::InvalidArgument { .. })
        ));

        event.args.remove("to");
        assert!(matches!(
            TokenBalanceProjection.apply_event(&mut conn, 1, &event).await,
            Err(ProjectionError::MissingArgument { .. })
        ));
    }
}
