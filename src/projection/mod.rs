// Derived state built from decoded events.
//
// A projection is registered per index and wired to the event names it
// handles. It runs inside the same database transaction that persists the
// event's log row, so it only ever sees each event once.

pub mod token_balance;

pub use token_balance::TokenBalanceProjection;

use crate::db::transaction_log;
use crate::models::EventRecord;
use futures::future::BoxFuture;
use futures::FutureExt;
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProjectionError {
    #[error("Event {event} is missing argument {argument}")]
    MissingArgument { event: String, argument: String },

    #[error("Invalid value for argument {argument}: {value}")]
    InvalidArgument { argument: String, value: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub trait Projection: Send + Sync {
    fn name(&self) -> &str;

    /// Event names this projection consumes.
    fn events(&self) -> &[&'static str];

    fn apply_event<'a>(
        &'a self,
        conn: &'a mut SqliteConnection,
        contract_id: i64,
        event: &'a EventRecord,
    ) -> BoxFuture<'a, Result<(), ProjectionError>>;

    /// Highest block already reflected in this projection's state.
    fn last_block<'a>(
        &'a self,
        pool: &'a SqlitePool,
        environment: &'a str,
        addresses: &'a [String],
    ) -> BoxFuture<'a, Result<Option<u64>, ProjectionError>> {
        async move { Ok(transaction_log::max_block_number(pool, environment, addresses).await?) }.boxed()
    }

    /// Wipes the state derived from the given contract rows. Returns the
    /// number of rows removed.
    fn clear<'a>(&'a self, pool: &'a SqlitePool, contract_ids: &'a [i64]) -> BoxFuture<'a, Result<u64, ProjectionError>>;
}

/// Looks up a projection by the name used in index descriptors.
pub fn by_name(name: &str) -> Option<Arc<dyn Projection>> {
    match name {
        token_balance::NAME => Some(Arc::new(TokenBalanceProjection)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_name() {
        let projection = by_name("token_balance").unwrap();
        assert_eq!(projection.name(), "token_balance");
        assert_eq!(projection.events(), &["Transfer"]);
        assert!(by_name("nft_owner").is_none());
    }
}
