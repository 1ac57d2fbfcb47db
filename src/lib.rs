pub mod blockchain;
pub mod cache;
pub mod config;
pub mod db;
pub mod indexer;
pub mod models;
pub mod projection;
pub mod state;
pub mod validation;

#[cfg(test)]
pub mod tests;

// Re-export specific items for convenience
pub use db::connection;
pub use indexer::{Indexer, IndexerError, RunSummary};
pub use models::EventRecord;
pub use state::AppState;
