pub mod connection;
pub mod entities;
pub mod failed_event;
pub mod token_balance;
pub mod transaction_log;

pub const INIT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS environment (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    environment TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS block (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    environment_id INTEGER NOT NULL,
    block_number INTEGER NOT NULL,
    timestamp INTEGER NOT NULL,
    UNIQUE (environment_id, block_number),
    FOREIGN KEY (environment_id) REFERENCES environment(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS txn (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    block_id INTEGER NOT NULL,
    hash TEXT NOT NULL,
    idx INTEGER NOT NULL,
    UNIQUE (block_id, hash),
    UNIQUE (block_id, idx),
    FOREIGN KEY (block_id) REFERENCES block(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS contract (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    address TEXT NOT NULL,
    environment_id INTEGER NOT NULL,
    UNIQUE (address, environment_id),
    FOREIGN KEY (environment_id) REFERENCES environment(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS event_name (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS transaction_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    txn_id INTEGER NOT NULL,
    contract_id INTEGER NOT NULL,
    event_name_id INTEGER NOT NULL,
    log_index INTEGER NOT NULL,
    data TEXT NOT NULL,
    reference_key TEXT NOT NULL UNIQUE,
    UNIQUE (txn_id, contract_id, log_index),
    FOREIGN KEY (txn_id) REFERENCES txn(id) ON DELETE CASCADE,
    FOREIGN KEY (contract_id) REFERENCES contract(id) ON DELETE CASCADE,
    FOREIGN KEY (event_name_id) REFERENCES event_name(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS token_balance (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    contract_id INTEGER NOT NULL,
    account TEXT NOT NULL,
    balance TEXT NOT NULL DEFAULT '0',
    UNIQUE (contract_id, account),
    FOREIGN KEY (contract_id) REFERENCES contract(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS failed_event (
    reference_key TEXT PRIMARY KEY,
    environment TEXT NOT NULL,
    payload TEXT NOT NULL,
    error TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 1,
    failed_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS read_cache (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    expires_at INTEGER
);

-- Create indexes for efficient querying
CREATE INDEX IF NOT EXISTS idx_block_number ON block(block_number);
CREATE INDEX IF NOT EXISTS idx_txn_hash ON txn(hash);
CREATE INDEX IF NOT EXISTS idx_contract_address ON contract(address);
CREATE INDEX IF NOT EXISTS idx_token_balance_account ON token_balance(account);
CREATE INDEX IF NOT EXISTS idx_failed_event_environment ON failed_event(environment);
"#;

/// Wipes every indexed row, which resets all checkpoints. The read cache is kept.
pub async fn clear_all(pool: &sqlx::SqlitePool) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for table in [
        "transaction_log",
        "token_balance",
        "failed_event",
        "txn",
        "block",
        "event_name",
        "contract",
        "environment",
    ] {
        sqlx::query(&format!("DELETE FROM {}", table))
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}
