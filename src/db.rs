//! SQLite connection pool.
//!
//! Every pipeline worker writes to the ledger on each step, so the pool
//! holds one connection per worker plus headroom for the dispatching CLI.
//! Writers that find the database locked (another worker, or another
//! `shelf` process) wait up to [`BUSY_TIMEOUT`] before the call fails.

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

use crate::config::Config;

pub const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const MIN_CONNECTIONS: u32 = 5;

/// Open (creating if needed) the configured database in WAL mode with
/// foreign keys enforced.
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections(config))
        .connect_with(options)
        .await?;

    Ok(pool)
}

fn max_connections(config: &Config) -> u32 {
    let workers = u32::try_from(config.processing.workers).unwrap_or(u32::MAX);
    workers.saturating_add(1).max(MIN_CONNECTIONS)
}
