//! Persistence Layer
//!
//! Activity log for the engine: open positions (so a restart can resume them)
//! and closed trades with realised P&L. Uses SQLite with async operations via sqlx.
//!
//! # Database Schema
//!
//! ## Positions Table
//! - id: Serial
//! - account_id: Trading account the engine runs for
//! - symbol / exchange / token: Instrument
//! - direction: "long" or "short"
//! - entry_price, quantity, stop_loss, target
//! - status: "open" or "closed" (at most one open row per account and symbol)
//! - signal_id, broker_order_id: Optional provenance
//! - opened_at, closed_at, updated_at: Timestamps
//!
//! ## Trades Table
//! - id: Serial
//! - account_id, symbol, exchange, direction, quantity
//! - entry_price, exit_price, realized_pnl
//! - exit_reason: stop_loss, target, square_off, manual, risk_breach
//! - entry_order_id, exit_order_id
//! - opened_at, closed_at

pub mod in_memory;
pub mod models;
pub mod repository;

use crate::domain::errors::EngineError;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Database connection pool
pub type DbPool = SqlitePool;

/// Database initialization error
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Database connection error: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Query error: {0}")]
    QueryError(String),
}

impl From<DatabaseError> for EngineError {
    fn from(error: DatabaseError) -> Self {
        EngineError::Persistence(error.to_string())
    }
}

/// Initialize the database connection pool and run migrations
///
/// `database_url` is a SQLite URL such as `sqlite://data/engine.db` or `sqlite::memory:`.
pub async fn init_database(database_url: &str) -> Result<DbPool, DatabaseError> {
    info!("Initializing database: {}", database_url);

    if let Some(db_path) = database_url.strip_prefix("sqlite://") {
        if let Some(parent) = Path::new(db_path).parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::ConnectionError(sqlx::Error::Configuration(Box::new(e)))
            })?;
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .log_statements(tracing::log::LevelFilter::Debug);

    // Every in-memory connection is its own database
    let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;

    info!("✓ Database initialized successfully");

    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), DatabaseError> {
    info!("Running database migrations...");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS positions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT NOT NULL,
            symbol TEXT NOT NULL,
            exchange TEXT NOT NULL,
            token TEXT NOT NULL,
            direction TEXT NOT NULL CHECK(direction IN ('long', 'short')),
            entry_price REAL NOT NULL,
            quantity INTEGER NOT NULL CHECK(quantity > 0),
            stop_loss REAL NOT NULL,
            target REAL NOT NULL,
            status TEXT NOT NULL CHECK(status IN ('open', 'closed')),
            signal_id TEXT,
            broker_order_id TEXT,
            opened_at DATETIME NOT NULL,
            closed_at DATETIME,
            updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| {
        DatabaseError::MigrationError(format!("Failed to create positions table: {}", e))
    })?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS trades (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT NOT NULL,
            symbol TEXT NOT NULL,
            exchange TEXT NOT NULL,
            direction TEXT NOT NULL CHECK(direction IN ('long', 'short')),
            quantity INTEGER NOT NULL,
            entry_price REAL NOT NULL,
            exit_price REAL NOT NULL,
            realized_pnl REAL NOT NULL,
            exit_reason TEXT NOT NULL,
            entry_order_id TEXT,
            exit_order_id TEXT,
            opened_at DATETIME NOT NULL,
            closed_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::MigrationError(format!("Failed to create trades table: {}", e)))?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_positions_open \
         ON positions(account_id, symbol) WHERE status = 'open'",
    )
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::MigrationError(format!("Failed to create index: {}", e)))?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(account_id, status)")
        .execute(pool)
        .await
        .map_err(|e| DatabaseError::MigrationError(format!("Failed to create index: {}", e)))?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_closed_at ON trades(account_id, closed_at)")
        .execute(pool)
        .await
        .map_err(|e| DatabaseError::MigrationError(format!("Failed to create index: {}", e)))?;

    info!("✓ Database migrations completed successfully");

    Ok(())
}
