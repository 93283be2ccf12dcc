//! Database Repository
//!
//! SQLite implementation of the engine's activity store.

use super::models::{direction_to_db, PositionRecord};
use super::{DatabaseError, DbPool};
use crate::domain::entities::position::Position;
use crate::domain::entities::trade::ClosedTrade;
use crate::domain::errors::EngineResult;
use crate::domain::repositories::activity_store::ActivityStore;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, warn};

pub struct SqliteActivityStore {
    pool: DbPool,
}

impl SqliteActivityStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn insert_open(&self, account_id: &str, position: &Position) -> Result<(), DatabaseError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // A stale open row means the previous run died before recording the close
        let stale = sqlx::query(
            "UPDATE positions SET status = 'closed', closed_at = ?1, updated_at = ?1 \
             WHERE account_id = ?2 AND symbol = ?3 AND status = 'open'",
        )
        .bind(now)
        .bind(account_id)
        .bind(&position.symbol)
        .execute(&mut *tx)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to retire stale position: {}", e)))?
        .rows_affected();
        if stale > 0 {
            warn!(
                "Retired {} stale open row(s) for {} on account {}",
                stale, position.symbol, account_id
            );
        }

        sqlx::query(
            r#"
            INSERT INTO positions (
                account_id, symbol, exchange, token, direction, entry_price, quantity,
                stop_loss, target, status, signal_id, broker_order_id, opened_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'open', ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(account_id)
        .bind(&position.symbol)
        .bind(position.instrument.exchange.name())
        .bind(&position.instrument.token)
        .bind(direction_to_db(position.direction))
        .bind(position.entry_price)
        .bind(i64::from(position.quantity))
        .bind(position.stop_loss)
        .bind(position.target)
        .bind(&position.signal_id)
        .bind(&position.broker_order_id)
        .bind(position.opened_at)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to create position: {}", e);
            DatabaseError::QueryError(format!("Failed to create position: {}", e))
        })?;

        tx.commit().await?;
        debug!("Recorded open position {} for {}", position.symbol, account_id);
        Ok(())
    }

    async fn set_stop_loss(
        &self,
        account_id: &str,
        symbol: &str,
        stop_loss: f64,
    ) -> Result<(), DatabaseError> {
        let rows_affected = sqlx::query(
            "UPDATE positions SET stop_loss = ?1, updated_at = ?2 \
             WHERE account_id = ?3 AND symbol = ?4 AND status = 'open'",
        )
        .bind(stop_loss)
        .bind(Utc::now())
        .bind(account_id)
        .bind(symbol)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to update stop-loss for {}: {}", symbol, e);
            DatabaseError::QueryError(format!("Failed to update stop-loss: {}", e))
        })?
        .rows_affected();

        if rows_affected == 0 {
            return Err(DatabaseError::QueryError(format!(
                "Open position not found: {}",
                symbol
            )));
        }
        Ok(())
    }

    async fn insert_close(&self, account_id: &str, trade: &ClosedTrade) -> Result<(), DatabaseError> {
        let position = &trade.position;
        let mut tx = self.pool.begin().await?;

        let rows_affected = sqlx::query(
            "UPDATE positions SET status = 'closed', closed_at = ?1, updated_at = ?1 \
             WHERE account_id = ?2 AND symbol = ?3 AND status = 'open'",
        )
        .bind(trade.closed_at)
        .bind(account_id)
        .bind(&position.symbol)
        .execute(&mut *tx)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to close position: {}", e)))?
        .rows_affected();
        if rows_affected == 0 {
            warn!(
                "No open row for {} on account {}; recording trade only",
                position.symbol, account_id
            );
        }

        sqlx::query(
            r#"
            INSERT INTO trades (
                account_id, symbol, exchange, direction, quantity, entry_price, exit_price,
                realized_pnl, exit_reason, entry_order_id, exit_order_id, opened_at, closed_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(account_id)
        .bind(&position.symbol)
        .bind(position.instrument.exchange.name())
        .bind(direction_to_db(position.direction))
        .bind(i64::from(position.quantity))
        .bind(position.entry_price)
        .bind(trade.exit_price)
        .bind(trade.realized_pnl)
        .bind(trade.exit_reason.to_string())
        .bind(&position.broker_order_id)
        .bind(&trade.exit_order_id)
        .bind(position.opened_at)
        .bind(trade.closed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to create trade: {}", e);
            DatabaseError::QueryError(format!("Failed to create trade: {}", e))
        })?;

        tx.commit().await?;
        debug!(
            "Recorded close of {} for {} (pnl {:.2})",
            position.symbol, account_id, trade.realized_pnl
        );
        Ok(())
    }

    async fn open_positions(&self, account_id: &str) -> Result<Vec<Position>, DatabaseError> {
        let records = sqlx::query_as::<_, PositionRecord>(
            "SELECT * FROM positions WHERE account_id = ?1 AND status = 'open' ORDER BY opened_at",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to load open positions: {}", e);
            DatabaseError::QueryError(format!("Failed to load open positions: {}", e))
        })?;

        let mut positions = Vec::with_capacity(records.len());
        for record in records {
            let id = record.id;
            match Position::try_from(record) {
                Ok(position) => positions.push(position),
                Err(e) => warn!("Skipping corrupt position row {}: {}", id, e),
            }
        }
        Ok(positions)
    }

    /// Realised P&L of all trades closed for an account
    pub async fn realized_pnl(&self, account_id: &str) -> Result<f64, DatabaseError> {
        let (total,): (Option<f64>,) =
            sqlx::query_as("SELECT SUM(realized_pnl) FROM trades WHERE account_id = ?1")
                .bind(account_id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| DatabaseError::QueryError(format!("Failed to sum pnl: {}", e)))?;
        Ok(total.unwrap_or(0.0))
    }
}

#[async_trait]
impl ActivityStore for SqliteActivityStore {
    async fn record_open(&self, account_id: &str, position: &Position) -> EngineResult<()> {
        Ok(self.insert_open(account_id, position).await?)
    }

    async fn update_stop_loss(
        &self,
        account_id: &str,
        symbol: &str,
        stop_loss: f64,
    ) -> EngineResult<()> {
        Ok(self.set_stop_loss(account_id, symbol, stop_loss).await?)
    }

    async fn record_close(&self, account_id: &str, trade: &ClosedTrade) -> EngineResult<()> {
        Ok(self.insert_close(account_id, trade).await?)
    }

    async fn load_open_positions(&self, account_id: &str) -> EngineResult<Vec<Position>> {
        Ok(self.open_positions(account_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::exchange::{Exchange, Instrument};
    use crate::domain::entities::position::Direction;
    use crate::domain::entities::trade::ExitReason;
    use crate::domain::errors::EngineError;
    use crate::persistence::init_database;

    async fn store() -> SqliteActivityStore {
        SqliteActivityStore::new(init_database("sqlite::memory:").await.unwrap())
    }

    fn position(symbol: &str) -> Position {
        Position::new(
            Instrument::new(Exchange::Nse, "3045", symbol),
            Direction::Long,
            100.0,
            10,
            98.0,
            106.0,
        )
        .unwrap()
        .with_broker_order_id("ord-1")
    }

    #[tokio::test]
    async fn test_open_then_load() {
        let store = store().await;
        store.record_open("acc", &position("SBIN-EQ")).await.unwrap();
        store.record_open("other", &position("INFY-EQ")).await.unwrap();

        let loaded = store.load_open_positions("acc").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].symbol, "SBIN-EQ");
        assert_eq!(loaded[0].broker_order_id.as_deref(), Some("ord-1"));
    }

    #[tokio::test]
    async fn test_reopen_retires_stale_row() {
        let store = store().await;
        store.record_open("acc", &position("SBIN-EQ")).await.unwrap();
        store.record_open("acc", &position("SBIN-EQ")).await.unwrap();
        assert_eq!(store.load_open_positions("acc").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_loss_update() {
        let store = store().await;
        store.record_open("acc", &position("SBIN-EQ")).await.unwrap();
        store.update_stop_loss("acc", "SBIN-EQ", 99.5).await.unwrap();

        let loaded = store.load_open_positions("acc").await.unwrap();
        assert_eq!(loaded[0].stop_loss, 99.5);

        let missing = store.update_stop_loss("acc", "TCS-EQ", 1.0).await.unwrap_err();
        assert!(matches!(missing, EngineError::Persistence(_)));
    }

    #[tokio::test]
    async fn test_close_moves_position_to_trades() {
        let store = store().await;
        let open = position("SBIN-EQ");
        store.record_open("acc", &open).await.unwrap();

        let trade = ClosedTrade::new(open, 107.0, ExitReason::Target, Some("ord-2".into()));
        store.record_close("acc", &trade).await.unwrap();

        assert!(store.load_open_positions("acc").await.unwrap().is_empty());
        assert_eq!(store.realized_pnl("acc").await.unwrap(), 70.0);
    }
}
