//! Activity Store Trait
//!
//! Persistence is an external collaborator. The engine writes open/close records
//! fire-and-forget and reads open positions back once at start so a restart can
//! resume. A failed write is a Warning, never a reason to stop trading.

use crate::domain::entities::position::Position;
use crate::domain::entities::trade::ClosedTrade;
use crate::domain::errors::EngineResult;
use async_trait::async_trait;

#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// Record a newly opened position
    async fn record_open(&self, account_id: &str, position: &Position) -> EngineResult<()>;

    /// Persist a tightened stop-loss
    async fn update_stop_loss(&self, account_id: &str, symbol: &str, stop_loss: f64)
        -> EngineResult<()>;

    /// Record a flattened position and its realised P&L
    async fn record_close(&self, account_id: &str, trade: &ClosedTrade) -> EngineResult<()>;

    /// Positions still open for this account, used to resume after a restart
    async fn load_open_positions(&self, account_id: &str) -> EngineResult<Vec<Position>>;
}
