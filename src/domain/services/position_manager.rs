//! PositionManager service - the single authoritative book of open positions,
//! keyed by symbol, with every mutation serialized through one lock

use crate::domain::entities::position::{validate_levels, Position, PositionStatus};
use crate::domain::errors::PositionError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Manager for open positions. At most one position per symbol.
#[derive(Clone, Default)]
pub struct PositionManager {
    positions: Arc<Mutex<HashMap<String, Position>>>,
}

impl PositionManager {
    /// Create an empty position book
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a freshly filled position; rejects a second position for the same symbol
    pub fn add_position(&self, position: Position) -> Result<(), PositionError> {
        validate_levels(
            &position.symbol,
            position.direction,
            position.entry_price,
            position.stop_loss,
            position.target,
        )?;

        let mut positions = self.lock()?;
        if positions.contains_key(&position.symbol) {
            return Err(PositionError::AlreadyOpen(position.symbol.clone()));
        }

        info!(
            "Position opened: {} {} x{} @ {:.2} (stop {:.2}, target {:.2})",
            position.direction,
            position.symbol,
            position.quantity,
            position.entry_price,
            position.stop_loss,
            position.target
        );
        positions.insert(position.symbol.clone(), position);
        Ok(())
    }

    pub fn get_position(&self, symbol: &str) -> Option<Position> {
        match self.positions.lock() {
            Ok(positions) => positions.get(symbol).cloned(),
            Err(_) => None,
        }
    }

    pub fn has_position(&self, symbol: &str) -> bool {
        match self.positions.lock() {
            Ok(positions) => positions.contains_key(symbol),
            Err(_) => false,
        }
    }

    /// Remove a position once its exit has been confirmed
    pub fn remove_position(&self, symbol: &str) -> Result<Position, PositionError> {
        let mut positions = self.lock()?;
        let mut position = positions
            .remove(symbol)
            .ok_or_else(|| PositionError::NotFound(symbol.to_string()))?;
        position.status = PositionStatus::Closed;
        info!("Position closed: {}", symbol);
        Ok(position)
    }

    /// Move the stop-loss in the position's favour.
    ///
    /// Returns `Ok(false)` when `new_stop` equals the current stop, `Ok(true)` when
    /// the stop was tightened. Loosening, or a stop that would break the level
    /// ordering, is rejected and leaves the position untouched.
    pub fn update_stop_loss(&self, symbol: &str, new_stop: f64) -> Result<bool, PositionError> {
        let mut positions = self.lock()?;
        let position = positions
            .get_mut(symbol)
            .ok_or_else(|| PositionError::NotFound(symbol.to_string()))?;

        if position.status != PositionStatus::Open {
            return Err(PositionError::InvalidStatus {
                symbol: symbol.to_string(),
                status: position.status.to_string(),
            });
        }
        if new_stop == position.stop_loss {
            return Ok(false);
        }
        if !position.tightens_stop(new_stop) {
            return Err(PositionError::StopLossLoosened {
                symbol: symbol.to_string(),
                current: position.stop_loss,
                proposed: new_stop,
            });
        }
        validate_levels(
            symbol,
            position.direction,
            position.entry_price,
            new_stop,
            position.target,
        )?;

        debug!(
            "Stop-loss for {} tightened {:.2} -> {:.2}",
            symbol, position.stop_loss, new_stop
        );
        position.stop_loss = new_stop;
        Ok(true)
    }

    /// Snapshot of every position, ordered by symbol. Never the live map.
    pub fn get_all_positions(&self) -> Vec<Position> {
        let mut snapshot: Vec<Position> = match self.positions.lock() {
            Ok(positions) => positions.values().cloned().collect(),
            Err(_) => Vec::new(),
        };
        snapshot.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        snapshot
    }

    pub fn get_position_count(&self) -> usize {
        match self.positions.lock() {
            Ok(positions) => positions.len(),
            Err(_) => 0,
        }
    }

    /// Claim an open position for exit. Only one caller can win the claim.
    pub fn mark_closing(&self, symbol: &str) -> Result<Position, PositionError> {
        let mut positions = self.lock()?;
        let position = positions
            .get_mut(symbol)
            .ok_or_else(|| PositionError::NotFound(symbol.to_string()))?;
        if position.status != PositionStatus::Open {
            return Err(PositionError::InvalidStatus {
                symbol: symbol.to_string(),
                status: position.status.to_string(),
            });
        }
        position.status = PositionStatus::Closing;
        Ok(position.clone())
    }

    /// Revert a claim after the exit order failed
    pub fn reopen(&self, symbol: &str) -> Result<(), PositionError> {
        let mut positions = self.lock()?;
        let position = positions
            .get_mut(symbol)
            .ok_or_else(|| PositionError::NotFound(symbol.to_string()))?;
        if position.status != PositionStatus::Closing {
            return Err(PositionError::InvalidStatus {
                symbol: symbol.to_string(),
                status: position.status.to_string(),
            });
        }
        position.status = PositionStatus::Open;
        warn!("Exit for {} did not complete, position reopened", symbol);
        Ok(())
    }

    /// Shrink a Closing position by the quantity an exit actually executed
    /// and hand the remainder back as Open
    pub fn reduce_after_partial_exit(&self, symbol: &str, filled: u32) -> Result<Position, PositionError> {
        let mut positions = self.lock()?;
        let position = positions
            .get_mut(symbol)
            .ok_or_else(|| PositionError::NotFound(symbol.to_string()))?;
        if position.status != PositionStatus::Closing || filled == 0 || filled >= position.quantity {
            return Err(PositionError::InvalidStatus {
                symbol: symbol.to_string(),
                status: position.status.to_string(),
            });
        }
        position.quantity -= filled;
        position.status = PositionStatus::Open;
        warn!(
            "Exit for {} filled {}, {} left open",
            symbol, filled, position.quantity
        );
        Ok(position.clone())
    }

    /// Seed the book with positions loaded from the activity store.
    ///
    /// Returns how many were restored; duplicates and invalid records are skipped.
    pub fn restore(&self, restored: Vec<Position>) -> Result<usize, PositionError> {
        let mut positions = self.lock()?;
        let mut count = 0;
        for mut position in restored {
            if positions.contains_key(&position.symbol) {
                warn!("Skipping restore of {}: already in book", position.symbol);
                continue;
            }
            if let Err(e) = validate_levels(
                &position.symbol,
                position.direction,
                position.entry_price,
                position.stop_loss,
                position.target,
            ) {
                warn!("Skipping restore of {}: {}", position.symbol, e);
                continue;
            }
            position.status = PositionStatus::Open;
            positions.insert(position.symbol.clone(), position);
            count += 1;
        }
        if count > 0 {
            info!("Restored {} open positions", count);
        }
        Ok(count)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Position>>, PositionError> {
        self.positions.lock().map_err(|_| PositionError::LockPoisoned)
    }
}
