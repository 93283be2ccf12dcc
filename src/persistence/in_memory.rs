//! In-memory activity store for tests and dry runs.

use crate::domain::entities::position::Position;
use crate::domain::entities::trade::ClosedTrade;
use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::repositories::activity_store::ActivityStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Default)]
struct Book {
    open: HashMap<(String, String), Position>,
    closed: Vec<(String, ClosedTrade)>,
}

#[derive(Default)]
pub struct InMemoryActivityStore {
    book: Mutex<Book>,
    fail_writes: AtomicBool,
}

impl InMemoryActivityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with a persistence error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn closed_trades(&self, account_id: &str) -> Vec<ClosedTrade> {
        self.book
            .lock()
            .map(|book| {
                book.closed
                    .iter()
                    .filter(|(account, _)| account == account_id)
                    .map(|(_, trade)| trade.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn check_writable(&self) -> EngineResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(EngineError::Persistence("store unavailable".to_string()));
        }
        Ok(())
    }

    fn with_book<T>(&self, f: impl FnOnce(&mut Book) -> EngineResult<T>) -> EngineResult<T> {
        let mut book = self
            .book
            .lock()
            .map_err(|_| EngineError::Persistence("store lock poisoned".to_string()))?;
        f(&mut book)
    }
}

#[async_trait]
impl ActivityStore for InMemoryActivityStore {
    async fn record_open(&self, account_id: &str, position: &Position) -> EngineResult<()> {
        self.check_writable()?;
        self.with_book(|book| {
            book.open.insert(
                (account_id.to_string(), position.symbol.clone()),
                position.clone(),
            );
            Ok(())
        })
    }

    async fn update_stop_loss(
        &self,
        account_id: &str,
        symbol: &str,
        stop_loss: f64,
    ) -> EngineResult<()> {
        self.check_writable()?;
        self.with_book(|book| {
            match book.open.get_mut(&(account_id.to_string(), symbol.to_string())) {
                Some(position) => {
                    position.stop_loss = stop_loss;
                    Ok(())
                }
                None => Err(EngineError::Persistence(format!(
                    "Open position not found: {}",
                    symbol
                ))),
            }
        })
    }

    async fn record_close(&self, account_id: &str, trade: &ClosedTrade) -> EngineResult<()> {
        self.check_writable()?;
        self.with_book(|book| {
            book.open
                .remove(&(account_id.to_string(), trade.position.symbol.clone()));
            book.closed.push((account_id.to_string(), trade.clone()));
            Ok(())
        })
    }

    async fn load_open_positions(&self, account_id: &str) -> EngineResult<Vec<Position>> {
        self.with_book(|book| {
            let mut positions: Vec<Position> = book
                .open
                .iter()
                .filter(|((account, _), _)| account == account_id)
                .map(|(_, position)| position.clone())
                .collect();
            positions.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
            Ok(positions)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::exchange::{Exchange, Instrument};
    use crate::domain::entities::position::Direction;
    use crate::domain::entities::trade::ExitReason;
    use crate::domain::errors::Severity;

    fn position() -> Position {
        Position::new(
            Instrument::new(Exchange::Nse, "3045", "SBIN-EQ"),
            Direction::Short,
            100.0,
            5,
            102.0,
            95.0,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let store = InMemoryActivityStore::new();
        store.record_open("acc", &position()).await.unwrap();
        store.update_stop_loss("acc", "SBIN-EQ", 101.0).await.unwrap();
        assert_eq!(store.load_open_positions("acc").await.unwrap()[0].stop_loss, 101.0);

        let trade = ClosedTrade::new(position(), 95.0, ExitReason::Target, None);
        store.record_close("acc", &trade).await.unwrap();
        assert!(store.load_open_positions("acc").await.unwrap().is_empty());
        assert_eq!(store.closed_trades("acc").len(), 1);
        assert!(store.closed_trades("other").is_empty());
    }

    #[tokio::test]
    async fn test_failed_writes_are_warnings() {
        let store = InMemoryActivityStore::new();
        store.set_fail_writes(true);
        let error = store.record_open("acc", &position()).await.unwrap_err();
        assert_eq!(error.severity(), Severity::Warning);
    }
}
