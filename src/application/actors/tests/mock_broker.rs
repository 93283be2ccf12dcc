use crate::domain::entities::exchange::Instrument;
use crate::domain::entities::order::{OrderAck, OrderRequest, OrderStatus, Variety};
use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::repositories::broker_client::{
    BrokerClient, Candle, CandleInterval, FeedCredentials,
};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use zeroize::Zeroizing;

pub fn feed_credentials() -> FeedCredentials {
    FeedCredentials {
        jwt_token: Zeroizing::new("jwt".into()),
        feed_token: Zeroizing::new("feed".into()),
        api_key: Zeroizing::new("key".into()),
        client_code: "A123".into(),
    }
}

/// Broker that fills every order at `fill_price` unless a scripted
/// error or order status is queued first
pub struct MockBroker {
    fill_price: Mutex<f64>,
    place_errors: Mutex<VecDeque<EngineError>>,
    cancel_errors: Mutex<VecDeque<EngineError>>,
    refresh_errors: Mutex<VecDeque<EngineError>>,
    statuses: Mutex<VecDeque<OrderStatus>>,
    pub placed: AtomicU32,
    pub cancelled: AtomicU32,
    pub refreshed: AtomicU32,
}

impl MockBroker {
    pub fn new(fill_price: f64) -> Self {
        Self {
            fill_price: Mutex::new(fill_price),
            place_errors: Mutex::new(VecDeque::new()),
            cancel_errors: Mutex::new(VecDeque::new()),
            refresh_errors: Mutex::new(VecDeque::new()),
            statuses: Mutex::new(VecDeque::new()),
            placed: AtomicU32::new(0),
            cancelled: AtomicU32::new(0),
            refreshed: AtomicU32::new(0),
        }
    }

    pub fn set_fill_price(&self, price: f64) {
        *self.fill_price.lock().unwrap() = price;
    }

    pub fn fail_next_place(&self, error: EngineError) {
        self.place_errors.lock().unwrap().push_back(error);
    }

    pub fn fail_next_cancel(&self, error: EngineError) {
        self.cancel_errors.lock().unwrap().push_back(error);
    }

    pub fn fail_next_refresh(&self, error: EngineError) {
        self.refresh_errors.lock().unwrap().push_back(error);
    }

    pub fn queue_status(&self, status: OrderStatus) {
        self.statuses.lock().unwrap().push_back(status);
    }

    pub fn placed(&self) -> u32 {
        self.placed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    fn name(&self) -> &str {
        "mock"
    }

    async fn place_order(&self, _order: &OrderRequest) -> EngineResult<OrderAck> {
        if let Some(error) = self.place_errors.lock().unwrap().pop_front() {
            return Err(error);
        }
        let n = self.placed.fetch_add(1, Ordering::SeqCst);
        Ok(OrderAck {
            order_id: format!("ord-{}", n),
            unique_order_id: format!("uid-{}", n),
        })
    }

    async fn modify_order(&self, order_id: &str, _order: &OrderRequest) -> EngineResult<OrderAck> {
        Ok(OrderAck {
            order_id: order_id.to_string(),
            unique_order_id: "uid".to_string(),
        })
    }

    async fn cancel_order(&self, _order_id: &str, _variety: Variety) -> EngineResult<()> {
        if let Some(error) = self.cancel_errors.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.cancelled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn order_status(&self, _ack: &OrderAck) -> EngineResult<OrderStatus> {
        if let Some(status) = self.statuses.lock().unwrap().pop_front() {
            return Ok(status);
        }
        Ok(OrderStatus::Complete {
            average_price: *self.fill_price.lock().unwrap(),
            filled_quantity: 10,
        })
    }

    async fn quote(&self, _instrument: &Instrument) -> EngineResult<f64> {
        Ok(*self.fill_price.lock().unwrap())
    }

    async fn candles(
        &self,
        _instrument: &Instrument,
        _interval: CandleInterval,
        _from: NaiveDateTime,
        _to: NaiveDateTime,
    ) -> EngineResult<Vec<Candle>> {
        Ok(Vec::new())
    }

    async fn refresh_session(&self) -> EngineResult<()> {
        if let Some(error) = self.refresh_errors.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.refreshed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn feed_credentials(&self) -> EngineResult<FeedCredentials> {
        Ok(feed_credentials())
    }
}
