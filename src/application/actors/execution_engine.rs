//! Order Execution Engine
//!
//! One engine per trading account. It owns the position book, the OTR throttle
//! and the error handler, and composes them with the broker client, the market
//! stream, the activity store and the strategy signal source.
//!
//! Two execution contexts touch shared state:
//! - the tick path (stream reader task) evaluates exits and only ever does
//!   short, non-blocking work: price cache update, stop tightening, claiming a
//!   position and handing the exit to a bounded work queue;
//! - the scan loop and the exit worker do everything that talks to the broker.

use crate::application::actors::market_stream::{ListenerId, MarketDataStream, TickListener};
use crate::config::EngineConfig;
use crate::domain::entities::exchange::{Exchange, Instrument};
use crate::domain::entities::order::{OrderAck, OrderRequest, OrderStatus, Variety};
use crate::domain::entities::position::{Position, PositionStatus};
use crate::domain::entities::signal::Signal;
use crate::domain::entities::tick::Tick;
use crate::domain::entities::trade::{ClosedTrade, ExitReason};
use crate::domain::errors::{EngineError, EngineResult, PositionError};
use crate::domain::repositories::activity_store::ActivityStore;
use crate::domain::repositories::broker_client::BrokerClient;
use crate::domain::repositories::signal_source::SignalSource;
use crate::domain::services::error_handler::{ErrorHandler, ErrorSummary, Handled, RetryPolicy};
use crate::domain::services::exit_rules::{exchange_now, ExitDecision, ExitRules};
use crate::domain::services::order_throttle::{OrderThrottleMonitor, ThrottleConfig};
use crate::domain::services::position_manager::PositionManager;
use crate::infrastructure::smartstream_codec::{SubscriptionMode, TokenGroup};
use crate::task_runner::{run_periodic, BackoffConfig, TaskControl};
use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex as AsyncMutex};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Evaluating,
    PlacingOrder,
    PositionOpen,
    Exiting,
    Closed,
    /// Terminal: no new signals, open positions flushed to the store
    Fatal,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EngineState::Idle => "IDLE",
            EngineState::Evaluating => "EVALUATING",
            EngineState::PlacingOrder => "PLACING_ORDER",
            EngineState::PositionOpen => "POSITION_OPEN",
            EngineState::Exiting => "EXITING",
            EngineState::Closed => "CLOSED",
            EngineState::Fatal => "FATAL",
        };
        write!(f, "{}", s)
    }
}

/// What happened to a submitted signal
#[derive(Debug, Clone, PartialEq)]
pub enum SignalOutcome {
    Opened(Position),
    /// Refused before any order was sent
    Rejected(String),
    /// An order was attempted but no position resulted
    Abandoned(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    StateChanged { from: EngineState, to: EngineState },
    SignalRejected { signal_id: String, symbol: String, reason: String },
    SignalAbandoned { signal_id: String, symbol: String, reason: String },
    PositionOpened { symbol: String, entry_price: f64, quantity: u32 },
    StopTrailed { symbol: String, stop_loss: f64 },
    PositionClosed { symbol: String, reason: ExitReason, realized_pnl: f64 },
    Fatal { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub account_id: String,
    pub state: EngineState,
    pub accepting_signals: bool,
    pub stream_connected: bool,
    pub open_positions: usize,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub account_id: String,
    pub min_signal_confidence: f64,
    pub fill_poll_attempts: u32,
    pub fill_poll_interval: Duration,
    pub scan_interval: Duration,
    /// Upper bound for any single broker or store call
    pub call_timeout: Duration,
    pub work_queue_capacity: usize,
    pub exit_rules: ExitRules,
    pub retry_policy: RetryPolicy,
    pub error_buffer_capacity: usize,
    pub throttle: ThrottleConfig,
}

impl EngineSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            account_id: config.account_id.clone(),
            min_signal_confidence: config.min_signal_confidence,
            fill_poll_attempts: config.fill_poll_attempts.max(1),
            fill_poll_interval: Duration::from_millis(config.fill_poll_interval_ms),
            scan_interval: Duration::from_secs(config.scan_interval_secs),
            call_timeout: config.http_timeout(),
            work_queue_capacity: config.tick_queue_capacity.max(1),
            exit_rules: config.exit_rules(),
            retry_policy: config.retry_policy(),
            error_buffer_capacity: config.error_buffer_capacity,
            throttle: config.throttle_config(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// External collaborators an engine is wired to
pub struct EngineDeps {
    pub broker: Arc<dyn BrokerClient>,
    pub store: Arc<dyn ActivityStore>,
    pub signals: Arc<dyn SignalSource>,
    pub stream: MarketDataStream,
}

/// Broker-facing work handed off the tick path
#[derive(Debug)]
enum WorkItem {
    Exit { symbol: String, reason: ExitReason },
    PersistStop { symbol: String, stop_loss: f64 },
}

enum Fill {
    Filled { price: f64, quantity: u32 },
    NotFilled(String),
    Fatal(EngineError),
}

/// Claim on a symbol while its entry order is in flight
struct Reservation<'a> {
    in_flight: &'a Mutex<HashSet<String>>,
    symbol: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.remove(&self.symbol);
        }
    }
}

struct TickRouter(Weak<OrderExecutionEngine>);

impl TickListener for TickRouter {
    fn on_tick(&self, tick: &Tick) -> Result<(), String> {
        match self.0.upgrade() {
            Some(engine) => engine.on_tick(tick),
            None => Ok(()),
        }
    }
}

pub struct OrderExecutionEngine {
    settings: EngineSettings,
    broker: Arc<dyn BrokerClient>,
    store: Arc<dyn ActivityStore>,
    signals: Arc<dyn SignalSource>,
    stream: MarketDataStream,
    positions: PositionManager,
    throttle: OrderThrottleMonitor,
    errors: ErrorHandler,
    state: Mutex<EngineState>,
    fatal: AtomicBool,
    accepting: AtomicBool,
    prices: RwLock<HashMap<(Exchange, String), f64>>,
    routes: RwLock<HashMap<(Exchange, String), String>>,
    in_flight: Mutex<HashSet<String>>,
    work_tx: mpsc::Sender<WorkItem>,
    work_rx: AsyncMutex<Option<mpsc::Receiver<WorkItem>>>,
    shutdown_tx: watch::Sender<bool>,
    events: broadcast::Sender<EngineEvent>,
}

impl OrderExecutionEngine {
    pub fn new(settings: EngineSettings, deps: EngineDeps) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (work_tx, work_rx) = mpsc::channel(settings.work_queue_capacity.max(1));
        let (events, _) = broadcast::channel(256);
        let errors = ErrorHandler::new(settings.retry_policy, settings.error_buffer_capacity)
            .with_shutdown(shutdown_rx);
        let throttle = OrderThrottleMonitor::new(settings.throttle);

        Arc::new(Self {
            settings,
            broker: deps.broker,
            store: deps.store,
            signals: deps.signals,
            stream: deps.stream,
            positions: PositionManager::new(),
            throttle,
            errors,
            state: Mutex::new(EngineState::Idle),
            fatal: AtomicBool::new(false),
            accepting: AtomicBool::new(true),
            prices: RwLock::new(HashMap::new()),
            routes: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            work_tx,
            work_rx: AsyncMutex::new(Some(work_rx)),
            shutdown_tx,
            events,
        })
    }

    pub fn account_id(&self) -> &str {
        &self.settings.account_id
    }

    pub fn positions(&self) -> &PositionManager {
        &self.positions
    }

    pub fn throttle(&self) -> &OrderThrottleMonitor {
        &self.throttle
    }

    pub fn stream(&self) -> &MarketDataStream {
        &self.stream
    }

    pub fn error_summary(&self) -> ErrorSummary {
        self.errors.error_summary()
    }

    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> EngineState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(EngineState::Fatal)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            account_id: self.settings.account_id.clone(),
            state: self.state(),
            accepting_signals: self.is_accepting(),
            stream_connected: self.stream.is_connected(),
            open_positions: self.positions.get_position_count(),
        }
    }

    /// Latest price seen for an instrument, from ticks or quote polling
    pub fn last_price(&self, instrument: &Instrument) -> Option<f64> {
        self.prices
            .read()
            .ok()
            .and_then(|prices| prices.get(&instrument.feed_key()).copied())
    }

    /// Run the engine until shutdown or a fatal error.
    ///
    /// Restores persisted positions, attaches to the market stream, starts the
    /// exit worker and the stream supervisor, then drives the scan loop.
    pub async fn run(self: Arc<Self>) {
        let Some(work_rx) = self.work_rx.lock().await.take() else {
            error!("[{}] Engine is already running", self.account_id());
            return;
        };
        info!("[{}] Engine starting", self.account_id());

        match self.restore_positions().await {
            Ok(0) => {}
            Ok(count) => info!("[{}] Resumed {} open positions", self.account_id(), count),
            Err(e) => {
                let handled = self.errors.report(&e, &self.context("restore", "positions"));
                if handled.is_critical() {
                    self.enter_fatal(&e.to_string()).await;
                }
            }
        }

        let listener_id: ListenerId = self
            .stream
            .add_tick_callback(Arc::new(TickRouter(Arc::downgrade(&self))));
        let worker = tokio::spawn(self.clone().work_loop(work_rx));
        let supervisor = tokio::spawn(self.clone().supervise_stream());

        let engine = self.clone();
        run_periodic(
            &format!("{} scan", self.account_id()),
            self.settings.scan_interval,
            BackoffConfig::default(),
            self.shutdown_tx.subscribe(),
            move || {
                let engine = engine.clone();
                async move { engine.scan().await }
            },
        )
        .await;

        self.accepting.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send_replace(true);
        self.stream.remove_tick_callback(listener_id);
        self.stream.disconnect().await;
        if let Err(e) = supervisor.await {
            warn!("[{}] Stream supervisor ended abnormally: {}", self.account_id(), e);
        }
        if let Err(e) = worker.await {
            warn!("[{}] Exit worker ended abnormally: {}", self.account_id(), e);
        }

        info!(
            "[{}] Engine stopped in state {} with {} open positions",
            self.account_id(),
            self.state(),
            self.positions.get_position_count()
        );
    }

    /// Stop accepting signals and wind the engine down.
    ///
    /// In-flight retries are abandoned at their next backoff boundary. Open
    /// positions stay in the book and in the store for the next start.
    pub fn shutdown(&self) {
        if self.accepting.swap(false, Ordering::SeqCst) {
            info!("[{}] Shutdown requested", self.account_id());
        }
        let _ = self.shutdown_tx.send_replace(true);
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Seed the position book from the activity store
    pub async fn restore_positions(&self) -> EngineResult<usize> {
        let loaded = ErrorHandler::with_timeout(
            self.settings.call_timeout,
            self.store.load_open_positions(&self.settings.account_id),
        )
        .await?;
        let restored = self.positions.restore(loaded)?;
        for position in self.positions.get_all_positions() {
            self.register_route(&position);
        }
        if restored > 0 {
            self.transition(EngineState::PositionOpen);
        }
        Ok(restored)
    }

    /// Evaluate, place and confirm one entry signal
    pub async fn submit_signal(&self, signal: Signal) -> SignalOutcome {
        let symbol = signal.symbol().to_string();
        if !self.is_accepting() {
            return self.reject(&signal, "engine is not accepting signals".to_string());
        }
        if self.settings.exit_rules.square_off_due(exchange_now()) {
            return self.reject(&signal, "past square-off time".to_string());
        }
        self.transition(EngineState::Evaluating);

        if let Err(e) = signal.validate() {
            self.errors.report(&e, &self.context("signal", &symbol));
            return self.reject(&signal, e.to_string());
        }
        if !signal.bypass_screening && signal.confidence < self.settings.min_signal_confidence {
            return self.reject(
                &signal,
                format!(
                    "confidence {:.2} below minimum {:.2}",
                    signal.confidence, self.settings.min_signal_confidence
                ),
            );
        }
        if self.throttle.is_throttled() {
            return self.reject(&signal, "order-to-trade throttle active".to_string());
        }
        let Some(_reservation) = self.reserve(&symbol) else {
            return self.reject(&signal, format!("position already open or pending for {}", symbol));
        };

        self.transition(EngineState::PlacingOrder);
        let context = self.context("entry", &symbol);
        let request = OrderRequest::market(
            signal.instrument.clone(),
            signal.direction.entry_side(),
            signal.quantity,
        )
        .with_tag(signal.id.clone());

        let ack = match self.place(&request, &context).await {
            Ok(ack) => ack,
            Err(e) => return self.abandon(&signal, format!("entry order failed: {}", e)),
        };
        self.throttle.record_placed();

        let (price, quantity) = match self.await_fill(&ack, &context).await {
            Fill::Filled { price, quantity } => (price, quantity),
            Fill::NotFilled(reason) => return self.abandon(&signal, reason),
            Fill::Fatal(e) => {
                self.enter_fatal(&e.to_string()).await;
                return self.abandon(&signal, e.to_string());
            }
        };
        self.throttle.record_executed();

        let position = match Position::new(
            signal.instrument.clone(),
            signal.direction,
            price,
            quantity,
            signal.stop_loss,
            signal.target,
        ) {
            Ok(position) => position
                .with_signal_id(signal.id.clone())
                .with_broker_order_id(ack.order_id.clone()),
            Err(e) => {
                warn!(
                    "[{}] Fill at {:.2} breaks protective levels, exiting immediately",
                    context, price
                );
                self.flatten_breach(&signal, price, quantity, &ack, &context)
                    .await;
                return self.abandon(&signal, format!("fill at {:.2} rejected: {}", price, e));
            }
        };

        if let Err(e) = self.positions.add_position(position.clone()) {
            let error = EngineError::from(e);
            if self.errors.report(&error, &context).is_critical() {
                self.enter_fatal(&error.to_string()).await;
            }
            return self.abandon(&signal, error.to_string());
        }
        self.store_write(
            &context,
            self.store.record_open(&self.settings.account_id, &position),
        )
        .await;

        self.transition(EngineState::PositionOpen);
        info!(
            "[{}] Opened {} {} x{} @ {:.2} (stop {:.2}, target {:.2})",
            self.account_id(),
            position.direction,
            symbol,
            position.quantity,
            position.entry_price,
            position.stop_loss,
            position.target
        );
        let _ = self.events.send(EngineEvent::PositionOpened {
            symbol,
            entry_price: position.entry_price,
            quantity: position.quantity,
        });
        // Last step: from here on ticks may close the position
        self.register_route(&position);
        SignalOutcome::Opened(position)
    }

    /// Tick path entry point. Never awaits.
    pub fn on_tick(&self, tick: &Tick) -> Result<(), String> {
        self.evaluate_price(tick.feed_key(), tick.last_price)
    }

    fn evaluate_price(&self, key: (Exchange, String), price: f64) -> Result<(), String> {
        if let Ok(mut prices) = self.prices.write() {
            prices.insert(key.clone(), price);
        }
        let Some(symbol) = self.routes.read().ok().and_then(|r| r.get(&key).cloned()) else {
            return Ok(());
        };
        let Some(position) = self.positions.get_position(&symbol) else {
            return Ok(());
        };
        if !position.is_open() {
            return Ok(());
        }

        match self.settings.exit_rules.evaluate(&position, price) {
            ExitDecision::Hold => Ok(()),
            ExitDecision::TrailTo(stop_loss) => {
                match self.positions.update_stop_loss(&symbol, stop_loss) {
                    Ok(true) => {
                        debug!("[{}] Trailed {} stop to {:.2}", self.account_id(), symbol, stop_loss);
                        let _ = self.events.send(EngineEvent::StopTrailed {
                            symbol: symbol.clone(),
                            stop_loss,
                        });
                        if self
                            .work_tx
                            .try_send(WorkItem::PersistStop { symbol, stop_loss })
                            .is_err()
                        {
                            warn!("[{}] Work queue full, stop update not persisted", self.account_id());
                        }
                        Ok(())
                    }
                    Ok(false) => Ok(()),
                    // Position moved to Closing between the read and the update
                    Err(PositionError::InvalidStatus { .. }) => Ok(()),
                    Err(e) => Err(e.to_string()),
                }
            }
            ExitDecision::Exit(reason) => self.request_exit(&symbol, reason),
        }
    }

    /// Claim the position and queue its exit without blocking
    fn request_exit(&self, symbol: &str, reason: ExitReason) -> Result<(), String> {
        match self.positions.mark_closing(symbol) {
            Ok(_) => {}
            Err(PositionError::InvalidStatus { .. }) | Err(PositionError::NotFound(_)) => {
                return Ok(());
            }
            Err(e) => return Err(e.to_string()),
        }

        let item = WorkItem::Exit {
            symbol: symbol.to_string(),
            reason,
        };
        if let Err(e) = self.work_tx.try_send(item) {
            let _ = self.positions.reopen(symbol);
            return Err(format!("exit for {} not queued: {}", symbol, e));
        }
        info!("[{}] Exit requested for {} ({})", self.account_id(), symbol, reason);
        self.transition(EngineState::Exiting);
        Ok(())
    }

    /// Manual override: flatten one position now
    pub async fn close_position(&self, symbol: &str) -> EngineResult<ClosedTrade> {
        self.positions.mark_closing(symbol)?;
        self.execute_exit(symbol, ExitReason::Manual).await
    }

    /// Modify an open order. Counts toward the order-to-trade ratio.
    pub async fn modify_order(&self, order_id: &str, request: &OrderRequest) -> EngineResult<OrderAck> {
        let context = self.context("modify", &request.instrument.trading_symbol);
        let broker = self.broker.as_ref();
        let timeout = self.settings.call_timeout;
        let handled = self
            .errors
            .run(&context, move || {
                ErrorHandler::with_timeout(timeout, broker.modify_order(order_id, request))
            })
            .await;
        match handled.result {
            Some(ack) => {
                self.throttle.record_modified();
                Ok(ack)
            }
            None => Err(self.failure(handled, &context).await),
        }
    }

    /// One scan-loop iteration: day roll, square-off, quote fallback, signals
    pub async fn scan(&self) -> Result<TaskControl, String> {
        if self.is_fatal() || self.is_shutting_down() {
            return Ok(TaskControl::Stop);
        }

        let now = exchange_now();
        if self.throttle.roll_day(now.date_naive()) {
            info!("[{}] New trading day {}, OTR counters reset", self.account_id(), now.date_naive());
        }

        if self.settings.exit_rules.square_off_due(now) {
            self.square_off_all().await;
            for signal in self.signals.next_signals().await {
                self.reject(&signal, "past square-off time".to_string());
            }
            return Ok(TaskControl::Continue);
        }

        if !self.stream.is_connected() {
            self.poll_quotes().await;
        }

        for signal in self.signals.next_signals().await {
            if self.is_fatal() {
                break;
            }
            self.submit_signal(signal).await;
        }

        if self.is_fatal() {
            Ok(TaskControl::Stop)
        } else {
            Ok(TaskControl::Continue)
        }
    }

    async fn square_off_all(&self) {
        for position in self.positions.get_all_positions() {
            if !position.is_open() || self.positions.mark_closing(&position.symbol).is_err() {
                continue;
            }
            let item = WorkItem::Exit {
                symbol: position.symbol.clone(),
                reason: ExitReason::SquareOff,
            };
            if self.work_tx.send(item).await.is_err() {
                let _ = self.positions.reopen(&position.symbol);
                warn!("[{}] Square-off for {} not queued", self.account_id(), position.symbol);
                continue;
            }
            info!("[{}] Square-off requested for {}", self.account_id(), position.symbol);
            self.transition(EngineState::Exiting);
        }
    }

    /// Price open positions over REST while the stream is down
    async fn poll_quotes(&self) {
        let broker = self.broker.as_ref();
        let timeout = self.settings.call_timeout;
        for position in self.positions.get_all_positions() {
            if !position.is_open() {
                continue;
            }
            let context = self.context("quote", &position.symbol);
            let instrument = &position.instrument;
            let handled = self
                .errors
                .run(&context, move || ErrorHandler::with_timeout(timeout, broker.quote(instrument)))
                .await;
            if handled.is_critical() {
                let reason = describe(&handled);
                self.enter_fatal(&reason).await;
                return;
            }
            if let Some(price) = handled.result {
                if let Err(e) = self.evaluate_price(instrument.feed_key(), price) {
                    warn!("[{}] {}", context, e);
                }
            }
        }
    }

    async fn work_loop(self: Arc<Self>, mut rx: mpsc::Receiver<WorkItem>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            let item = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => None,
                item = rx.recv() => item,
            };
            let Some(item) = item else {
                break;
            };
            match item {
                WorkItem::Exit { symbol, reason } => {
                    if let Err(e) = self.execute_exit(&symbol, reason).await {
                        warn!("[{}] Exit for {} did not complete: {}", self.account_id(), symbol, e);
                    }
                }
                WorkItem::PersistStop { symbol, stop_loss } => {
                    let context = self.context("persist stop", &symbol);
                    self.store_write(
                        &context,
                        self.store
                            .update_stop_loss(&self.settings.account_id, &symbol, stop_loss),
                    )
                    .await;
                }
            }
        }

        // Claimed but unexecuted exits go back to Open for the next run
        rx.close();
        while let Ok(item) = rx.try_recv() {
            if let WorkItem::Exit { symbol, .. } = item {
                let _ = self.positions.reopen(&symbol);
            }
        }
        debug!("[{}] Exit worker stopped", self.account_id());
    }

    /// Place and confirm the exit of a position already claimed as Closing
    async fn execute_exit(&self, symbol: &str, reason: ExitReason) -> EngineResult<ClosedTrade> {
        let position = self
            .positions
            .get_position(symbol)
            .ok_or_else(|| PositionError::NotFound(symbol.to_string()))?;
        self.transition(EngineState::Exiting);
        let context = self.context("exit", symbol);

        let (price, filled, order_id) = match self.exit_order(&position, &context).await {
            Ok(filled) => filled,
            Err(e) => {
                if !self.is_fatal() {
                    let _ = self.positions.reopen(symbol);
                    self.transition(EngineState::PositionOpen);
                }
                return Err(e);
            }
        };
        if filled < position.quantity {
            return self
                .book_partial_exit(position, price, filled, order_id, reason, &context)
                .await;
        }

        let removed = self.positions.remove_position(symbol)?;
        self.unregister_route(&removed);
        let trade = ClosedTrade::new(removed, price, reason, Some(order_id));
        self.store_write(
            &context,
            self.store.record_close(&self.settings.account_id, &trade),
        )
        .await;

        info!(
            "[{}] Closed {} @ {:.2} ({}), realised P&L {:.2}",
            self.account_id(),
            symbol,
            price,
            reason,
            trade.realized_pnl
        );
        let _ = self.events.send(EngineEvent::PositionClosed {
            symbol: symbol.to_string(),
            reason,
            realized_pnl: trade.realized_pnl,
        });
        self.transition(EngineState::Closed);
        if self.positions.get_position_count() > 0 {
            self.transition(EngineState::PositionOpen);
        }
        Ok(trade)
    }

    /// Book the executed part of an exit and reopen the rest for the next
    /// tick or scan to flatten
    async fn book_partial_exit(
        &self,
        position: Position,
        price: f64,
        filled: u32,
        order_id: String,
        reason: ExitReason,
        context: &str,
    ) -> EngineResult<ClosedTrade> {
        let remaining = self.positions.reduce_after_partial_exit(&position.symbol, filled)?;
        let mut exited = position;
        exited.quantity = filled;
        exited.status = PositionStatus::Closed;
        let trade = ClosedTrade::new(exited, price, reason, Some(order_id));

        let account_id = self.settings.account_id.as_str();
        self.store_write(context, self.store.record_close(account_id, &trade))
            .await;
        self.store_write(context, self.store.record_open(account_id, &remaining))
            .await;

        warn!(
            "[{}] Exit filled {} of {} @ {:.2}, {} still open",
            context,
            filled,
            filled + remaining.quantity,
            price,
            remaining.quantity
        );
        self.transition(EngineState::PositionOpen);
        Ok(trade)
    }

    /// Market order in the exit direction, confirmed to a fill.
    ///
    /// Returns price, executed quantity and order id. The quantity can be
    /// short of the position's when a cancel cut the order off part-way.
    async fn exit_order(&self, position: &Position, context: &str) -> EngineResult<(f64, u32, String)> {
        let request = OrderRequest::market(
            position.instrument.clone(),
            position.direction.exit_side(),
            position.quantity,
        );
        let ack = self.place(&request, context).await?;
        self.throttle.record_placed();

        match self.await_fill(&ack, context).await {
            Fill::Filled { price, quantity } => {
                self.throttle.record_executed();
                Ok((price, quantity.min(position.quantity), ack.order_id))
            }
            Fill::NotFilled(reason) => Err(EngineError::Broker {
                code: "UNFILLED".to_string(),
                message: reason,
            }),
            Fill::Fatal(e) => {
                self.enter_fatal(&e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Exit a fill that landed outside the signal's levels. Never enters the book.
    async fn flatten_breach(
        &self,
        signal: &Signal,
        price: f64,
        quantity: u32,
        ack: &OrderAck,
        context: &str,
    ) {
        let position = Position {
            symbol: signal.symbol().to_string(),
            instrument: signal.instrument.clone(),
            direction: signal.direction,
            entry_price: price,
            quantity,
            stop_loss: signal.stop_loss,
            target: signal.target,
            opened_at: Utc::now(),
            status: PositionStatus::Closing,
            signal_id: Some(signal.id.clone()),
            broker_order_id: Some(ack.order_id.clone()),
        };

        match self.exit_order(&position, context).await {
            Ok((exit_price, filled, order_id)) => {
                if filled < quantity {
                    error!(
                        "[{}] Protective exit filled {} of {}, {} x{} is UNMANAGED at the broker",
                        context,
                        filled,
                        quantity,
                        signal.symbol(),
                        quantity - filled
                    );
                }
                let mut exited = position;
                exited.quantity = filled;
                let trade = ClosedTrade::new(exited, exit_price, ExitReason::RiskBreach, Some(order_id));
                self.store_write(
                    context,
                    self.store.record_close(&self.settings.account_id, &trade),
                )
                .await;
                let _ = self.events.send(EngineEvent::PositionClosed {
                    symbol: signal.symbol().to_string(),
                    reason: ExitReason::RiskBreach,
                    realized_pnl: trade.realized_pnl,
                });
            }
            Err(e) => {
                error!(
                    "[{}] Protective exit failed, {} x{} is UNMANAGED at the broker: {}",
                    context,
                    signal.symbol(),
                    quantity,
                    e
                );
            }
        }
    }

    /// Place an order through the retry policy. Critical failures halt the engine.
    async fn place(&self, request: &OrderRequest, context: &str) -> EngineResult<OrderAck> {
        let broker = self.broker.as_ref();
        let timeout = self.settings.call_timeout;
        let handled = self
            .errors
            .run(context, move || {
                ErrorHandler::with_timeout(timeout, broker.place_order(request))
            })
            .await;
        match handled.result {
            Some(ack) => {
                debug!("[{}] Order accepted: {}", context, ack.order_id);
                Ok(ack)
            }
            None => Err(self.failure(handled, context).await),
        }
    }

    /// Poll order status until filled; cancel when it does not fill in time.
    ///
    /// Whatever executed before a cancel took effect is reported as the fill,
    /// so no executed quantity goes untracked.
    async fn await_fill(&self, ack: &OrderAck, context: &str) -> Fill {
        let attempts = self.settings.fill_poll_attempts;

        for attempt in 1..=attempts {
            let status = match self.poll_status(ack, context).await {
                Ok(status) => status,
                Err(e) => return Fill::Fatal(e),
            };
            if let Some((price, quantity)) = status.as_ref().and_then(OrderStatus::fill) {
                return Fill::Filled { price, quantity };
            }
            match status {
                Some(OrderStatus::Rejected { reason }) => {
                    return Fill::NotFilled(format!("order {} rejected: {}", ack.order_id, reason));
                }
                Some(OrderStatus::Cancelled { .. }) => {
                    return Fill::NotFilled(format!("order {} cancelled at broker", ack.order_id));
                }
                _ => {}
            }
            if self.is_shutting_down() {
                break;
            }
            debug!("[{}] Order {} not filled yet ({}/{})", context, ack.order_id, attempt, attempts);
            sleep(self.settings.fill_poll_interval).await;
        }

        // Pull the order so a late fill cannot create untracked exposure
        let broker = self.broker.as_ref();
        let timeout = self.settings.call_timeout;
        let order_id = ack.order_id.as_str();
        let cancelled = self
            .errors
            .run(context, move || {
                ErrorHandler::with_timeout(timeout, broker.cancel_order(order_id, Variety::Normal))
            })
            .await;
        if cancelled.is_critical() {
            return Fill::Fatal(take_error(cancelled));
        }
        let cancel_accepted = cancelled.result.is_some();
        if cancel_accepted {
            self.throttle.record_cancelled();
        }

        // The broker refuses to cancel a completed order, and a cancelled one
        // may still carry a partial fill
        let last = match self.poll_status(ack, context).await {
            Ok(status) => status,
            Err(e) => return Fill::Fatal(e),
        };
        if let Some((price, quantity)) = last.as_ref().and_then(OrderStatus::fill) {
            warn!(
                "[{}] Order {} executed {} @ {:.2} while being cancelled",
                context, ack.order_id, quantity, price
            );
            return Fill::Filled { price, quantity };
        }

        if cancel_accepted {
            Fill::NotFilled(format!("order {} not filled in time, cancelled", ack.order_id))
        } else {
            error!(
                "[{}] Could not cancel unfilled order {} (last status {})",
                context,
                ack.order_id,
                last.map(|status| status.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            );
            Fill::NotFilled(format!("order {} not filled in time, cancel failed", ack.order_id))
        }
    }

    /// One status read through the retry policy. `Err` only on Critical.
    async fn poll_status(&self, ack: &OrderAck, context: &str) -> EngineResult<Option<OrderStatus>> {
        let broker = self.broker.as_ref();
        let timeout = self.settings.call_timeout;
        let handled = self
            .errors
            .run(context, move || ErrorHandler::with_timeout(timeout, broker.order_status(ack)))
            .await;
        if handled.is_critical() {
            return Err(take_error(handled));
        }
        Ok(handled.result)
    }

    /// Terminal transition: stop accepting, flush open positions, stop the loops
    pub async fn enter_fatal(&self, reason: &str) {
        if self.fatal.swap(true, Ordering::SeqCst) {
            return;
        }
        self.accepting.store(false, Ordering::SeqCst);
        self.transition(EngineState::Fatal);
        error!("[{}] FATAL: {}. Engine halting", self.account_id(), reason);

        let open = self.positions.get_all_positions();
        for position in &open {
            error!(
                "[{}] Open at halt: {} {} x{} entry {:.2} stop {:.2} target {:.2} ({})",
                self.account_id(),
                position.direction,
                position.symbol,
                position.quantity,
                position.entry_price,
                position.stop_loss,
                position.target,
                position.status
            );
            let context = self.context("flush", &position.symbol);
            self.store_write(
                &context,
                self.store.record_open(&self.settings.account_id, position),
            )
            .await;
        }

        let _ = self.events.send(EngineEvent::Fatal {
            reason: reason.to_string(),
        });
        let _ = self.shutdown_tx.send_replace(true);
    }

    async fn supervise_stream(self: Arc<Self>) {
        let mut events = self.stream.events();
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            if self.is_shutting_down() {
                break;
            }
            if !self.stream.is_connected() && !self.reconnect_stream().await {
                break;
            }

            let stop = tokio::select! {
                event = events.recv() => matches!(event, Err(broadcast::error::RecvError::Closed)),
                _ = shutdown.wait_for(|stop| *stop) => true,
            };
            if stop {
                break;
            }
        }
        debug!("[{}] Stream supervisor stopped", self.account_id());
    }

    /// Reconnect through the retry policy. False when the supervisor should stop.
    async fn reconnect_stream(&self) -> bool {
        let context = self.context("stream", "connect");
        let this = self;
        let handled = self.errors.run(&context, move || this.connect_stream()).await;

        if handled.result.is_some() {
            self.subscribe_open_positions();
            return true;
        }
        if handled.is_critical() {
            let reason = describe(&handled);
            self.enter_fatal(&reason).await;
            return false;
        }
        if self.is_shutting_down() {
            return false;
        }
        let wait = self.settings.retry_policy.max_delay;
        warn!("[{}] Stream still down after retries, next attempt in {:?}", self.account_id(), wait);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::select! {
            _ = sleep(wait) => true,
            _ = shutdown.wait_for(|stop| *stop) => false,
        }
    }

    async fn connect_stream(&self) -> EngineResult<()> {
        match self.broker.feed_credentials().await {
            Ok(credentials) => self.stream.update_credentials(credentials).await,
            Err(e) if e.is_critical() => return Err(e),
            Err(e) => debug!("[{}] Keeping current feed credentials: {}", self.account_id(), e),
        }

        match self.stream.connect().await {
            Err(EngineError::InvalidSession(reason)) => {
                warn!(
                    "[{}] Stream rejected feed token ({}), refreshing session",
                    self.account_id(),
                    reason
                );
                self.broker.refresh_session().await?;
                let credentials = self.broker.feed_credentials().await?;
                self.stream.update_credentials(credentials).await;
                self.stream.connect().await
            }
            other => other,
        }
    }

    fn subscribe_open_positions(&self) {
        let mut by_exchange: HashMap<Exchange, Vec<String>> = HashMap::new();
        if let Ok(routes) = self.routes.read() {
            for (exchange, token) in routes.keys() {
                by_exchange.entry(*exchange).or_default().push(token.clone());
            }
        }
        if by_exchange.is_empty() {
            return;
        }
        let groups: Vec<TokenGroup> = by_exchange
            .into_iter()
            .map(|(exchange, tokens)| TokenGroup::new(exchange, tokens))
            .collect();
        if !self.stream.subscribe(SubscriptionMode::Ltp, &groups) {
            warn!("[{}] Could not subscribe open positions", self.account_id());
        }
    }

    fn register_route(&self, position: &Position) {
        let key = position.instrument.feed_key();
        if let Ok(mut routes) = self.routes.write() {
            routes.insert(key, position.symbol.clone());
        }
        let group = TokenGroup::new(position.instrument.exchange, vec![position.instrument.token.clone()]);
        if !self.stream.subscribe(SubscriptionMode::Ltp, &[group]) {
            debug!(
                "[{}] Stream down, {} will subscribe on reconnect",
                self.account_id(),
                position.symbol
            );
        }
    }

    fn unregister_route(&self, position: &Position) {
        let key = position.instrument.feed_key();
        if let Ok(mut routes) = self.routes.write() {
            routes.remove(&key);
        }
        let group = TokenGroup::new(position.instrument.exchange, vec![position.instrument.token.clone()]);
        self.stream.unsubscribe(SubscriptionMode::Ltp, &[group]);
    }

    fn reserve(&self, symbol: &str) -> Option<Reservation<'_>> {
        let mut in_flight = self.in_flight.lock().ok()?;
        if self.positions.has_position(symbol) || !in_flight.insert(symbol.to_string()) {
            return None;
        }
        Some(Reservation {
            in_flight: &self.in_flight,
            symbol: symbol.to_string(),
        })
    }

    /// Fire-and-forget store write. Any failure is a Warning.
    async fn store_write<F>(&self, context: &str, write: F)
    where
        F: Future<Output = EngineResult<()>>,
    {
        if let Err(e) = ErrorHandler::with_timeout(self.settings.call_timeout, write).await {
            let error = match e {
                EngineError::Persistence(_) => e,
                other => EngineError::Persistence(other.to_string()),
            };
            self.errors.report(&error, context);
        }
    }

    /// Turn an unsuccessful `Handled` into an error, halting on Critical
    async fn failure<T>(&self, handled: Handled<T>, context: &str) -> EngineError {
        let critical = handled.is_critical();
        let error = take_error(handled);
        if critical {
            self.enter_fatal(&format!("{}: {}", context, error)).await;
        }
        error
    }

    fn reject(&self, signal: &Signal, reason: String) -> SignalOutcome {
        warn!("[{}] Signal {} for {} rejected: {}", self.account_id(), signal.id, signal.symbol(), reason);
        let _ = self.events.send(EngineEvent::SignalRejected {
            signal_id: signal.id.clone(),
            symbol: signal.symbol().to_string(),
            reason: reason.clone(),
        });
        SignalOutcome::Rejected(reason)
    }

    fn abandon(&self, signal: &Signal, reason: String) -> SignalOutcome {
        warn!("[{}] Signal {} for {} abandoned: {}", self.account_id(), signal.id, signal.symbol(), reason);
        self.transition(EngineState::Evaluating);
        let _ = self.events.send(EngineEvent::SignalAbandoned {
            signal_id: signal.id.clone(),
            symbol: signal.symbol().to_string(),
            reason: reason.clone(),
        });
        SignalOutcome::Abandoned(reason)
    }

    /// Move to `to` unless already Fatal. Returns false if the move was refused.
    fn transition(&self, to: EngineState) -> bool {
        let from = {
            let Ok(mut state) = self.state.lock() else {
                return false;
            };
            if *state == EngineState::Fatal {
                return false;
            }
            if *state == to {
                return true;
            }
            std::mem::replace(&mut *state, to)
        };
        debug!("[{}] {} -> {}", self.account_id(), from, to);
        let _ = self.events.send(EngineEvent::StateChanged { from, to });
        true
    }

    fn context(&self, operation: &str, subject: &str) -> String {
        format!("{} {} {}", self.settings.account_id, operation, subject)
    }
}

fn take_error<T>(handled: Handled<T>) -> EngineError {
    handled
        .error
        .unwrap_or_else(|| EngineError::Other("operation abandoned".to_string()))
}

fn describe<T>(handled: &Handled<T>) -> String {
    handled
        .error
        .as_ref()
        .map(|e| e.to_string())
        .unwrap_or_else(|| "operation abandoned".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::actors::market_stream::StreamConfig;
    use crate::application::actors::tests::{feed_credentials, MockBroker};
    use crate::domain::entities::order::OrderSide;
    use crate::domain::entities::position::Direction;
    use crate::domain::repositories::signal_source::ChannelSignalSource;
    use crate::persistence::in_memory::InMemoryActivityStore;
    use chrono::NaiveTime;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tokio_tungstenite::tungstenite::http::StatusCode;
    use tokio_tungstenite::tungstenite::protocol::Message;

    fn engine(broker: Arc<MockBroker>) -> (Arc<OrderExecutionEngine>, Arc<InMemoryActivityStore>) {
        engine_with(broker, |_| {})
    }

    fn engine_with(
        broker: Arc<MockBroker>,
        adjust: impl FnOnce(&mut EngineSettings),
    ) -> (Arc<OrderExecutionEngine>, Arc<InMemoryActivityStore>) {
        let store = Arc::new(InMemoryActivityStore::new());
        let mut settings = EngineSettings {
            account_id: "test".to_string(),
            fill_poll_attempts: 2,
            fill_poll_interval: Duration::from_millis(1),
            retry_policy: RetryPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            ..EngineSettings::default()
        };
        settings.exit_rules.square_off = NaiveTime::from_hms_opt(23, 59, 59).unwrap();
        adjust(&mut settings);
        let deps = EngineDeps {
            broker,
            store: store.clone(),
            signals: Arc::new(ChannelSignalSource::new(8)),
            stream: MarketDataStream::new(StreamConfig::new("ws://127.0.0.1:1/ws"), feed_credentials()),
        };
        (OrderExecutionEngine::new(settings, deps), store)
    }

    /// How the feed server treats one incoming connection
    #[derive(Clone, Copy)]
    enum Session {
        /// Refuse the websocket handshake with 401
        Unauthorized,
        /// Close the socket after the first subscription frame
        DropAfterSubscribe,
        /// Stay up until the client leaves
        Hold,
    }

    /// Scripted SmartStream endpoint. Records every subscription frame it sees.
    async fn feed_server(sessions: Vec<Session>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let frames = Arc::new(Mutex::new(Vec::new()));
        let seen = frames.clone();
        tokio::spawn(async move {
            for session in sessions {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                if let Session::Unauthorized = session {
                    let refuse = |_: &Request, _: Response| -> Result<Response, ErrorResponse> {
                        let mut denied = ErrorResponse::new(None);
                        *denied.status_mut() = StatusCode::UNAUTHORIZED;
                        Err(denied)
                    };
                    let _ = tokio_tungstenite::accept_hdr_async(socket, refuse).await;
                    continue;
                }
                let Ok(mut ws) = tokio_tungstenite::accept_async(socket).await else {
                    continue;
                };
                let seen = seen.clone();
                tokio::spawn(async move {
                    while let Some(Ok(message)) = ws.next().await {
                        match message {
                            Message::Text(text) if text.contains("tokenList") => {
                                seen.lock().unwrap().push(text);
                                if let Session::DropAfterSubscribe = session {
                                    let _ = ws.send(Message::Close(None)).await;
                                    break;
                                }
                            }
                            Message::Close(_) => break,
                            _ => {}
                        }
                    }
                });
            }
        });
        (url, frames)
    }

    fn streaming_engine(broker: Arc<MockBroker>, url: &str) -> Arc<OrderExecutionEngine> {
        let mut settings = EngineSettings {
            account_id: "test".to_string(),
            fill_poll_attempts: 2,
            fill_poll_interval: Duration::from_millis(1),
            retry_policy: RetryPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
            },
            ..EngineSettings::default()
        };
        settings.exit_rules.square_off = NaiveTime::from_hms_opt(23, 59, 59).unwrap();
        let deps = EngineDeps {
            broker,
            store: Arc::new(InMemoryActivityStore::new()),
            signals: Arc::new(ChannelSignalSource::new(8)),
            stream: MarketDataStream::new(StreamConfig::new(url), feed_credentials()),
        };
        OrderExecutionEngine::new(settings, deps)
    }

    async fn eventually(what: &str, check: impl Fn() -> bool) {
        let waited = timeout(Duration::from_secs(5), async {
            while !check() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out waiting for {}", what);
    }

    fn signal(id: &str, confidence: f64) -> Signal {
        Signal {
            id: id.to_string(),
            instrument: Instrument::new(Exchange::Nse, "3045", "SBIN-EQ"),
            direction: Direction::Long,
            entry: 100.0,
            stop_loss: 98.0,
            target: 106.0,
            quantity: 10,
            confidence,
            bypass_screening: false,
        }
    }

    #[tokio::test]
    async fn test_low_confidence_rejected_unless_bypassed() {
        let broker = Arc::new(MockBroker::new(100.0));
        let (engine, _) = engine(broker.clone());

        let outcome = engine.submit_signal(signal("s1", 0.2)).await;
        assert!(matches!(outcome, SignalOutcome::Rejected(_)));
        assert_eq!(broker.placed(), 0);

        let mut bypass = signal("s2", 0.2);
        bypass.bypass_screening = true;
        assert!(matches!(engine.submit_signal(bypass).await, SignalOutcome::Opened(_)));
    }

    #[tokio::test]
    async fn test_open_records_counters_and_store() {
        let broker = Arc::new(MockBroker::new(100.5));
        let (engine, store) = engine(broker);

        let SignalOutcome::Opened(position) = engine.submit_signal(signal("s1", 0.9)).await else {
            panic!("expected an open position");
        };
        assert_eq!(position.entry_price, 100.5);
        assert_eq!(position.broker_order_id.as_deref(), Some("ord-0"));
        assert_eq!(position.signal_id.as_deref(), Some("s1"));
        assert_eq!(engine.state(), EngineState::PositionOpen);

        let snapshot = engine.throttle().snapshot();
        assert_eq!(snapshot.placed, 1);
        assert_eq!(snapshot.executed, 1);
        assert_eq!(store.load_open_positions("test").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_business_rejection_abandons_without_retry() {
        let broker = Arc::new(MockBroker::new(100.0));
        let (engine, _) = engine(broker.clone());
        broker.fail_next_place(EngineError::from_broker("AB4008", "Insufficient funds"));

        let outcome = engine.submit_signal(signal("s1", 0.9)).await;
        assert!(matches!(outcome, SignalOutcome::Abandoned(_)));
        assert!(!engine.positions().has_position("SBIN-EQ"));
        assert!(engine.is_accepting());
        assert_eq!(engine.error_summary().warning, 1);

        // The symbol is free again once the attempt is over
        assert!(matches!(engine.submit_signal(signal("s2", 0.9)).await, SignalOutcome::Opened(_)));
    }

    #[tokio::test]
    async fn test_unfilled_order_is_cancelled() {
        let broker = Arc::new(MockBroker::new(100.0));
        let (engine, _) = engine(broker.clone());
        broker.queue_status(OrderStatus::Open);
        broker.queue_status(OrderStatus::Open);

        let outcome = engine.submit_signal(signal("s1", 0.9)).await;
        assert!(matches!(outcome, SignalOutcome::Abandoned(_)));
        assert_eq!(broker.cancelled.load(Ordering::SeqCst), 1);

        let snapshot = engine.throttle().snapshot();
        assert_eq!(snapshot.placed, 1);
        assert_eq!(snapshot.cancelled, 1);
        assert_eq!(snapshot.executed, 0);
    }

    #[tokio::test]
    async fn test_critical_broker_error_enters_fatal() {
        let broker = Arc::new(MockBroker::new(100.0));
        let (engine, _) = engine(broker.clone());
        broker.fail_next_place(EngineError::from_broker("AG8001", "Invalid Token"));

        let outcome = engine.submit_signal(signal("s1", 0.9)).await;
        assert!(matches!(outcome, SignalOutcome::Abandoned(_)));
        assert!(engine.is_fatal());
        assert_eq!(engine.state(), EngineState::Fatal);
        assert!(matches!(engine.scan().await, Ok(TaskControl::Stop)));
    }

    #[tokio::test]
    async fn test_fill_outside_levels_is_flattened() {
        let broker = Arc::new(MockBroker::new(97.0));
        let (engine, store) = engine(broker.clone());

        let outcome = engine.submit_signal(signal("s1", 0.9)).await;
        assert!(matches!(outcome, SignalOutcome::Abandoned(_)));
        assert!(!engine.positions().has_position("SBIN-EQ"));
        // Entry plus protective exit
        assert_eq!(broker.placed(), 2);
        let trades = store.closed_trades("test");
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exit_reason, ExitReason::RiskBreach);
    }

    #[tokio::test]
    async fn test_trailing_stop_on_tick() {
        let broker = Arc::new(MockBroker::new(100.0));
        let (engine, _) = engine(broker);
        engine.submit_signal(signal("s1", 0.9)).await;

        engine.on_tick(&Tick::ltp(Exchange::Nse, "3045", 103.0)).unwrap();
        let position = engine.positions().get_position("SBIN-EQ").unwrap();
        assert_eq!(position.stop_loss, 99.95);
        assert_eq!(
            engine.last_price(&Instrument::new(Exchange::Nse, "3045", "SBIN-EQ")),
            Some(103.0)
        );

        let mut rx = engine.work_rx.lock().await.take().unwrap();
        assert!(matches!(rx.try_recv(), Ok(WorkItem::PersistStop { .. })));
    }

    #[tokio::test]
    async fn test_exit_claim_is_exclusive() {
        let broker = Arc::new(MockBroker::new(100.0));
        let (engine, _) = engine(broker);
        engine.submit_signal(signal("s1", 0.9)).await;

        engine.on_tick(&Tick::ltp(Exchange::Nse, "3045", 97.0)).unwrap();
        engine.on_tick(&Tick::ltp(Exchange::Nse, "3045", 96.0)).unwrap();
        let position = engine.positions().get_position("SBIN-EQ").unwrap();
        assert_eq!(position.status, PositionStatus::Closing);
        assert_eq!(engine.state(), EngineState::Exiting);

        let mut rx = engine.work_rx.lock().await.take().unwrap();
        assert!(matches!(
            rx.try_recv(),
            Ok(WorkItem::Exit { reason: ExitReason::StopLoss, .. })
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unrouted_tick_only_updates_price() {
        let broker = Arc::new(MockBroker::new(100.0));
        let (engine, _) = engine(broker);

        engine.on_tick(&Tick::ltp(Exchange::Bse, "500112", 612.5)).unwrap();
        assert_eq!(
            engine.last_price(&Instrument::new(Exchange::Bse, "500112", "SBIN")),
            Some(612.5)
        );
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[tokio::test]
    async fn test_manual_close() {
        let broker = Arc::new(MockBroker::new(100.0));
        let (engine, store) = engine(broker.clone());
        engine.submit_signal(signal("s1", 0.9)).await;

        broker.set_fill_price(102.0);
        let trade = engine.close_position("SBIN-EQ").await.unwrap();
        assert_eq!(trade.exit_reason, ExitReason::Manual);
        assert_eq!(trade.realized_pnl, 20.0);
        assert!(!engine.positions().has_position("SBIN-EQ"));
        assert_eq!(engine.state(), EngineState::Closed);
        assert_eq!(store.closed_trades("test").len(), 1);

        assert!(engine.close_position("SBIN-EQ").await.is_err());
    }

    #[tokio::test]
    async fn test_failed_exit_reopens_position() {
        let broker = Arc::new(MockBroker::new(100.0));
        let (engine, _) = engine(broker.clone());
        engine.submit_signal(signal("s1", 0.9)).await;

        broker.fail_next_place(EngineError::from_broker("AB4008", "Order rejected"));
        assert!(engine.close_position("SBIN-EQ").await.is_err());
        let position = engine.positions().get_position("SBIN-EQ").unwrap();
        assert_eq!(position.status, PositionStatus::Open);
        assert_eq!(engine.state(), EngineState::PositionOpen);
    }

    #[tokio::test]
    async fn test_restore_positions_from_store() {
        let broker = Arc::new(MockBroker::new(100.0));
        let (engine, store) = engine(broker);
        let position = Position::new(
            Instrument::new(Exchange::Nse, "1594", "INFY-EQ"),
            Direction::Short,
            1500.0,
            2,
            1510.0,
            1480.0,
        )
        .unwrap();
        store.record_open("test", &position).await.unwrap();

        assert_eq!(engine.restore_positions().await.unwrap(), 1);
        assert!(engine.positions().has_position("INFY-EQ"));
        assert_eq!(engine.state(), EngineState::PositionOpen);

        // Restored positions are routed for exits
        engine.on_tick(&Tick::ltp(Exchange::Nse, "1594", 1479.0)).unwrap();
        assert_eq!(
            engine.positions().get_position("INFY-EQ").unwrap().status,
            PositionStatus::Closing
        );
    }

    #[tokio::test]
    async fn test_fatal_is_terminal_and_flushes() {
        let broker = Arc::new(MockBroker::new(100.0));
        let (engine, store) = engine(broker);
        engine.submit_signal(signal("s1", 0.9)).await;

        let mut events = engine.events();
        engine.enter_fatal("session expired").await;
        assert_eq!(engine.state(), EngineState::Fatal);
        assert!(!engine.transition(EngineState::Idle));
        assert!(!engine.is_accepting());
        assert_eq!(store.load_open_positions("test").await.unwrap().len(), 1);

        let mut saw_fatal = false;
        while let Ok(event) = events.try_recv() {
            saw_fatal |= matches!(event, EngineEvent::Fatal { .. });
        }
        assert!(saw_fatal);

        let outcome = engine.submit_signal(signal("s2", 0.9)).await;
        assert!(matches!(outcome, SignalOutcome::Rejected(_)));
    }

    #[tokio::test]
    async fn test_store_failure_does_not_block_open() {
        let broker = Arc::new(MockBroker::new(100.0));
        let (engine, store) = engine(broker);
        store.set_fail_writes(true);

        let outcome = engine.submit_signal(signal("s1", 0.9)).await;
        assert!(matches!(outcome, SignalOutcome::Opened(_)));
        assert!(engine.positions().has_position("SBIN-EQ"));
        assert_eq!(engine.error_summary().warning, 1);
    }

    #[tokio::test]
    async fn test_modify_counts_toward_otr() {
        let broker = Arc::new(MockBroker::new(100.0));
        let (engine, _) = engine(broker);
        let request = OrderRequest::limit(
            Instrument::new(Exchange::Nse, "3045", "SBIN-EQ"),
            OrderSide::Buy,
            10,
            99.0,
        );
        engine.modify_order("ord-7", &request).await.unwrap();
        assert_eq!(engine.throttle().snapshot().modified, 1);
    }

    #[tokio::test]
    async fn test_fill_after_failed_cancel_is_tracked() {
        let broker = Arc::new(MockBroker::new(100.0));
        let (engine, _) = engine(broker.clone());
        broker.queue_status(OrderStatus::Open);
        broker.queue_status(OrderStatus::Open);
        broker.fail_next_cancel(EngineError::from_broker("AB4009", "Order already completed"));

        let SignalOutcome::Opened(position) = engine.submit_signal(signal("s1", 0.9)).await else {
            panic!("late fill must open the position");
        };
        assert_eq!(position.quantity, 10);
        assert!(engine.positions().has_position("SBIN-EQ"));

        let snapshot = engine.throttle().snapshot();
        assert_eq!(snapshot.executed, 1);
        assert_eq!(snapshot.cancelled, 0);
    }

    #[tokio::test]
    async fn test_partial_fill_before_cancel_opens_filled_quantity() {
        let broker = Arc::new(MockBroker::new(100.0));
        let (engine, _) = engine(broker.clone());
        broker.queue_status(OrderStatus::Open);
        broker.queue_status(OrderStatus::Open);
        broker.queue_status(OrderStatus::Cancelled {
            filled_quantity: 4,
            average_price: 100.0,
        });

        let SignalOutcome::Opened(position) = engine.submit_signal(signal("s1", 0.9)).await else {
            panic!("partial fill must open the position");
        };
        assert_eq!(position.quantity, 4);
        assert_eq!(broker.cancelled.load(Ordering::SeqCst), 1);

        let snapshot = engine.throttle().snapshot();
        assert_eq!(snapshot.cancelled, 1);
        assert_eq!(snapshot.executed, 1);
    }

    #[tokio::test]
    async fn test_partial_fill_reported_by_broker_cancel() {
        let broker = Arc::new(MockBroker::new(100.0));
        let (engine, _) = engine(broker.clone());
        broker.queue_status(OrderStatus::Cancelled {
            filled_quantity: 3,
            average_price: 100.2,
        });

        let SignalOutcome::Opened(position) = engine.submit_signal(signal("s1", 0.9)).await else {
            panic!("executed quantity must be tracked");
        };
        assert_eq!(position.quantity, 3);
        assert_eq!(position.entry_price, 100.2);
        assert_eq!(broker.cancelled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_exit_filled_after_failed_cancel_closes() {
        let broker = Arc::new(MockBroker::new(100.0));
        let (engine, store) = engine(broker.clone());
        engine.submit_signal(signal("s1", 0.9)).await;

        broker.queue_status(OrderStatus::Open);
        broker.queue_status(OrderStatus::Open);
        broker.fail_next_cancel(EngineError::from_broker("AB4009", "Order already completed"));
        broker.set_fill_price(102.0);

        let trade = engine.close_position("SBIN-EQ").await.unwrap();
        assert_eq!(trade.realized_pnl, 20.0);
        assert!(!engine.positions().has_position("SBIN-EQ"));
        assert_eq!(broker.placed(), 2);
        assert_eq!(store.closed_trades("test").len(), 1);
    }

    #[tokio::test]
    async fn test_partial_exit_keeps_remainder_open() {
        let broker = Arc::new(MockBroker::new(100.0));
        let (engine, store) = engine(broker.clone());
        engine.submit_signal(signal("s1", 0.9)).await;

        broker.queue_status(OrderStatus::Open);
        broker.queue_status(OrderStatus::Open);
        broker.queue_status(OrderStatus::Cancelled {
            filled_quantity: 4,
            average_price: 102.0,
        });

        let trade = engine.close_position("SBIN-EQ").await.unwrap();
        assert_eq!(trade.position.quantity, 4);
        assert_eq!(trade.realized_pnl, 8.0);

        let remaining = engine.positions().get_position("SBIN-EQ").unwrap();
        assert_eq!(remaining.quantity, 6);
        assert_eq!(remaining.status, PositionStatus::Open);
        assert_eq!(engine.state(), EngineState::PositionOpen);

        let open = store.load_open_positions("test").await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].quantity, 6);

        // The rest can still be flattened
        let rest = engine.close_position("SBIN-EQ").await.unwrap();
        assert_eq!(rest.position.quantity, 6);
        assert!(!engine.positions().has_position("SBIN-EQ"));
    }

    #[tokio::test]
    async fn test_signal_rejected_after_square_off() {
        let broker = Arc::new(MockBroker::new(100.0));
        let (engine, _) = engine_with(broker.clone(), |settings| {
            settings.exit_rules.square_off = NaiveTime::MIN;
        });

        let outcome = engine.submit_signal(signal("s1", 0.9)).await;
        assert!(matches!(outcome, SignalOutcome::Rejected(reason) if reason.contains("square-off")));
        assert_eq!(broker.placed(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_replays_position_subscriptions() {
        let broker = Arc::new(MockBroker::new(100.0));
        let (url, frames) = feed_server(vec![Session::DropAfterSubscribe, Session::Hold]).await;
        let engine = streaming_engine(broker, &url);
        engine.submit_signal(signal("s1", 0.9)).await;

        let supervisor = tokio::spawn(engine.clone().supervise_stream());
        eventually("resubscribe on the second session", || {
            frames.lock().unwrap().len() >= 2
        })
        .await;
        assert!(frames.lock().unwrap().iter().all(|frame| frame.contains("3045")));
        eventually("stream back up", || engine.stream().is_connected()).await;

        engine.shutdown();
        engine.stream().disconnect().await;
        timeout(Duration::from_secs(2), supervisor).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_rejected_feed_token_refreshes_session() {
        let broker = Arc::new(MockBroker::new(100.0));
        let (url, _) = feed_server(vec![Session::Unauthorized, Session::Hold]).await;
        let engine = streaming_engine(broker.clone(), &url);

        let supervisor = tokio::spawn(engine.clone().supervise_stream());
        eventually("stream connected", || engine.stream().is_connected()).await;
        assert_eq!(broker.refreshed.load(Ordering::SeqCst), 1);
        assert!(!engine.is_fatal());

        engine.shutdown();
        engine.stream().disconnect().await;
        timeout(Duration::from_secs(2), supervisor).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_critical_failure_on_reconnect_is_fatal() {
        let broker = Arc::new(MockBroker::new(100.0));
        let (url, _) = feed_server(vec![Session::DropAfterSubscribe, Session::Unauthorized]).await;
        let engine = streaming_engine(broker.clone(), &url);
        engine.submit_signal(signal("s1", 0.9)).await;
        broker.fail_next_refresh(EngineError::from_broker("AG8001", "Invalid Token"));

        let supervisor = tokio::spawn(engine.clone().supervise_stream());
        timeout(Duration::from_secs(5), supervisor).await.unwrap().unwrap();
        assert!(engine.is_fatal());
        assert_eq!(engine.state(), EngineState::Fatal);
        assert_eq!(broker.refreshed.load(Ordering::SeqCst), 0);
    }
}
