//! MarketDataStream - persistent SmartStream connection with tick fan-out.
//!
//! The stream never reconnects by itself. When the socket drops it flips
//! `is_connected` to false and publishes a `StreamEvent`; the owner decides
//! when to call `connect()` again (through the `ErrorHandler`). Subscribed
//! tokens are remembered and replayed on every successful connect.

use crate::domain::entities::exchange::Exchange;
use crate::domain::entities::tick::Tick;
use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::repositories::broker_client::FeedCredentials;
use crate::infrastructure::smartstream_codec::{
    decode_tick, encode_subscription, SubscriptionAction, SubscriptionMode, TokenGroup,
    HEARTBEAT_REQUEST, HEARTBEAT_RESPONSE,
};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock as StdRwLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub type ListenerId = u64;

/// Observer for decoded ticks. Runs on the socket reader task, so it must be quick.
pub trait TickListener: Send + Sync {
    fn on_tick(&self, tick: &Tick) -> Result<(), String>;
}

impl<F> TickListener for F
where
    F: Fn(&Tick) -> Result<(), String> + Send + Sync,
{
    fn on_tick(&self, tick: &Tick) -> Result<(), String> {
        self(tick)
    }
}

/// Connection lifecycle notifications
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Opened,
    Closed { reason: String },
    Error { message: String },
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub url: String,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
}

impl StreamConfig {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            heartbeat_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

type SubscriptionBook = HashMap<SubscriptionMode, BTreeMap<Exchange, BTreeSet<String>>>;

struct Inner {
    config: StreamConfig,
    credentials: RwLock<FeedCredentials>,
    connected: AtomicBool,
    subscriptions: Mutex<SubscriptionBook>,
    listeners: StdRwLock<Vec<(ListenerId, Arc<dyn TickListener>)>>,
    next_listener_id: AtomicU64,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    connection_task: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<StreamEvent>,
}

#[derive(Clone)]
pub struct MarketDataStream {
    inner: Arc<Inner>,
}

impl MarketDataStream {
    pub fn new(config: StreamConfig, credentials: FeedCredentials) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                config,
                credentials: RwLock::new(credentials),
                connected: AtomicBool::new(false),
                subscriptions: Mutex::new(HashMap::new()),
                listeners: StdRwLock::new(Vec::new()),
                next_listener_id: AtomicU64::new(1),
                outbound: Mutex::new(None),
                connection_task: Mutex::new(None),
                events,
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> broadcast::Receiver<StreamEvent> {
        self.inner.events.subscribe()
    }

    /// Install a fresh feed token before the next `connect()`
    pub async fn update_credentials(&self, credentials: FeedCredentials) {
        *self.inner.credentials.write().await = credentials;
        debug!("Feed credentials updated");
    }

    /// Open the streaming session and replay remembered subscriptions
    pub async fn connect(&self) -> EngineResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.abort_connection_task();

        let request = self.build_request().await?;
        let timeout = self.inner.config.connect_timeout;
        let ws = match tokio::time::timeout(timeout, connect_async(request)).await {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(e)) => {
                let error = handshake_error(e);
                let _ = self.inner.events.send(StreamEvent::Error {
                    message: error.to_string(),
                });
                return Err(error);
            }
            Err(_) => {
                let _ = self.inner.events.send(StreamEvent::Error {
                    message: format!("connect timed out after {:?}", timeout),
                });
                return Err(EngineError::Timeout(timeout));
            }
        };

        let (mut write, read) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        if let Ok(mut outbound) = self.inner.outbound.lock() {
            *outbound = Some(tx.clone());
        }

        self.inner.connected.store(true, Ordering::SeqCst);
        let _ = self.inner.events.send(StreamEvent::Opened);
        info!("SmartStream connected to {}", self.inner.config.url);

        let inner = self.inner.clone();
        let heartbeat_every = self.inner.config.heartbeat_interval;
        let task = tokio::spawn(async move {
            let writer = async {
                while let Some(message) = rx.recv().await {
                    if let Err(e) = write.send(message).await {
                        return e.to_string();
                    }
                }
                "outbound channel closed".to_string()
            };
            let heartbeat = async {
                let mut ticker = tokio::time::interval(heartbeat_every);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if tx.send(Message::Text(HEARTBEAT_REQUEST.to_string())).is_err() {
                        break;
                    }
                }
            };

            tokio::select! {
                _ = read_loop(inner.clone(), read) => {}
                reason = writer => inner.mark_error(format!("write failed: {}", reason)),
                _ = heartbeat => {}
            }
        });
        if let Ok(mut slot) = self.inner.connection_task.lock() {
            *slot = Some(task);
        }

        self.resubscribe_all();
        Ok(())
    }

    /// Close the session. Subscriptions are kept for the next `connect()`.
    pub async fn disconnect(&self) {
        let was_connected = self.inner.connected.swap(false, Ordering::SeqCst);
        let sender = self.inner.outbound.lock().ok().and_then(|mut o| o.take());
        if let Some(sender) = sender {
            let _ = sender.send(Message::Close(None));
        }

        let task = self.inner.connection_task.lock().ok().and_then(|mut t| t.take());
        if let Some(mut task) = task {
            if tokio::time::timeout(Duration::from_secs(1), &mut task).await.is_err() {
                task.abort();
            }
        }

        if was_connected {
            let _ = self.inner.events.send(StreamEvent::Closed {
                reason: "disconnect requested".to_string(),
            });
            info!("SmartStream disconnected");
        }
    }

    /// Subscribe tokens. Returns false when not connected or the frame could not be queued.
    pub fn subscribe(&self, mode: SubscriptionMode, groups: &[TokenGroup]) -> bool {
        if !self.is_connected() {
            return false;
        }
        let fresh = match self.inner.subscriptions.lock() {
            Ok(mut book) => {
                let by_exchange = book.entry(mode).or_default();
                let fresh: Vec<TokenGroup> = groups
                    .iter()
                    .map(|group| {
                        let known = by_exchange.entry(group.exchange).or_default();
                        let tokens = group
                            .tokens
                            .iter()
                            .filter(|token| known.insert((*token).clone()))
                            .cloned()
                            .collect();
                        TokenGroup::new(group.exchange, tokens)
                    })
                    .filter(|group| !group.tokens.is_empty())
                    .collect();
                fresh
            }
            Err(_) => return false,
        };

        if fresh.is_empty() {
            return true;
        }
        self.send_subscription(SubscriptionAction::Subscribe, mode, &fresh)
    }

    pub fn unsubscribe(&self, mode: SubscriptionMode, groups: &[TokenGroup]) -> bool {
        if !self.is_connected() {
            return false;
        }
        let removed = match self.inner.subscriptions.lock() {
            Ok(mut book) => {
                let Some(by_exchange) = book.get_mut(&mode) else {
                    return true;
                };
                let removed: Vec<TokenGroup> = groups
                    .iter()
                    .filter_map(|group| {
                        let known = by_exchange.get_mut(&group.exchange)?;
                        let tokens: Vec<String> = group
                            .tokens
                            .iter()
                            .filter(|token| known.remove(token.as_str()))
                            .cloned()
                            .collect();
                        Some(TokenGroup::new(group.exchange, tokens))
                    })
                    .filter(|group| !group.tokens.is_empty())
                    .collect();
                removed
            }
            Err(_) => return false,
        };

        if removed.is_empty() {
            return true;
        }
        self.send_subscription(SubscriptionAction::Unsubscribe, mode, &removed)
    }

    /// Tokens currently subscribed in `mode`
    pub fn subscribed_tokens(&self, mode: SubscriptionMode) -> Vec<(Exchange, String)> {
        match self.inner.subscriptions.lock() {
            Ok(book) => book
                .get(&mode)
                .map(|by_exchange| {
                    by_exchange
                        .iter()
                        .flat_map(|(exchange, tokens)| {
                            tokens.iter().map(move |token| (*exchange, token.clone()))
                        })
                        .collect()
                })
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    pub fn add_tick_callback(&self, listener: Arc<dyn TickListener>) -> ListenerId {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut listeners) = self.inner.listeners.write() {
            listeners.push((id, listener));
        }
        id
    }

    pub fn remove_tick_callback(&self, id: ListenerId) -> bool {
        match self.inner.listeners.write() {
            Ok(mut listeners) => {
                let before = listeners.len();
                listeners.retain(|(listener_id, _)| *listener_id != id);
                listeners.len() != before
            }
            Err(_) => false,
        }
    }

    /// Deliver a tick to every listener; returns how many accepted it
    pub fn dispatch_tick(&self, tick: &Tick) -> usize {
        self.inner.dispatch_tick(tick)
    }

    async fn build_request(
        &self,
    ) -> EngineResult<tokio_tungstenite::tungstenite::handshake::client::Request> {
        let mut request = self
            .inner
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| EngineError::InvalidConfiguration(format!("stream url: {}", e)))?;

        let credentials = self.inner.credentials.read().await;
        let headers = request.headers_mut();
        headers.insert(
            "Authorization",
            header_value(&format!("Bearer {}", credentials.jwt_token.as_str()))?,
        );
        headers.insert("x-api-key", header_value(&credentials.api_key)?);
        headers.insert("x-client-code", header_value(&credentials.client_code)?);
        headers.insert("x-feed-token", header_value(&credentials.feed_token)?);
        Ok(request)
    }

    fn send_subscription(
        &self,
        action: SubscriptionAction,
        mode: SubscriptionMode,
        groups: &[TokenGroup],
    ) -> bool {
        let frame = encode_subscription(&correlation_id(), action, mode, groups);
        let sent = match self.inner.outbound.lock() {
            Ok(outbound) => outbound
                .as_ref()
                .map(|sender| sender.send(Message::Text(frame)).is_ok())
                .unwrap_or(false),
            Err(_) => false,
        };
        if sent {
            debug!("{:?} {:?} sent for {} groups", action, mode, groups.len());
        }
        sent
    }

    fn resubscribe_all(&self) {
        let snapshot: Vec<(SubscriptionMode, Vec<TokenGroup>)> = match self.inner.subscriptions.lock()
        {
            Ok(book) => book
                .iter()
                .map(|(mode, by_exchange)| {
                    let groups = by_exchange
                        .iter()
                        .filter(|(_, tokens)| !tokens.is_empty())
                        .map(|(exchange, tokens)| {
                            TokenGroup::new(*exchange, tokens.iter().cloned().collect())
                        })
                        .collect();
                    (*mode, groups)
                })
                .collect(),
            Err(_) => return,
        };

        for (mode, groups) in snapshot {
            if groups.is_empty() {
                continue;
            }
            if self.send_subscription(SubscriptionAction::Subscribe, mode, &groups) {
                info!("Resubscribed {} token groups in {:?} mode", groups.len(), mode);
            }
        }
    }

    fn abort_connection_task(&self) {
        let task = self.inner.connection_task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl Inner {
    fn dispatch_tick(&self, tick: &Tick) -> usize {
        let listeners: Vec<(ListenerId, Arc<dyn TickListener>)> = match self.listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(_) => return 0,
        };

        let mut delivered = 0;
        for (id, listener) in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener.on_tick(tick))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!("Tick listener {} failed for {}: {}", id, tick.token, e),
                Err(_) => error!("Tick listener {} panicked on {}", id, tick.token),
            }
        }
        delivered
    }

    fn mark_closed(&self, reason: String) {
        if self.connected.swap(false, Ordering::SeqCst) {
            warn!("SmartStream closed: {}", reason);
            let _ = self.events.send(StreamEvent::Closed { reason });
        }
    }

    fn mark_error(&self, message: String) {
        if self.connected.swap(false, Ordering::SeqCst) {
            error!("SmartStream error: {}", message);
            let _ = self.events.send(StreamEvent::Error { message });
        }
    }
}

async fn read_loop(inner: Arc<Inner>, mut read: SplitStream<WsStream>) {
    while let Some(message) = read.next().await {
        match message {
            Ok(Message::Binary(data)) => match decode_tick(&data) {
                Ok(tick) => {
                    inner.dispatch_tick(&tick);
                }
                Err(e) => debug!("Dropping undecodable frame ({} bytes): {}", data.len(), e),
            },
            Ok(Message::Text(text)) if text == HEARTBEAT_RESPONSE => {
                debug!("SmartStream heartbeat acknowledged");
            }
            Ok(Message::Text(text)) => warn!("SmartStream message: {}", text),
            Ok(Message::Close(frame)) => {
                let reason = frame
                    .map(|f| format!("{} {}", f.code, f.reason))
                    .unwrap_or_else(|| "closed by server".to_string());
                inner.mark_closed(reason);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                inner.mark_error(e.to_string());
                return;
            }
        }
    }
    inner.mark_closed("stream ended".to_string());
}

fn handshake_error(error: WsError) -> EngineError {
    match &error {
        WsError::Http(response)
            if response.status() == StatusCode::UNAUTHORIZED
                || response.status() == StatusCode::FORBIDDEN =>
        {
            EngineError::InvalidSession(format!("stream handshake rejected: {}", response.status()))
        }
        _ => EngineError::StreamDisconnected(error.to_string()),
    }
}

fn header_value(value: &str) -> EngineResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| EngineError::InvalidConfiguration("feed credential is not a valid header".into()))
}

/// SmartStream expects a 10 character correlation id
fn correlation_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect()
}
